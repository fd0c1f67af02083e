use std::{fmt, time::Duration};

use reqwest::Method;

use crate::{Body, ProgressFn, Query, RequestOptions};

/// Deterministic identity of a request, used as the dedup key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `method | url | query | body`, with the method lowercased and query and
    /// body in canonical JSON.
    pub fn compute(method: &Method, url: &str, query: &Query, body: &Body) -> Self {
        Self(format!(
            "{}|{}|{}|{}",
            method.as_str().to_ascii_lowercase(),
            url,
            query.canonical(),
            body.canonical()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retry bookkeeping carried by a request across attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryContext {
    /// Retries already performed, 0 on the first attempt.
    pub attempt: u32,
    /// Whether the latest failure had no response at all.
    pub last_failure_was_network: bool,
}

/// How the final response is handed back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    /// Parsed as JSON and envelope-unwrapped.
    Json,
    /// Returned untouched (downloads, `HEAD`).
    Binary,
}

/// A logical request, reused across retries and token refresh replays.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) query: Query,
    pub(crate) body: Body,
    pub(crate) options: RequestOptions,
    pub(crate) dedupe: bool,
    pub(crate) response_kind: ResponseKind,
    /// Uploads and downloads: dedup off and no default timeout.
    pub(crate) transfer: bool,
    pub(crate) upload_progress: Option<ProgressFn>,
    pub(crate) download_progress: Option<ProgressFn>,
    pub(crate) retry: RetryContext,
    /// Set once this logical request has waited on a token refresh.
    pub(crate) refresh_attempted: bool,
    /// Token obtained from a refresh, used instead of the stored one.
    pub(crate) bearer_override: Option<String>,
    fingerprint: Fingerprint,
}

impl RequestDescriptor {
    /// Creates a JSON request. Dedup defaults to on.
    pub fn new(method: Method, url: impl Into<String>, query: Query, body: Body) -> Self {
        let url = url.into();
        let fingerprint = Fingerprint::compute(&method, &url, &query, &body);
        Self {
            method,
            url,
            query,
            body,
            options: RequestOptions::default(),
            dedupe: true,
            response_kind: ResponseKind::Json,
            transfer: false,
            upload_progress: None,
            download_progress: None,
            retry: RetryContext::default(),
            refresh_attempted: false,
            bearer_override: None,
            fingerprint,
        }
    }

    /// Applies per-request options. An explicit `dedupe` overrides the
    /// default chosen by the constructor.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        if let Some(dedupe) = options.dedupe {
            self.dedupe = dedupe;
        }
        self.options = options;
        self
    }

    pub(crate) fn transfer(mut self) -> Self {
        self.transfer = true;
        self.dedupe = false;
        self
    }

    pub(crate) fn binary(mut self) -> Self {
        self.response_kind = ResponseKind::Binary;
        self
    }

    /// Effective timeout given the client default, `None` meaning unbounded.
    pub(crate) fn timeout(&self, client_default: Duration) -> Option<Duration> {
        let default = (!self.transfer).then_some(client_default);
        self.options.resolve_timeout(default)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn dedupe(&self) -> bool {
        self.dedupe
    }

    pub fn auto_retry(&self) -> bool {
        self.options.auto_retry
    }

    pub fn retry_context(&self) -> RetryContext {
        self.retry
    }

    pub fn refresh_attempted(&self) -> bool {
        self.refresh_attempted
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("dedupe", &self.dedupe)
            .field("retry", &self.retry)
            .field("refresh_attempted", &self.refresh_attempted)
            .field("bearer_override", &self.bearer_override.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}
