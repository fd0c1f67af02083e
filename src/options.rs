use std::time::Duration;

use crate::CancelToken;

/// Configures base URL, timeout, retry and token refresh behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Prefix for relative request paths.
    pub base_url: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base retry backoff in milliseconds (exponential strategy).
    pub retry_backoff_ms: u64,
    /// Token refresh endpoint, relative to `base_url`.
    pub refresh_path: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 500,
            refresh_path: "/auth/refresh".to_owned(),
        }
    }
}

impl ClientOptions {
    /// Reads options from the environment.
    ///
    /// - `RELAY_API_BASE_URL`: required base URL
    /// - `RELAY_REQUEST_TIMEOUT`: optional timeout in milliseconds; missing,
    ///   zero or non-numeric values keep the default
    pub fn from_env() -> std::result::Result<Self, String> {
        let base_url = std::env::var("RELAY_API_BASE_URL")
            .map_err(|_| "missing RELAY_API_BASE_URL environment variable".to_owned())?;
        if base_url.trim().is_empty() {
            return Err("RELAY_API_BASE_URL is set but empty".to_owned());
        }
        let timeout = std::env::var("RELAY_REQUEST_TIMEOUT").ok();
        Ok(Self::from_parts(base_url, timeout.as_deref()))
    }

    fn from_parts(base_url: String, timeout: Option<&str>) -> Self {
        let defaults = Self::default();
        let timeout_ms = timeout
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.timeout_ms);
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_owned(),
            timeout_ms,
            ..defaults
        }
    }
}

/// Per-request overrides accepted by every verb method.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    /// Cancel an in-flight identical request when this one starts.
    /// `None` keeps the verb's default: on for JSON verbs, off for transfers.
    pub dedupe: Option<bool>,
    /// Attach the stored access token as a bearer credential.
    pub with_auth: bool,
    /// Return the whole response envelope instead of its `data` field.
    pub raw_response: bool,
    /// Overrides the client timeout. `Some(0)` disables it.
    pub timeout_ms: Option<u64>,
    /// Retry network failures and 5xx responses.
    pub auto_retry: bool,
    pub cancel: Option<CancelToken>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            dedupe: None,
            with_auth: true,
            raw_response: false,
            timeout_ms: None,
            auto_retry: true,
            cancel: None,
            headers: Vec::new(),
        }
    }
}

impl RequestOptions {
    pub fn dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.with_auth = false;
        self
    }

    pub fn raw_response(mut self) -> Self {
        self.raw_response = true;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.auto_retry = false;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Resolves the effective timeout, `None` meaning no timeout.
    pub(crate) fn resolve_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        match self.timeout_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => default,
        }
    }
}
