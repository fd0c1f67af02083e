use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Method,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{sync::broadcast, time::sleep};

use crate::{
    cancel::first_cancelled,
    decode::{self, decode_value},
    pipeline::{next_step, Reply, Step},
    request::ResponseKind,
    retry::RetryPolicy,
    transfer::disposition_filename,
    wire::{RefreshRequest, TokenPair},
    Body, CancelReason, CancelToken, ClientOptions, CredentialStore, Download, DownloadOptions,
    MemoryCredentialStore, Outcome, PendingRegistry, Query, RefreshCoordinator, RelayError,
    ReqwestTransport, RequestDescriptor, RequestOptions, ResponseMeta, Result, SessionExpired,
    Transport, TransportBody, TransportError, TransportRequest, UploadOptions, UploadSource,
};

/// State shared by every clone of one client.
#[derive(Default)]
struct Shared {
    pending: PendingRegistry,
    refresh: RefreshCoordinator,
}

#[derive(Clone)]
/// HTTP client that adds bearer auth, token refresh, dedup and retry on top
/// of a [`Transport`].
///
/// Clones share the dedup registry and refresh state; separately constructed
/// clients share nothing.
pub struct RelayClient {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    options: ClientOptions,
    retry: RetryPolicy,
    shared: Arc<Shared>,
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient")
            .field("options", &self.options)
            .field("credentials", &"<redacted>")
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

impl RelayClient {
    /// Creates a client for `base_url` with default options, the `reqwest`
    /// transport and an in-memory credential store.
    pub fn new(base_url: impl Into<String>) -> Self {
        let options = ClientOptions {
            base_url: base_url.into(),
            ..ClientOptions::default()
        };
        Self {
            transport: Arc::new(ReqwestTransport::new()),
            credentials: Arc::new(MemoryCredentialStore::new()),
            retry: RetryPolicy::from(&options),
            options,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Creates a client from environment variables.
    ///
    /// See [`ClientOptions::from_env`] for the variables read.
    pub fn from_env() -> std::result::Result<Self, String> {
        let options = ClientOptions::from_env()?;
        Ok(Self::new(options.base_url.clone()).with_options(options))
    }

    /// Replaces all options, base URL included.
    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.retry = RetryPolicy::from(&options);
        self.options = options;
        self
    }

    /// Sends requests through `transport` instead of `reqwest`.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Reads and persists tokens through `credentials`.
    pub fn with_credential_store(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Options this client was configured with.
    pub fn client_options(&self) -> &ClientOptions {
        &self.options
    }

    /// Token store used for the bearer header and refreshes.
    pub fn credentials(&self) -> &dyn CredentialStore {
        self.credentials.as_ref()
    }

    /// `GET url` with `query` encoded into the query string; the envelope's
    /// `data` is decoded into `T`.
    pub async fn get<T, Q>(&self, url: &str, query: &Q) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        self.get_with(url, query, RequestOptions::default()).await
    }

    /// [`get`](Self::get) with per-request options.
    pub async fn get_with<T, Q>(
        &self,
        url: &str,
        query: &Q,
        options: RequestOptions,
    ) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let query = Query::from_serialize(query)?;
        let descriptor =
            RequestDescriptor::new(Method::GET, url, query, Body::Empty).with_options(options);
        self.request(descriptor).await
    }

    /// `POST url` with `body` sent as JSON.
    pub async fn post<T, B>(&self, url: &str, body: &B) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.post_with(url, body, RequestOptions::default()).await
    }

    /// [`post`](Self::post) with per-request options.
    pub async fn post_with<T, B>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_body(Method::POST, url, body, options).await
    }

    /// `PUT url` with `body` sent as JSON.
    pub async fn put<T, B>(&self, url: &str, body: &B) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.put_with(url, body, RequestOptions::default()).await
    }

    /// [`put`](Self::put) with per-request options.
    pub async fn put_with<T, B>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_body(Method::PUT, url, body, options).await
    }

    /// `PATCH url` with `body` sent as JSON.
    pub async fn patch<T, B>(&self, url: &str, body: &B) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.patch_with(url, body, RequestOptions::default()).await
    }

    /// [`patch`](Self::patch) with per-request options.
    pub async fn patch_with<T, B>(
        &self,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_body(Method::PATCH, url, body, options).await
    }

    /// `DELETE url` with `query` encoded into the query string.
    pub async fn delete<T, Q>(&self, url: &str, query: &Q) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        self.delete_with(url, query, RequestOptions::default()).await
    }

    /// [`delete`](Self::delete) with per-request options.
    pub async fn delete_with<T, Q>(
        &self,
        url: &str,
        query: &Q,
        options: RequestOptions,
    ) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let query = Query::from_serialize(query)?;
        self.request(
            RequestDescriptor::new(Method::DELETE, url, query, Body::Empty).with_options(options),
        )
        .await
    }

    /// Fetches status and headers only. Not deduplicated.
    pub async fn head(&self, url: &str) -> Result<Outcome<ResponseMeta>> {
        self.fetch_meta(Method::HEAD, url).await
    }

    /// Sends `OPTIONS url` and returns status and headers, for example to
    /// read `Allow`. Not deduplicated.
    pub async fn options(&self, url: &str) -> Result<Outcome<ResponseMeta>> {
        self.fetch_meta(Method::OPTIONS, url).await
    }

    /// Sends a multipart upload. Not deduplicated and without a timeout
    /// unless `options.request` says otherwise.
    pub async fn upload<T>(
        &self,
        url: &str,
        source: impl Into<UploadSource>,
        options: UploadOptions,
    ) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
    {
        let form = source
            .into()
            .into_form(&options.field_name, options.extra_data);
        let mut descriptor =
            RequestDescriptor::new(Method::POST, url, Query::default(), Body::Multipart(form))
                .transfer()
                .with_options(options.request);
        descriptor.upload_progress = options.on_progress;
        self.request(descriptor).await
    }

    /// Downloads a file into memory. The body is never envelope-unwrapped.
    pub async fn download(&self, url: &str, options: DownloadOptions) -> Result<Outcome<Download>> {
        let query = match &options.query {
            Some(query) => Query::from_serialize(query)?,
            None => Query::default(),
        };
        let body = match &options.body {
            Some(body) if options.method != Method::GET => Body::json(body)?,
            _ => Body::Empty,
        };
        let mut descriptor = RequestDescriptor::new(options.method.clone(), url, query, body)
            .transfer()
            .binary()
            .with_options(options.request);
        descriptor.download_progress = options.on_progress;

        let reply = match self.execute(descriptor).await? {
            Outcome::Completed(reply) => reply,
            Outcome::Cancelled(reason) => return Ok(Outcome::Cancelled(reason)),
        };
        let response = reply.into_binary()?;
        let header_text = |name: header::HeaderName| {
            response
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };
        let filename = options
            .filename
            .or_else(|| {
                header_text(header::CONTENT_DISPOSITION)
                    .and_then(|value| disposition_filename(&value))
            })
            .unwrap_or_else(|| "download".to_owned());
        let content_type = header_text(header::CONTENT_TYPE);

        Ok(Outcome::Completed(Download {
            filename,
            content_type,
            bytes: response.body,
        }))
    }

    /// Runs a prebuilt request through the full pipeline.
    pub async fn request<T: DeserializeOwned>(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<Outcome<T>> {
        match self.execute(descriptor).await? {
            Outcome::Completed(reply) => decode_value(reply.into_json()).map(Outcome::Completed),
            Outcome::Cancelled(reason) => Ok(Outcome::Cancelled(reason)),
        }
    }

    /// New token to pass through [`RequestOptions::cancel_token`]; cancelling it
    /// aborts every request that carries it.
    pub fn create_cancel_token(&self) -> CancelToken {
        CancelToken::new()
    }

    /// Cancels every deduplicated in-flight request and resets refresh state.
    ///
    /// Requests waiting on a token refresh, the one running it included,
    /// resolve as [`CancelReason::CancelAll`]. A refresh call already on the
    /// wire finishes, but its tokens are not stored and a new refresh waits
    /// for it.
    pub fn cancel_all_requests(&self) {
        self.shared.pending.cancel_all(CancelReason::CancelAll);
        self.shared.refresh.reset(CancelReason::CancelAll);
    }

    /// Receives one event per failed token refresh.
    pub fn subscribe_session_expired(&self) -> broadcast::Receiver<SessionExpired> {
        self.shared.refresh.subscribe()
    }

    /// Number of deduplicated requests currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    async fn fetch_meta(&self, method: Method, url: &str) -> Result<Outcome<ResponseMeta>> {
        let mut descriptor =
            RequestDescriptor::new(method, url, Query::default(), Body::Empty).binary();
        descriptor.dedupe = false;
        match self.execute(descriptor).await? {
            Outcome::Completed(reply) => {
                let response = reply.into_binary()?;
                Ok(Outcome::Completed(ResponseMeta {
                    status: response.status,
                    headers: response.headers,
                }))
            }
            Outcome::Cancelled(reason) => Ok(Outcome::Cancelled(reason)),
        }
    }

    async fn send_body<T, B>(
        &self,
        method: Method,
        url: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<Outcome<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let body = Body::json(body)?;
        let descriptor =
            RequestDescriptor::new(method, url, Query::default(), body).with_options(options);
        self.request(descriptor).await
    }

    /// Drives one logical request until it completes, fails or is cancelled.
    async fn execute(&self, mut descriptor: RequestDescriptor) -> Result<Outcome<Reply>> {
        loop {
            if let Some(reason) = descriptor.options.cancel.as_ref().and_then(CancelToken::reason) {
                return Ok(Outcome::Cancelled(reason));
            }

            let request = self.prepare(&descriptor)?;
            let handle = CancelToken::new();
            let registration = descriptor.dedupe.then(|| {
                self.shared
                    .pending
                    .lock(descriptor.fingerprint().clone(), handle.clone())
            });

            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %descriptor.method,
                url = %descriptor.url,
                attempt = descriptor.retry.attempt,
                phase = ?crate::RequestPhase::Dispatched,
                "dispatching request"
            );

            let outcome = tokio::select! {
                biased;
                reason = first_cancelled(&handle, descriptor.options.cancel.as_ref()) => {
                    Err(TransportError::Cancelled(reason))
                }
                result = self.transport.send(request, handle.clone()) => result,
            };
            drop(registration);

            let step = next_step(&descriptor, outcome, &self.retry);
            #[cfg(feature = "tracing")]
            tracing::trace!(url = %descriptor.url, phase = ?step.phase(), "request step");

            match step {
                Step::Complete(reply) => return Ok(Outcome::Completed(reply)),
                Step::Cancelled(reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(url = %descriptor.url, %reason, "request cancelled");
                    return Ok(Outcome::Cancelled(reason));
                }
                Step::Fail(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        url = %descriptor.url,
                        status = ?err.status(),
                        message = %err.message(),
                        "request failed"
                    );
                    return Err(err);
                }
                Step::Refresh => {
                    descriptor.refresh_attempted = true;
                    let refreshed = self
                        .shared
                        .refresh
                        .ensure_fresh_token(self.credentials.as_ref(), |refresh_token| {
                            self.request_new_tokens(refresh_token)
                        })
                        .await?;
                    match refreshed {
                        Outcome::Completed(token) => descriptor.bearer_override = Some(token),
                        Outcome::Cancelled(reason) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(url = %descriptor.url, %reason, "refresh cancelled");
                            return Ok(Outcome::Cancelled(reason));
                        }
                    }
                }
                Step::Retry { delay, failure } => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        url = %descriptor.url,
                        attempt = descriptor.retry.attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retrying request"
                    );
                    descriptor.retry.last_failure_was_network = failure.is_network();
                    let cancel = descriptor.options.cancel.as_ref();
                    if let Some(reason) = wait_before_retry(delay, cancel).await {
                        return Ok(Outcome::Cancelled(reason));
                    }
                    descriptor.retry.attempt += 1;
                }
            }
        }
    }

    /// Builds the wire request: resolved URL, JSON headers, caller headers and
    /// the bearer credential, in that order.
    fn prepare(&self, descriptor: &RequestDescriptor) -> Result<TransportRequest> {
        let mut headers = HeaderMap::new();
        if descriptor.response_kind == ResponseKind::Json {
            headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        }

        let body = match &descriptor.body {
            Body::Empty => TransportBody::Empty,
            Body::Json(value) => {
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                TransportBody::Json(encode_json(value)?)
            }
            Body::Multipart(form) => TransportBody::Multipart(form.clone()),
        };

        for (name, value) in &descriptor.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                RelayError::invalid_request(format!("invalid header name '{name}': {err}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                RelayError::invalid_request(format!("invalid value for header '{name}': {err}"))
            })?;
            headers.insert(name, value);
        }

        if descriptor.options.with_auth {
            let token = descriptor
                .bearer_override
                .clone()
                .or_else(|| self.credentials.access_token())
                .filter(|token| !token.trim().is_empty());
            if let Some(token) = token {
                let mut value = HeaderValue::from_str(&bearer_header_value(&token)).map_err(|err| {
                    RelayError::invalid_request(format!("invalid access token: {err}"))
                })?;
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
        }

        Ok(TransportRequest {
            method: descriptor.method.clone(),
            url: self.resolve_url(&descriptor.url),
            query: descriptor.query.pairs(),
            headers,
            body,
            timeout: descriptor.timeout(Duration::from_millis(self.options.timeout_ms)),
            upload_progress: descriptor.upload_progress.clone(),
            download_progress: descriptor.download_progress.clone(),
        })
    }

    /// Calls the refresh endpoint directly on the transport, outside the
    /// pipeline.
    async fn request_new_tokens(&self, refresh_token: String) -> Result<TokenPair> {
        let payload = serde_json::to_vec(&RefreshRequest {
            refresh_token: &refresh_token,
        })
        .map_err(|err| RelayError::invalid_request(format!("invalid refresh payload: {err}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let request = TransportRequest {
            method: Method::POST,
            url: self.resolve_url(&self.options.refresh_path),
            query: Vec::new(),
            headers,
            body: TransportBody::Json(Bytes::from(payload)),
            timeout: Some(Duration::from_millis(self.options.timeout_ms)),
            upload_progress: None,
            download_progress: None,
        };
        let response = self
            .transport
            .send(request, CancelToken::new())
            .await
            .map_err(|err| RelayError::authentication(format!("refresh request failed: {err}")))?;
        decode::refresh_tokens(&response)
    }

    fn resolve_url(&self, url: &str) -> String {
        resolve_url(&self.options.base_url, url)
    }
}

/// Sleeps before the next attempt; returns early with the reason if the
/// caller cancels meanwhile.
async fn wait_before_retry(delay: Duration, cancel: Option<&CancelToken>) -> Option<CancelReason> {
    match cancel {
        Some(token) => tokio::select! {
            reason = token.cancelled() => Some(reason),
            _ = sleep(delay) => None,
        },
        None => {
            sleep(delay).await;
            None
        }
    }
}

/// Pre-encoded JSON text is sent verbatim; any other value is serialized.
fn encode_json(value: &Value) -> Result<Bytes> {
    match value {
        Value::String(text) => Ok(Bytes::from(text.clone())),
        value => serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| RelayError::invalid_request(format!("invalid request body: {err}"))),
    }
}

fn resolve_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_owned();
    }
    let base = base_url.trim_end_matches('/');
    if base.is_empty() {
        return url.to_owned();
    }
    if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

/// `Bearer <token>`, unless the stored token already carries a scheme.
fn bearer_header_value(token: &str) -> String {
    let token = token.trim();
    match token.split_once(' ') {
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("bearer") => token.to_owned(),
        _ => format!("Bearer {token}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{bearer_header_value, encode_json, resolve_url, RelayClient};
    use crate::{MemoryCredentialStore, RequestOptions};

    #[test]
    fn bearer_scheme_is_added_once() {
        assert_eq!(bearer_header_value(" tok1 "), "Bearer tok1");
        assert_eq!(bearer_header_value("bearer tok1"), "bearer tok1");
        assert_eq!(bearer_header_value("BearerX"), "Bearer BearerX");
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = RelayClient::new("https://api.test").with_credential_store(Arc::new(
            MemoryCredentialStore::with_tokens("secret-token", None),
        ));
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn resolve_url_joins_base_and_path() {
        assert_eq!(resolve_url("https://api.test/v1/", "/users"), "https://api.test/v1/users");
        assert_eq!(resolve_url("https://api.test", "users"), "https://api.test/users");
        assert_eq!(resolve_url("", "/users"), "/users");
        assert_eq!(
            resolve_url("https://api.test", "https://cdn.test/a.png"),
            "https://cdn.test/a.png"
        );
    }

    #[test]
    fn string_bodies_are_sent_verbatim() {
        assert_eq!(&encode_json(&json!(r#"{"a":1}"#)).expect("text")[..], br#"{"a":1}"#);
        assert_eq!(&encode_json(&json!({"a": 1})).expect("object")[..], br#"{"a":1}"#);
    }

    #[test]
    fn prepare_attaches_bearer_and_caller_headers() {
        let client = RelayClient::new("https://api.test").with_credential_store(Arc::new(
            MemoryCredentialStore::with_tokens("tok1", None),
        ));
        let descriptor = crate::RequestDescriptor::new(
            reqwest::Method::GET,
            "/me",
            crate::Query::default(),
            crate::Body::Empty,
        )
        .with_options(RequestOptions::default().header("x-trace", "abc"));

        let request = client.prepare(&descriptor).expect("must prepare");
        assert_eq!(request.url, "https://api.test/me");
        assert_eq!(request.headers["authorization"], "Bearer tok1");
        assert_eq!(request.headers["x-trace"], "abc");
        assert_eq!(request.timeout, Some(std::time::Duration::from_millis(15_000)));
    }

    #[test]
    fn prepare_skips_auth_when_opted_out() {
        let client = RelayClient::new("https://api.test").with_credential_store(Arc::new(
            MemoryCredentialStore::with_tokens("tok1", None),
        ));
        let descriptor = crate::RequestDescriptor::new(
            reqwest::Method::GET,
            "/public",
            crate::Query::default(),
            crate::Body::Empty,
        )
        .with_options(RequestOptions::default().without_auth());

        let request = client.prepare(&descriptor).expect("must prepare");
        assert!(request.headers.get("authorization").is_none());
    }

    #[test]
    fn prepare_rejects_bad_header_names() {
        let client = RelayClient::new("https://api.test");
        let descriptor = crate::RequestDescriptor::new(
            reqwest::Method::GET,
            "/me",
            crate::Query::default(),
            crate::Body::Empty,
        )
        .with_options(RequestOptions::default().header("bad header", "x"));

        let err = client.prepare(&descriptor).expect_err("must reject");
        assert_eq!(err.kind(), crate::ErrorKind::InvalidRequest);
    }
}
