use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{
    header::HeaderMap,
    multipart::{Form, Part},
    Method,
};

use crate::{CancelToken, MultipartForm, Progress, ProgressFn, TransportError};

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Encoded request payload.
#[derive(Clone, Debug, Default)]
pub enum TransportBody {
    #[default]
    Empty,
    Json(Bytes),
    Multipart(MultipartForm),
}

/// A fully prepared request, ready to go on the wire.
#[derive(Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: TransportBody,
    /// `None` means no timeout.
    pub timeout: Option<Duration>,
    pub upload_progress: Option<ProgressFn>,
    pub download_progress: Option<ProgressFn>,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A response of any status. Error statuses are still responses.
#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs network I/O for the client.
///
/// Implementations return `Ok` for every response, whatever its status, and
/// `Err` only when no response was received. They must stop work and return
/// [`TransportError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancelToken,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured `reqwest` client (proxies, TLS roots, ...).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn exchange(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let timeout_ms = request
            .timeout
            .map(|timeout| timeout.as_millis() as u64)
            .unwrap_or_default();
        let classify = move |err: reqwest::Error| classify_error(err, timeout_ms);

        let mut builder = self
            .http
            .request(request.method, &request.url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match request.body {
            TransportBody::Empty => builder,
            TransportBody::Json(bytes) => builder.body(bytes),
            TransportBody::Multipart(form) => {
                builder.multipart(build_form(form, request.upload_progress)?)
            }
        };

        let mut response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let total = response.content_length();

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            body.extend_from_slice(&chunk);
            if let Some(progress) = &request.download_progress {
                progress(Progress::new(body.len() as u64, total));
            }
        }

        Ok(TransportResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: CancelToken,
    ) -> Result<TransportResponse, TransportError> {
        // dropping the exchange future aborts the underlying connection
        tokio::select! {
            biased;
            reason = cancel.cancelled() => Err(TransportError::Cancelled(reason)),
            result = self.exchange(request) => result,
        }
    }
}

fn classify_error(err: reqwest::Error, timeout_ms: u64) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout_ms)
    } else if err.is_builder() {
        TransportError::Build(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

/// Builds a `reqwest` form. With a progress callback, file parts are streamed
/// in chunks and progress is reported as each chunk is consumed.
fn build_form(form: MultipartForm, progress: Option<ProgressFn>) -> Result<Form, TransportError> {
    let total = form.file_bytes();
    let sent = Arc::new(AtomicU64::new(0));
    let mut multipart = Form::new();

    for (field, file) in form.files {
        let length = file.bytes.len() as u64;
        let part = match &progress {
            Some(progress) => {
                let progress = progress.clone();
                let sent = sent.clone();
                let chunks = split_chunks(file.bytes)
                    .into_iter()
                    .map(Ok::<Bytes, std::io::Error>);
                let stream = futures::stream::iter(chunks).inspect(move |chunk| {
                    if let Ok(chunk) = chunk {
                        let size = chunk.len() as u64;
                        let loaded = sent.fetch_add(size, Ordering::Relaxed) + size;
                        progress(Progress::new(loaded, Some(total)));
                    }
                });
                Part::stream_with_length(reqwest::Body::wrap_stream(stream), length)
            }
            None => Part::bytes(file.bytes.to_vec()),
        };
        let mut part = part.file_name(file.file_name);
        if let Some(content_type) = file.content_type {
            part = part.mime_str(&content_type).map_err(|err| {
                TransportError::Build(format!("invalid content type '{content_type}': {err}"))
            })?;
        }
        multipart = multipart.part(field, part);
    }

    for (name, value) in form.fields {
        multipart = multipart.text(name, value);
    }
    Ok(multipart)
}

fn split_chunks(bytes: Bytes) -> Vec<Bytes> {
    if bytes.is_empty() {
        return vec![bytes];
    }
    (0..bytes.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| bytes.slice(start..(start + UPLOAD_CHUNK_SIZE).min(bytes.len())))
        .collect()
}
