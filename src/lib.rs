//! `relay-http` is an async HTTP client that manages the request lifecycle
//! for JSON APIs.
//!
//! On top of a pluggable [`Transport`] it adds:
//! - bearer credentials with a single-flight token refresh on `401`
//! - deduplication of identical in-flight requests
//! - retry with exponential backoff for network failures and `5xx`
//! - `{ code, data, message }` envelope unwrapping and one error type,
//!   [`RelayError`]
//!
//! Entry point is [`RelayClient`].

mod cancel;
mod client;
mod credentials;
mod decode;
mod dedup;
mod error;
mod options;
mod params;
mod pipeline;
mod refresh;
mod request;
mod retry;
mod transfer;
mod transport;
mod types;
mod wire;

pub use cancel::{CancelReason, CancelToken};
pub use client::RelayClient;
pub use credentials::{CredentialStore, MemoryCredentialStore};
pub use decode::{business_message, status_message};
pub use dedup::PendingRegistry;
pub use error::{AppCode, ErrorKind, RelayError, TransportError};
pub use options::{ClientOptions, RequestOptions};
pub use params::{Body, Query};
pub use pipeline::RequestPhase;
pub use refresh::{RefreshCoordinator, SessionExpired};
pub use request::{Fingerprint, RequestDescriptor, RetryContext};
pub use retry::{Failure, RetryPolicy};
pub use transfer::{
    Download, DownloadOptions, MultipartForm, Progress, ProgressFn, ResponseMeta, UploadFile,
    UploadOptions, UploadSource,
};
pub use transport::{
    ReqwestTransport, Transport, TransportBody, TransportRequest, TransportResponse,
};
pub use types::Outcome;
pub use wire::TokenPair;

pub type Result<T> = std::result::Result<T, RelayError>;
