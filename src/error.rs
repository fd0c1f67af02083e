use std::fmt;

use serde_json::Value;

/// Classifies a [`RelayError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 401 after a failed or already-spent token refresh.
    Authentication,
    /// Well-formed envelope carrying a non-success application code.
    Business,
    /// No response, or a 5xx that outlived its retry budget.
    Network,
    /// 4xx other than 401. Never retried.
    Client,
    /// Success payload did not match the requested type.
    Decode,
    /// Query, body or header could not be turned into a request.
    InvalidRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authentication => "authentication",
            Self::Business => "business",
            Self::Network => "network",
            Self::Client => "client",
            Self::Decode => "decode",
            Self::InvalidRequest => "invalid request",
        };
        f.write_str(name)
    }
}

/// Application error code carried by a response envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppCode {
    Number(i64),
    Text(String),
}

impl AppCode {
    pub(crate) fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Self::Number),
            Value::String(text) => Some(Self::Text(text.clone())),
            _ => None,
        }
    }

    /// Numeric form of the code, parsing text codes when they hold digits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl fmt::Display for AppCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Error type returned by every public request method.
///
/// Lower-level transport and parsing failures are normalized into this shape
/// before they reach the caller.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct RelayError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    code: Option<AppCode>,
    payload: Option<Value>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: None,
            payload: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: Option<AppCode>) -> Self {
        self.code = code;
        self
    }

    pub fn with_payload(mut self, payload: Option<Value>) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message).with_status(401)
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human readable message, already resolved through the lookup tables.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status, absent when no response was received.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn code(&self) -> Option<&AppCode> {
        self.code.as_ref()
    }

    /// Raw response body that produced the error, if any.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }
}

/// Failure reported by a [`Transport`](crate::Transport) when no response was
/// received.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection, DNS, TLS or body read failure.
    #[error("network error: {0}")]
    Network(String),
    /// The per-request timeout elapsed.
    #[error("timeout of {0}ms exceeded")]
    Timeout(u64),
    /// The request's cancel token fired before a response arrived.
    #[error("request cancelled: {0}")]
    Cancelled(crate::CancelReason),
    /// The request could not be assembled. Never retried.
    #[error("invalid request: {0}")]
    Build(String),
}
