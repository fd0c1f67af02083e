//! Per-request state machine.
//!
//! [`next_step`] is a pure function from an attempt's outcome to what the
//! client must do next; the async driver in `client.rs` only performs the I/O
//! each step names.

use std::time::Duration;

use serde_json::Value;

use crate::{
    decode::{self, parse_body, unwrap_success},
    request::ResponseKind,
    retry::{Failure, RetryPolicy},
    CancelReason, ErrorKind, RelayError, RequestDescriptor, TransportError, TransportResponse,
};

/// Lifecycle of one logical request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPhase {
    Created,
    Dispatched,
    AwaitingRefresh,
    AwaitingRetry,
    Terminal,
}

pub(crate) type AttemptOutcome = Result<TransportResponse, TransportError>;

/// Successful result of a request.
#[derive(Debug)]
pub(crate) enum Reply {
    Json(Value),
    Binary(TransportResponse),
}

impl Reply {
    pub(crate) fn into_json(self) -> Value {
        match self {
            Self::Json(value) => value,
            Self::Binary(response) => decode::body_value(&response.body),
        }
    }

    pub(crate) fn into_binary(self) -> Result<TransportResponse, RelayError> {
        match self {
            Self::Binary(response) => Ok(response),
            Self::Json(_) => Err(RelayError::new(
                ErrorKind::Decode,
                "expected a binary response",
            )),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Step {
    Complete(Reply),
    Cancelled(CancelReason),
    /// Wait for a fresh token, then replay.
    Refresh,
    /// Sleep, then replay.
    Retry { delay: Duration, failure: Failure },
    Fail(RelayError),
}

impl Step {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    pub(crate) fn phase(&self) -> RequestPhase {
        match self {
            Self::Refresh => RequestPhase::AwaitingRefresh,
            Self::Retry { .. } => RequestPhase::AwaitingRetry,
            Self::Complete(_) | Self::Cancelled(_) | Self::Fail(_) => RequestPhase::Terminal,
        }
    }
}

enum Failed {
    Response(TransportResponse),
    NoResponse(TransportError),
}

/// Decides what follows an attempt.
///
/// Precedence: cancellation, success, refresh on 401, retry on network
/// failure or 5xx, terminal error.
pub(crate) fn next_step(
    descriptor: &RequestDescriptor,
    outcome: AttemptOutcome,
    policy: &RetryPolicy,
) -> Step {
    let failed = match outcome {
        Err(TransportError::Cancelled(reason)) => return Step::Cancelled(reason),
        Err(TransportError::Build(message)) => {
            return Step::Fail(RelayError::invalid_request(message))
        }
        Ok(response) if response.is_success() => return complete(descriptor, response),
        Ok(response) => Failed::Response(response),
        Err(err) => Failed::NoResponse(err),
    };

    let failure = match &failed {
        Failed::Response(response) => Failure::Status(response.status),
        Failed::NoResponse(_) => Failure::NoResponse,
    };

    if failure == Failure::Status(401)
        && descriptor.options.with_auth
        && !descriptor.refresh_attempted
    {
        return Step::Refresh;
    }

    if policy.should_retry(descriptor, failure) {
        return Step::Retry {
            delay: policy.next_delay(descriptor.retry.attempt),
            failure,
        };
    }

    Step::Fail(match failed {
        Failed::Response(response) => decode::status_error(&response),
        Failed::NoResponse(err) => decode::transport_error(&err),
    })
}

fn complete(descriptor: &RequestDescriptor, response: TransportResponse) -> Step {
    match descriptor.response_kind {
        ResponseKind::Binary => Step::Complete(Reply::Binary(response)),
        ResponseKind::Json => {
            let body = parse_body(&response.body);
            match unwrap_success(body, response.status, descriptor.options.raw_response) {
                Ok(value) => Step::Complete(Reply::Json(value)),
                Err(err) => Step::Fail(err),
            }
        }
    }
}
