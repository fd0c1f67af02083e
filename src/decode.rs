use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use crate::{
    error::AppCode,
    wire::{Envelope, RefreshResponse, TokenPair},
    ErrorKind, RelayError, Result, TransportError, TransportResponse,
};

pub(crate) const BUSINESS_FALLBACK_MESSAGE: &str = "Business request failed";
pub(crate) const NETWORK_FALLBACK_MESSAGE: &str =
    "Network request failed, please check your connection";

/// Friendly message for an HTTP status.
pub fn status_message(status: u16) -> Option<&'static str> {
    let message = match status {
        400 => "Bad request parameters",
        401 => "Session expired, please sign in again",
        403 => "You do not have permission to perform this action",
        404 => "The requested resource does not exist",
        405 => "Request method not allowed",
        408 => "Request timed out, please try again later",
        409 => "Data conflict, please refresh and try again",
        422 => "Request validation failed",
        429 => "Too many requests, please try again later",
        500 => "Internal server error",
        502 => "Bad gateway, please try again later",
        503 => "Service temporarily unavailable",
        504 => "Gateway timeout, please try again later",
        _ => return None,
    };
    Some(message)
}

/// Friendly message for an application error code.
pub fn business_message(code: &AppCode) -> Option<&'static str> {
    let message = match code.as_i64()? {
        1001 => "Incorrect username or password",
        1002 => "Account has been disabled",
        1003 => "Verification code has expired",
        4001 => "Record does not exist",
        4003 => "Operation not permitted",
        5000 => "Server busy, please try again later",
        _ => return None,
    };
    Some(message)
}

/// A response body after the schema check.
#[derive(Debug)]
pub(crate) enum ResponseBody {
    Envelope { envelope: Envelope, raw: Value },
    Raw(Value),
}

/// Parses a body as JSON, falling back to text. Only JSON objects with a
/// numeric or string `code` count as envelopes.
pub(crate) fn parse_body(bytes: &[u8]) -> ResponseBody {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return ResponseBody::Raw(Value::Null);
    }
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        let text = String::from_utf8_lossy(bytes).into_owned();
        return ResponseBody::Raw(Value::String(text));
    };
    if !value.is_object() {
        return ResponseBody::Raw(value);
    }
    match Envelope::deserialize(&value) {
        Ok(envelope) => ResponseBody::Envelope {
            envelope,
            raw: value,
        },
        Err(_) => ResponseBody::Raw(value),
    }
}

/// The parsed body as plain JSON, envelope or not.
pub(crate) fn body_value(bytes: &[u8]) -> Value {
    match parse_body(bytes) {
        ResponseBody::Envelope { raw, .. } => raw,
        ResponseBody::Raw(value) => value,
    }
}

/// Unwraps a 2xx body: envelope `data` (or the whole envelope in raw mode)
/// on a success code, a business error otherwise. Non-envelope bodies pass
/// through.
pub(crate) fn unwrap_success(body: ResponseBody, status: u16, raw_response: bool) -> Result<Value> {
    match body {
        ResponseBody::Raw(value) => Ok(value),
        ResponseBody::Envelope { envelope, raw } => {
            if envelope.code.is_success() {
                return Ok(if raw_response { raw } else { envelope.data });
            }
            let code = AppCode::from_json(&raw["code"]);
            let message = code
                .as_ref()
                .and_then(business_message)
                .map(str::to_owned)
                .or_else(|| text_message(envelope.message.as_ref()))
                .unwrap_or_else(|| BUSINESS_FALLBACK_MESSAGE.to_owned());
            Err(RelayError::new(ErrorKind::Business, message)
                .with_status(status)
                .with_code(code)
                .with_payload(Some(raw)))
        }
    }
}

pub(crate) fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::Authentication,
        500.. => ErrorKind::Network,
        _ => ErrorKind::Client,
    }
}

/// Builds the terminal error for a non-2xx response.
///
/// Message preference: server `message`, status table, generic status text.
pub(crate) fn status_error(response: &TransportResponse) -> RelayError {
    let status = response.status;
    let payload = body_value(&response.body);
    let server_message = text_message(payload.get("message"));
    let code = payload.get("code").and_then(AppCode::from_json);
    let message = server_message
        .or_else(|| status_message(status).map(str::to_owned))
        .unwrap_or_else(|| format!("request failed with status code {status}"));

    RelayError::new(kind_for_status(status), message)
        .with_status(status)
        .with_code(code)
        .with_payload((!payload.is_null()).then_some(payload))
}

/// Builds the terminal error for an attempt that got no response.
pub(crate) fn transport_error(err: &TransportError) -> RelayError {
    match err {
        TransportError::Build(message) => RelayError::invalid_request(message.clone()),
        TransportError::Network(message) if !message.trim().is_empty() => {
            RelayError::new(ErrorKind::Network, message.clone())
        }
        TransportError::Network(_) => RelayError::new(ErrorKind::Network, NETWORK_FALLBACK_MESSAGE),
        TransportError::Timeout(_) | TransportError::Cancelled(_) => {
            RelayError::new(ErrorKind::Network, err.to_string())
        }
    }
}

/// Reads the refresh endpoint's answer.
pub(crate) fn refresh_tokens(response: &TransportResponse) -> Result<TokenPair> {
    if !response.is_success() {
        return Err(RelayError::authentication(format!(
            "refresh endpoint returned status {}",
            response.status
        )));
    }
    let tokens = match serde_json::from_slice::<RefreshResponse>(&response.body) {
        Ok(RefreshResponse::Wrapped { code, data }) if code.is_success() => data,
        Ok(RefreshResponse::Wrapped { .. }) => {
            return Err(RelayError::authentication(
                "refresh endpoint rejected the refresh token",
            ))
        }
        Ok(RefreshResponse::Flat(tokens)) => tokens,
        Err(err) => {
            return Err(RelayError::authentication(format!(
                "invalid refresh response: {err}"
            )))
        }
    };
    if tokens.access_token.trim().is_empty() {
        return Err(RelayError::authentication(
            "refresh response carried an empty access token",
        ));
    }
    Ok(tokens)
}

/// Converts an unwrapped payload into the caller's type.
pub(crate) fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    T::deserialize(&value).map_err(|err| {
        RelayError::new(ErrorKind::Decode, format!("unexpected response payload: {err}"))
            .with_payload(Some(value.clone()))
    })
}

fn text_message(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        _ => None,
    }
}
