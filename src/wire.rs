use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{ code, data, message }` response wrapper.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub code: EnvelopeCode,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub message: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EnvelopeCode {
    Number(i64),
    Text(String),
}

impl EnvelopeCode {
    /// `200` and `0`, as numbers or digit strings.
    pub fn is_success(&self) -> bool {
        match self {
            Self::Number(code) => *code == 200 || *code == 0,
            Self::Text(code) => matches!(code.trim(), "200" | "0"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Tokens returned by the refresh endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The refresh endpoint may wrap its tokens in an envelope or answer flat.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RefreshResponse {
    Wrapped { code: EnvelopeCode, data: TokenPair },
    Flat(TokenPair),
}
