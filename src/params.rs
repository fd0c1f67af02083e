use serde::Serialize;
use serde_json::Value;

use crate::{MultipartForm, RelayError, Result};

/// URL query parameters, kept as JSON so they can be fingerprinted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query(Value);

impl Query {
    /// Serializes any struct or map into query parameters.
    ///
    /// `()` and `None` produce an empty query; anything that is not a map
    /// is rejected.
    pub fn from_serialize<Q: Serialize + ?Sized>(query: &Q) -> Result<Self> {
        let value = serde_json::to_value(query)
            .map_err(|err| RelayError::invalid_request(format!("invalid query: {err}")))?;
        match value {
            Value::Null | Value::Object(_) => Ok(Self(value)),
            other => Err(RelayError::invalid_request(format!(
                "query must serialize to a map, got {other}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Object(map) => map.is_empty(),
            _ => true,
        }
    }

    /// Flattens the query into `key=value` pairs.
    ///
    /// Nulls are dropped, arrays repeat their key, nested objects are sent as
    /// JSON text.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let Value::Object(map) = &self.0 else {
            return Vec::new();
        };
        let mut pairs = Vec::with_capacity(map.len());
        for (key, value) in map {
            match value {
                Value::Null => {}
                Value::Array(items) => {
                    for item in items {
                        if let Some(text) = scalar_text(item) {
                            pairs.push((key.clone(), text));
                        }
                    }
                }
                other => {
                    if let Some(text) = scalar_text(other) {
                        pairs.push((key.clone(), text));
                    }
                }
            }
        }
        pairs
    }

    pub(crate) fn canonical(&self) -> String {
        if self.is_empty() {
            "{}".to_owned()
        } else {
            self.0.to_string()
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Request payload.
#[derive(Clone, Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

impl Body {
    pub fn json<B: Serialize + ?Sized>(body: &B) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|err| RelayError::invalid_request(format!("invalid request body: {err}")))?;
        Ok(match value {
            Value::Null => Self::Empty,
            value => Self::Json(value),
        })
    }

    /// JSON form used for fingerprinting.
    ///
    /// A string body that itself holds JSON is parsed first, so sending
    /// pre-encoded text and the equivalent structure collide. Multipart
    /// bodies all canonicalize to `{}`.
    pub(crate) fn canonical(&self) -> String {
        match self {
            Self::Empty | Self::Multipart(_) => "{}".to_owned(),
            Self::Json(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                Ok(parsed) => parsed.to_string(),
                Err(_) => Value::String(text.clone()).to_string(),
            },
            Self::Json(value) => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{Body, Query};
    use crate::ErrorKind;

    #[test]
    fn unit_query_is_empty() {
        let query = Query::from_serialize(&()).expect("unit must serialize");
        assert!(query.is_empty());
        assert_eq!(query.canonical(), "{}");
        assert!(query.pairs().is_empty());
    }

    #[test]
    fn query_pairs_flatten_scalars_and_arrays() {
        let query = Query::from_serialize(&json!({
            "page": 2,
            "q": "kit",
            "tag": ["a", "b"],
            "skip": null,
        }))
        .expect("map must serialize");

        assert_eq!(
            query.pairs(),
            vec![
                ("page".to_owned(), "2".to_owned()),
                ("q".to_owned(), "kit".to_owned()),
                ("tag".to_owned(), "a".to_owned()),
                ("tag".to_owned(), "b".to_owned()),
            ]
        );
    }

    #[test]
    fn query_rejects_non_map() {
        let err = Query::from_serialize(&[1, 2]).expect_err("array must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn query_canonical_is_key_ordered() {
        let mut left = BTreeMap::new();
        left.insert("b", 1);
        left.insert("a", 2);
        let right = json!({"a": 2, "b": 1});

        assert_eq!(
            Query::from_serialize(&left).expect("map").canonical(),
            Query::from_serialize(&right).expect("map").canonical()
        );
    }

    #[test]
    fn string_body_fingerprints_like_structured_body() {
        let text = Body::json(&r#"{"id":1}"#).expect("string body");
        let structured = Body::json(&json!({"id": 1})).expect("object body");
        assert_eq!(text.canonical(), structured.canonical());
    }

    #[test]
    fn null_body_is_empty() {
        assert!(matches!(Body::json(&()).expect("unit body"), Body::Empty));
        assert_eq!(Body::Empty.canonical(), "{}");
    }
}
