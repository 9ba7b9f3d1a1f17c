use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Staging deployment of the image-generation API.
pub const STG_ENDPOINT: &str = "https://ai.stream-svc.com/api/open/v1";
/// Production deployment of the image-generation API.
pub const PROD_ENDPOINT: &str = "https://www.kainoai.com/api/open/v1";

/// Header carrying the API key on every request.
pub const API_KEY_HEADER: &str = "aid-api-key";

/// Envelope `code` that marks a successful response.  Anything else is a
/// failure even when the HTTP status is 2xx.
pub const SUCCESS_CODE: i64 = 200;

/// One selectable option as served by the remote option endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionItem {
    pub label: String,
    pub value: String,
}

/// The two option lists the remote service exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    Style,
    Room,
}

impl OptionKind {
    pub fn path(self) -> &'static str {
        match self {
            OptionKind::Style => "/sd_params/options/style",
            OptionKind::Room => "/sd_params/options/room",
        }
    }

    /// Full URL of this option list under `endpoint`.
    pub fn url(self, endpoint: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), self.path())
    }
}

impl std::fmt::Display for OptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionKind::Style => f.write_str("style"),
            OptionKind::Room => f.write_str("room"),
        }
    }
}

/// `{ code, data: { data, total? } }` wrapper around every payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    pub data: EnvelopeData<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeData<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("API request failed with code {0}")]
    Code(i64),
    #[error("malformed response envelope: {0}")]
    Malformed(String),
}

/// Only the status part of an envelope; failed responses may carry a
/// `data` of any shape, so the code is checked before the payload is typed.
#[derive(Deserialize)]
struct EnvelopeHead {
    code: i64,
}

/// Unwrap `data.data` from a response body.
pub fn parse_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<T, EnvelopeError> {
    let head: EnvelopeHead =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if head.code != SUCCESS_CODE {
        return Err(EnvelopeError::Code(head.code));
    }
    let envelope: ApiEnvelope<T> =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    Ok(envelope.data.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_success_payload() {
        let body = br#"{"code":200,"data":{"data":[{"label":"Living room","value":"living"}],"total":1}}"#;
        let items: Vec<OptionItem> = parse_envelope(body).unwrap();
        assert_eq!(
            items,
            vec![OptionItem {
                label: "Living room".into(),
                value: "living".into()
            }]
        );
    }

    #[test]
    fn non_success_code_is_an_error_whatever_the_payload() {
        let body = br#"{"code":500,"data":null}"#;
        let err = parse_envelope::<Vec<OptionItem>>(body).unwrap_err();
        assert_eq!(err, EnvelopeError::Code(500));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let body = br#"{"code":200,"data":[1,2,3]}"#;
        assert!(matches!(
            parse_envelope::<Vec<OptionItem>>(body),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            parse_envelope::<Vec<OptionItem>>(b"<html>"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn option_urls_join_cleanly() {
        assert_eq!(
            OptionKind::Room.url("http://localhost:1/api/"),
            "http://localhost:1/api/sd_params/options/room"
        );
        assert_eq!(
            OptionKind::Style.url(STG_ENDPOINT),
            "https://ai.stream-svc.com/api/open/v1/sd_params/options/style"
        );
    }
}
