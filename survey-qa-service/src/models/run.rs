//! Request and response bodies of `POST /run`.

use super::usage::TokenDetail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RunRequest {
    pub prompt: String,

    /// Seconds before the run is abandoned; the service default applies when absent.
    /// Signed so that negative values fail validation instead of deserialization.
    #[validate(range(min = 1))]
    #[serde(default)]
    pub timeout: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub result: Option<String>,

    /// Wall-clock seconds; null when the run timed out.
    pub time: Option<f64>,

    pub timed_out: bool,

    pub tokens: u64,

    pub cost: f64,

    pub token_details: BTreeMap<String, TokenDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> RunRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn timeout_must_be_positive() {
        assert!(request(json!({ "prompt": "q", "timeout": 1 })).validate().is_ok());
        assert!(request(json!({ "prompt": "q" })).validate().is_ok());
        assert!(request(json!({ "prompt": "q", "timeout": 0 })).validate().is_err());
        assert!(request(json!({ "prompt": "q", "timeout": -5 })).validate().is_err());
    }
}
