//! Request and reply definitions.
//!
//! This module defines the values exchanged between clients and workers:
//!
//! - `AnalysisRequest`: A named analysis job with its arguments
//! - `AnalysisReply`: The outcome of a request, correlated by request id
//! - `ReplyStatus`: `NORMAL` or `ERROR`
//! - `ArgValue`: A weakly typed argument value (string, number, boolean)
//!
//! Field names on the wire follow the established JSON layout
//! (`requestId`, `analysisName`, `analysisArguments`, `analysisResults`).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AnalysisError;

/// Result key carrying the analysis kind on `ERROR` replies.
pub const ERROR_KIND_KEY: &str = "analysisName";

/// Result key carrying the diagnostic message on `ERROR` replies.
pub const ERROR_MESSAGE_KEY: &str = "error";

/// A single analysis argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl ArgValue {
    /// Returns a short name of the variant for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Boolean(_) => "boolean",
            ArgValue::Number(_) => "number",
            ArgValue::String(_) => "string",
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::String(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::String(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Number(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Boolean(value)
    }
}

/// A request to run a named analysis.
///
/// The id is generated once at construction and is the correlation key for
/// staged file names and for the reply. There is no way to change it after
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(rename = "requestId")]
    id: Uuid,
    #[serde(rename = "analysisName")]
    kind: String,
    #[serde(rename = "analysisArguments", default)]
    arguments: HashMap<String, ArgValue>,
}

impl AnalysisRequest {
    /// Creates a new request with a fresh id and no arguments.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            arguments: HashMap::new(),
        }
    }

    /// Adds (or replaces) a single argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// Replaces all arguments.
    pub fn with_arguments(mut self, arguments: HashMap<String, ArgValue>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Returns the request id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the analysis kind name as sent by the client.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the raw argument map.
    pub fn arguments(&self) -> &HashMap<String, ArgValue> {
        &self.arguments
    }
}

/// Status of an analysis reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplyStatus {
    /// The analysis ran and its outputs are available.
    Normal,
    /// The analysis failed; results carry diagnostics.
    Error,
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyStatus::Normal => write!(f, "NORMAL"),
            ReplyStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// The outcome of an analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReply {
    #[serde(rename = "requestId")]
    request_id: Uuid,
    status: ReplyStatus,
    #[serde(rename = "analysisResults", default)]
    results: HashMap<String, Value>,
}

impl AnalysisReply {
    /// Creates a `NORMAL` reply whose results map output names to locations.
    pub fn normal(request_id: Uuid, results: HashMap<String, Value>) -> Self {
        Self {
            request_id,
            status: ReplyStatus::Normal,
            results,
        }
    }

    /// Creates an `ERROR` reply carrying the analysis kind and a diagnostic.
    pub fn error(request_id: Uuid, kind: &str, message: impl Into<String>) -> Self {
        let mut results = HashMap::new();
        results.insert(ERROR_KIND_KEY.to_string(), Value::String(kind.to_string()));
        results.insert(ERROR_MESSAGE_KEY.to_string(), Value::String(message.into()));
        Self {
            request_id,
            status: ReplyStatus::Error,
            results,
        }
    }

    /// Wraps an analysis error into an `ERROR` reply for the given request.
    pub fn from_error(request: &AnalysisRequest, error: &AnalysisError) -> Self {
        Self::error(request.id(), request.kind(), error.to_string())
    }

    /// Returns the id of the originating request.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Returns the reply status.
    pub fn status(&self) -> ReplyStatus {
        self.status
    }

    /// Returns the result map.
    pub fn results(&self) -> &HashMap<String, Value> {
        &self.results
    }

    /// Returns true for `NORMAL` replies.
    pub fn is_normal(&self) -> bool {
        self.status == ReplyStatus::Normal
    }

    /// Returns the diagnostic message of an `ERROR` reply.
    pub fn error_message(&self) -> Option<&str> {
        match self.status {
            ReplyStatus::Error => self.results.get(ERROR_MESSAGE_KEY).and_then(Value::as_str),
            ReplyStatus::Normal => None,
        }
    }

    /// Returns a result value as a string, if present.
    pub fn result_str(&self, name: &str) -> Option<&str> {
        self.results.get(name).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = AnalysisRequest::new("CVS2NETCDF");
        let b = AnalysisRequest::new("CVS2NETCDF");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_request_builder_keeps_id() {
        let request = AnalysisRequest::new("QCPLOT");
        let id = request.id();
        let request = request
            .with_argument("userName", "u")
            .with_argument("longitude", 135.0)
            .with_argument("verbose", true);

        assert_eq!(request.id(), id);
        assert_eq!(request.kind(), "QCPLOT");
        assert_eq!(request.arguments().len(), 3);
        assert_eq!(
            request.arguments().get("longitude"),
            Some(&ArgValue::Number(135.0))
        );
    }

    #[test]
    fn test_request_wire_field_names() {
        let request = AnalysisRequest::new("CVS2NETCDF").with_argument("userName", "u");
        let json = serde_json::to_value(&request).expect("request should serialize");

        assert!(json.get("requestId").is_some());
        assert_eq!(json["analysisName"], "CVS2NETCDF");
        assert_eq!(json["analysisArguments"]["userName"], "u");
    }

    #[test]
    fn test_request_without_arguments_deserializes() {
        let json = r#"{"requestId":"6f1c1c40-6b4c-4d8e-9a53-0c1f3a4f2b11","analysisName":"QCPLOT"}"#;
        let request: AnalysisRequest = serde_json::from_str(json).expect("should parse");
        assert!(request.arguments().is_empty());
        assert_eq!(request.kind(), "QCPLOT");
    }

    #[test]
    fn test_arg_value_untagged_parsing() {
        let json = r#"{"a":"135","b":-35.5,"c":false}"#;
        let args: HashMap<String, ArgValue> = serde_json::from_str(json).expect("should parse");
        assert_eq!(args["a"], ArgValue::String("135".to_string()));
        assert_eq!(args["b"], ArgValue::Number(-35.5));
        assert_eq!(args["c"], ArgValue::Boolean(false));
        assert_eq!(args["c"].type_name(), "boolean");
    }

    #[test]
    fn test_error_reply_carries_kind_and_message() {
        let request = AnalysisRequest::new("FOO");
        let error = AnalysisError::UnrecognizedAnalysisKind("FOO".to_string());
        let reply = AnalysisReply::from_error(&request, &error);

        assert_eq!(reply.request_id(), request.id());
        assert_eq!(reply.status(), ReplyStatus::Error);
        assert!(!reply.is_normal());
        assert_eq!(reply.result_str(ERROR_KIND_KEY), Some("FOO"));
        assert!(reply.error_message().is_some_and(|m| m.contains("FOO")));
    }

    #[test]
    fn test_reply_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ReplyStatus::Normal).expect("serialize"),
            "\"NORMAL\""
        );
        assert_eq!(
            serde_json::to_string(&ReplyStatus::Error).expect("serialize"),
            "\"ERROR\""
        );
        assert_eq!(ReplyStatus::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_normal_reply_has_no_error_message() {
        let mut results = HashMap::new();
        results.insert("plot".to_string(), Value::String("file:///tmp/p.png".into()));
        let reply = AnalysisReply::normal(Uuid::new_v4(), results);

        assert!(reply.is_normal());
        assert_eq!(reply.error_message(), None);
        assert_eq!(reply.result_str("plot"), Some("file:///tmp/p.png"));
    }
}
