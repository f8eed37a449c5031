//! Message codec for requests and replies.
//!
//! Message bodies are encoded according to the content type declared on the
//! message. Only JSON is supported; any other content type is rejected with
//! `CodecError::UnsupportedContentType`. A body that cannot be decoded is
//! reported as `CodecError::MalformedMessage` so the worker can tell it apart
//! from every other failure.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::request::{AnalysisReply, AnalysisRequest};

/// Content type for JSON message bodies.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Errors that can occur while encoding or decoding message bodies.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The declared content type has no codec.
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// The body could not be decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A value could not be encoded.
    #[error("Encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Supported body encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
}

impl ContentType {
    /// Parses a content type header value. Parameters such as `charset`
    /// are ignored and the media type is compared case-insensitively.
    pub fn parse(value: &str) -> Result<Self, CodecError> {
        let media_type = value.split(';').next().unwrap_or("").trim();
        if media_type.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
            Ok(ContentType::Json)
        } else {
            Err(CodecError::UnsupportedContentType(value.to_string()))
        }
    }

    /// Returns the canonical header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => CONTENT_TYPE_JSON,
        }
    }
}

/// Stateless encoder/decoder for analysis messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encodes a request body.
    pub fn encode_request(
        &self,
        content_type: &str,
        request: &AnalysisRequest,
    ) -> Result<Vec<u8>, CodecError> {
        encode(ContentType::parse(content_type)?, request)
    }

    /// Decodes a request body.
    pub fn decode_request(
        &self,
        content_type: &str,
        body: &[u8],
    ) -> Result<AnalysisRequest, CodecError> {
        decode(ContentType::parse(content_type)?, body)
    }

    /// Encodes a reply body.
    pub fn encode_reply(
        &self,
        content_type: &str,
        reply: &AnalysisReply,
    ) -> Result<Vec<u8>, CodecError> {
        encode(ContentType::parse(content_type)?, reply)
    }

    /// Decodes a reply body.
    pub fn decode_reply(
        &self,
        content_type: &str,
        body: &[u8],
    ) -> Result<AnalysisReply, CodecError> {
        decode(ContentType::parse(content_type)?, body)
    }
}

fn encode<T: Serialize>(content_type: ContentType, value: &T) -> Result<Vec<u8>, CodecError> {
    match content_type {
        ContentType::Json => serde_json::to_vec(value).map_err(CodecError::Encode),
    }
}

fn decode<T: DeserializeOwned>(content_type: ContentType, body: &[u8]) -> Result<T, CodecError> {
    match content_type {
        ContentType::Json => {
            serde_json::from_slice(body).map_err(|e| CodecError::MalformedMessage(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::Value;

    use super::*;
    use crate::request::{ArgValue, ReplyStatus};

    #[test]
    fn test_content_type_parsing() {
        assert_eq!(
            ContentType::parse("application/json").expect("json"),
            ContentType::Json
        );
        assert_eq!(
            ContentType::parse("Application/JSON; charset=utf-8").expect("json"),
            ContentType::Json
        );
        assert!(matches!(
            ContentType::parse("text/xml"),
            Err(CodecError::UnsupportedContentType(t)) if t == "text/xml"
        ));
        assert!(ContentType::parse("").is_err());
    }

    #[test]
    fn test_request_round_trip() {
        let codec = MessageCodec::new();
        let request = AnalysisRequest::new("CVS2NETCDF")
            .with_argument("obsCSV", "file:///tmp/in/a.csv")
            .with_argument("longitude", "135")
            .with_argument("elevation", 10.0)
            .with_argument("gapFill", true);

        let body = codec
            .encode_request(CONTENT_TYPE_JSON, &request)
            .expect("encode");
        let decoded = codec.decode_request(CONTENT_TYPE_JSON, &body).expect("decode");

        assert_eq!(decoded.id(), request.id());
        assert_eq!(decoded.kind(), request.kind());
        assert_eq!(decoded.arguments(), request.arguments());
    }

    #[test]
    fn test_reply_round_trip() {
        let codec = MessageCodec::new();
        let mut results = HashMap::new();
        results.insert(
            "obsFlux".to_string(),
            Value::String("file:///tmp/in/x.flux.nc".to_string()),
        );
        let reply = AnalysisReply::normal(uuid::Uuid::new_v4(), results);

        let body = codec.encode_reply(CONTENT_TYPE_JSON, &reply).expect("encode");
        let decoded = codec.decode_reply(CONTENT_TYPE_JSON, &body).expect("decode");

        assert_eq!(decoded, reply);
        assert_eq!(decoded.status(), ReplyStatus::Normal);
    }

    #[test]
    fn test_malformed_body() {
        let codec = MessageCodec::new();
        let err = codec
            .decode_request(CONTENT_TYPE_JSON, b"{not json")
            .expect_err("should fail");
        assert!(matches!(err, CodecError::MalformedMessage(_)));

        let err = codec
            .decode_request(CONTENT_TYPE_JSON, br#"{"analysisName":"QCPLOT"}"#)
            .expect_err("missing id should fail");
        assert!(matches!(err, CodecError::MalformedMessage(_)));
    }

    #[test]
    fn test_unsupported_content_type_on_every_operation() {
        let codec = MessageCodec::new();
        let request = AnalysisRequest::new("QCPLOT").with_argument("x", ArgValue::from(1.0));

        assert!(matches!(
            codec.encode_request("text/plain", &request),
            Err(CodecError::UnsupportedContentType(_))
        ));
        assert!(matches!(
            codec.decode_request("text/plain", b"{}"),
            Err(CodecError::UnsupportedContentType(_))
        ));
        let reply = AnalysisReply::error(request.id(), "QCPLOT", "boom");
        assert!(matches!(
            codec.encode_reply("application/xml", &reply),
            Err(CodecError::UnsupportedContentType(_))
        ));
    }
}
