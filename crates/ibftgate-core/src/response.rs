//! Synthesized response envelope.
//!
//! The gateway never leaves a request unanswered: when the processor fails,
//! times out, panics or returns nothing, the handler sends a [`ResponseEnvelope`]
//! carrying an ISO 8583 style response code instead.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::types::CorrelationId;

/// Response codes used in synthesized envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    /// Request approved
    Approved,
    /// Malformed or oversized request
    FormatError,
    /// Processing did not finish in time
    ResponseTooLate,
    /// Database or other backend unavailable
    BackendUnavailable,
    /// Internal failure, including empty processor output
    SystemMalfunction,
}

impl ResponseCode {
    /// Two-digit wire code
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Approved => "00",
            Self::FormatError => "30",
            Self::ResponseTooLate => "68",
            Self::BackendUnavailable => "91",
            Self::SystemMalfunction => "96",
        }
    }

    /// Default human-readable message
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Approved => "Approved",
            Self::FormatError => "Format error",
            Self::ResponseTooLate => "Response received too late",
            Self::BackendUnavailable => "Backend unavailable",
            Self::SystemMalfunction => "System malfunction",
        }
    }

    /// Whether the code denotes success
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// JSON response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// Correlation id of the request being answered
    pub correlation_id: CorrelationId,
    /// Two-digit response code
    pub response_code: String,
    /// Human-readable detail
    pub response_message: String,
    /// When the response was produced
    pub timestamp: DateTime<Utc>,
}

impl ResponseEnvelope {
    /// Create an envelope with the code's default message
    #[must_use]
    pub fn new(correlation_id: CorrelationId, code: ResponseCode) -> Self {
        Self::with_message(correlation_id, code, code.message())
    }

    /// Create an envelope with a custom message
    pub fn with_message(
        correlation_id: CorrelationId,
        code: ResponseCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            response_code: code.code().to_string(),
            response_message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Serialize to wire bytes
    ///
    /// Never empty: if JSON encoding fails a minimal hand-built body is used.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            format!(
                r#"{{"correlationId":"{}","responseCode":"{}","timestamp":"{}"}}"#,
                self.correlation_id,
                self.response_code,
                self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
            )
            .into_bytes()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            ResponseCode::Approved,
            ResponseCode::FormatError,
            ResponseCode::ResponseTooLate,
            ResponseCode::BackendUnavailable,
            ResponseCode::SystemMalfunction,
        ];
        let unique: std::collections::HashSet<_> = codes.iter().map(|c| c.code()).collect();
        assert_eq!(unique.len(), codes.len());
        assert!(ResponseCode::Approved.is_success());
        assert!(!ResponseCode::SystemMalfunction.is_success());
    }

    #[test]
    fn test_envelope_json_shape() {
        let id = CorrelationId::from("abc123");
        let envelope = ResponseEnvelope::new(id, ResponseCode::SystemMalfunction);
        let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes()).unwrap();

        assert_eq!(value["correlationId"], "abc123");
        assert_eq!(value["responseCode"], "96");
        assert_eq!(value["responseMessage"], "System malfunction");
        assert!(value["timestamp"].is_string());
    }
}
