//! Error response bodies produced for translated failures

use crate::error::FailureKind;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Body of a gateway error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Failure classification
    pub error: FailureKind,
    /// Human-readable message
    pub message: String,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: FailureKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }

    /// Serialize to a JSON body
    pub fn to_bytes(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(json) => Bytes::from(json),
            Err(_) => Bytes::from_static(b"{}"),
        }
    }
}
