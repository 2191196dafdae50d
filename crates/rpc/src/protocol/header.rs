//! Per-frame request/response header.

use serde::{Deserialize, Serialize};

/// Header preceding every request and response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target in `Service.Method` form.
    pub service_method: String,
    /// Client-chosen sequence number; 0 is never assigned to a call.
    pub seq: u64,
    /// Empty on success.
    pub error: String,
}

impl Header {
    /// Header for an outgoing request.
    #[must_use]
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Whether the peer reported an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
