// Error types and error handling module
// This file defines the error taxonomy shared by the stores, the config
// layer and the operator interfaces of the admission gate
//
// Numan Thabit 2025 Nov

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    #[error("{store} store unavailable: {reason}")]
    StoreUnavailable { store: &'static str, reason: String },
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GateError {
    pub fn unavailable(store: &'static str, reason: impl Into<String>) -> Self {
        GateError::StoreUnavailable {
            store,
            reason: reason.into(),
        }
    }

    /// True for failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, GateError::StoreUnavailable { .. })
    }
}
