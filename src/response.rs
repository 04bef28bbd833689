//! Structured operation results for API callers.
//!
//! Every lifecycle operation can be reported as
//! `{success, message, data}` on success or `{success, message, error}` with
//! a typed error kind on failure.

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&Error> for ErrorInfo {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            hint: err.suggestion(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl<T> OperationResult<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(err: &Error) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            data: None,
            error: Some(ErrorInfo::from(err)),
        }
    }

    /// Report `result`, describing a success with `message`.
    pub fn from_result(
        result: crate::error::Result<T>,
        message: impl FnOnce(&T) -> String,
    ) -> Self {
        match result {
            Ok(data) => {
                let message = message(&data);
                Self::ok(message, data)
            }
            Err(err) => Self::failed(&err),
        }
    }
}
