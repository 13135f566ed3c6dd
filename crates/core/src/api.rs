use serde::{Deserialize, Serialize};

/// Body of a 202 response: the operation was admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedResponse {
    /// Always `"accepted"`.
    pub status: String,
    /// What was started.
    pub message: String,
}

impl AcceptedResponse {
    /// Builds an accepted body.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "accepted".into(),
            message: message.into(),
        }
    }
}

/// Body of an error response (400/409/500).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// `"conflict"` for 409, `"error"` otherwise.
    pub status: String,
    /// Human readable error.
    pub error: String,
}

impl ErrorResponse {
    /// Another operation holds the admission gate.
    pub fn conflict(error: impl Into<String>) -> Self {
        Self {
            status: "conflict".into(),
            error: error.into(),
        }
    }

    /// Any other failure.
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: error.into(),
        }
    }
}

/// Request to run a verification job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunRequest {
    /// Path to the job description on the daemon host.
    #[serde(default)]
    pub yaml_path: Option<String>,
}
