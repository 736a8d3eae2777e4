//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::pipeline::AdvancedOverrides;
use crate::task::TaskId;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Configured defaults shown to clients. The key itself is never returned.
#[derive(Debug, Clone, Serialize)]
pub struct DefaultsResponse {
    pub api_url: String,
    pub has_api_key: bool,
    pub model: String,
    pub similarity_threshold: f64,
}

/// Request to check an endpoint and key before starting a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateConnectionRequest {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidateConnectionResponse {
    pub success: bool,
    pub message: String,
}

/// Request to verify one question.
#[derive(Debug, Clone, Deserialize)]
pub struct SingleVerifyRequest {
    pub workspace: String,
    pub question: String,
    #[serde(alias = "answer", alias = "reference")]
    pub reference_answer: String,
    #[serde(flatten)]
    pub overrides: AdvancedOverrides,
}

/// Response after starting a task.
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub message: String,
    pub task_id: TaskId,
}
