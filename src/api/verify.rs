//! Connection checks and task submission.

use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};

use super::routes::AppState;
use super::types::*;
use crate::anythingllm::ServiceErrorKind;
use crate::config::ApiConfig;
use crate::pipeline::{AdvancedOverrides, VerificationRequest};
use crate::sheet::is_spreadsheet;
use crate::task::TaskId;
use crate::util::{path_within, sanitize_file_name};

/// Timeout for the connection check, shorter than a chat request.
const VALIDATE_TIMEOUT_SECS: u64 = 10;

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn is_accepted_source(file_name: &str) -> bool {
    let path = std::path::Path::new(file_name);
    is_spreadsheet(path)
        || path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Check that the endpoint answers and accepts the key.
pub(super) async fn validate_connection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ValidateConnectionRequest>,
) -> Result<Json<ValidateConnectionResponse>, (StatusCode, Json<ValidateConnectionResponse>)> {
    let failure = |status: StatusCode, message: String| {
        (
            status,
            Json(ValidateConnectionResponse {
                success: false,
                message,
            }),
        )
    };

    let (Some(api_url), Some(api_key)) = (non_blank(req.api_url), non_blank(req.api_key)) else {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            "API URL and API key are required".to_string(),
        ));
    };

    let api = ApiConfig {
        base_url: api_url,
        api_key: Some(api_key),
        request_timeout_secs: VALIDATE_TIMEOUT_SECS,
    };
    let service = state.orchestrator.services().connect(&api);

    match service.check_auth().await {
        Ok(()) => Ok(Json(ValidateConnectionResponse {
            success: true,
            message: "Connection successful".to_string(),
        })),
        Err(e) => {
            tracing::warn!(url = %api.base_url, error = %e, "Connection check failed");
            Err(match e.kind {
                ServiceErrorKind::Unauthorized => failure(
                    StatusCode::UNAUTHORIZED,
                    "Authentication failed: invalid API key".to_string(),
                ),
                ServiceErrorKind::Timeout => failure(
                    StatusCode::REQUEST_TIMEOUT,
                    "Connection timed out".to_string(),
                ),
                ServiceErrorKind::MissingCredential => failure(
                    StatusCode::BAD_REQUEST,
                    "API URL and API key are required".to_string(),
                ),
                _ => failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Connection failed: {}", e.message),
                ),
            })
        }
    }
}

/// Start a batch verification from a multipart upload.
///
/// Fields: `workspace`, `source_file` (CSV), and the optional overrides
/// `api_url`, `api_key`, `model`, `similarity_threshold`.
pub(super) async fn verify(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<StartResponse>, (StatusCode, String)> {
    let mut workspace = None;
    let mut source: Option<(String, Vec<u8>)> = None;
    let mut overrides = AdvancedOverrides::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Invalid upload: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "source_file" | "excel_file" => {
                let file_name = field.file_name().unwrap_or_default().trim().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("Failed to read upload: {}", e)))?;
                source = Some((file_name, data.to_vec()));
            }
            "workspace" | "api_url" | "api_key" | "model" | "similarity_threshold" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("Failed to read field {}: {}", name, e)))?;
                let value = non_blank(Some(value));
                match name.as_str() {
                    "workspace" => workspace = value,
                    "api_url" => overrides.api_url = value,
                    "api_key" => overrides.api_key = value,
                    "model" => overrides.model = value,
                    _ => {
                        overrides.similarity_threshold = value
                            .map(|v| v.parse::<f64>())
                            .transpose()
                            .map_err(|_| bad_request("similarity_threshold must be a number"))?;
                    }
                }
            }
            _ => {}
        }
    }

    let workspace = workspace.ok_or_else(|| bad_request("Workspace name is required"))?;
    let (file_name, data) = source
        .filter(|(file_name, _)| !file_name.is_empty())
        .ok_or_else(|| bad_request("No source file selected"))?;
    if !is_accepted_source(&file_name) {
        return Err(bad_request(
            "Source file must be a .csv file or a spreadsheet (.xlsx, .xlsm, .xlsb, .xls, .ods)",
        ));
    }

    let task_id = TaskId::new();
    let upload_dir = state.config.file.upload_dir.join(task_id.to_string());
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .map_err(internal_error)?;
    let target = upload_dir.join(sanitize_file_name(&file_name));
    if !path_within(&upload_dir, &target) {
        return Err(bad_request("Invalid file name"));
    }
    tokio::fs::write(&target, &data)
        .await
        .map_err(internal_error)?;

    tracing::info!(task = %task_id, workspace = %workspace, file = %target.display(), "Batch verification requested");

    let task_id = state
        .orchestrator
        .start_as(
            task_id,
            VerificationRequest::Batch {
                workspace,
                source: target,
                documents: None,
                overrides,
            },
        )
        .await
        .map_err(internal_error)?;

    Ok(Json(StartResponse {
        message: "Verification started".to_string(),
        task_id,
    }))
}

/// Start a single-question verification.
pub(super) async fn verify_single(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SingleVerifyRequest>,
) -> Result<Json<StartResponse>, (StatusCode, String)> {
    let workspace = non_blank(Some(req.workspace));
    let question = non_blank(Some(req.question));
    let reference_answer = non_blank(Some(req.reference_answer));
    let (Some(workspace), Some(question), Some(reference_answer)) =
        (workspace, question, reference_answer)
    else {
        return Err(bad_request(
            "Workspace, question and reference answer are required",
        ));
    };

    let task_id = state
        .orchestrator
        .start_single(workspace, question, reference_answer, req.overrides)
        .await
        .map_err(internal_error)?;

    Ok(Json(StartResponse {
        message: "Verification started".to_string(),
        task_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anythingllm::ServiceError;
    use crate::orchestrator::Orchestrator;
    use crate::scoring::{LexicalScorer, SummaryReport};
    use crate::task::{TaskKind, TaskRegistry};
    use crate::testing::{test_config, FixedFactory, ScriptedChat};

    fn state_with(root: &std::path::Path, chat: ScriptedChat) -> (Arc<AppState>, Arc<FixedFactory>) {
        let config = test_config(root);
        let registry = Arc::new(TaskRegistry::new(config.tasks.ttl()));
        let factory = Arc::new(FixedFactory::new(Arc::new(chat)));
        let orchestrator = Orchestrator::new(
            config,
            registry,
            factory.clone(),
            Arc::new(SummaryReport),
        )
        .with_scorer(Arc::new(LexicalScorer));
        (Arc::new(AppState::new(orchestrator)), factory)
    }

    fn connection(url: &str, key: &str) -> Json<ValidateConnectionRequest> {
        Json(ValidateConnectionRequest {
            api_url: Some(url.to_string()),
            api_key: Some(key.to_string()),
        })
    }

    #[tokio::test]
    async fn validate_requires_url_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with(dir.path(), ScriptedChat::new());

        let (status, Json(body)) = validate_connection(State(state), connection("http://x", "  "))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
    }

    #[tokio::test]
    async fn validate_success_uses_given_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (state, factory) = state_with(dir.path(), ScriptedChat::new());

        let Json(body) = validate_connection(State(state), connection("http://llm:3001", "k"))
            .await
            .unwrap();
        assert!(body.success);

        let seen = factory.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].base_url, "http://llm:3001");
        assert_eq!(seen[0].api_key.as_deref(), Some("k"));
        assert_eq!(seen[0].request_timeout_secs, VALIDATE_TIMEOUT_SECS);
    }

    #[tokio::test]
    async fn validate_maps_rejected_key_to_401() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with(dir.path(), ScriptedChat::new().rejecting_credentials());

        let (status, _) = validate_connection(State(state), connection("http://llm", "bad"))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn uploads_accept_csv_and_spreadsheets() {
        assert!(is_accepted_source("qa.csv"));
        assert!(is_accepted_source("QA.CSV"));
        assert!(is_accepted_source("問題集.xlsx"));
        assert!(is_accepted_source("book.ods"));
        assert!(!is_accepted_source("notes.txt"));
        assert!(!is_accepted_source("csv"));
    }

    #[tokio::test]
    async fn single_rejects_blank_question() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with(dir.path(), ScriptedChat::new());

        let req = SingleVerifyRequest {
            workspace: "QA".to_string(),
            question: "   ".to_string(),
            reference_answer: "Paris".to_string(),
            overrides: AdvancedOverrides::default(),
        };
        let (status, _) = verify_single(State(state.clone()), Json(req))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.orchestrator.registry().is_empty().await);
    }

    #[tokio::test]
    async fn single_registers_a_task() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = state_with(dir.path(), ScriptedChat::new());

        let req: SingleVerifyRequest = serde_json::from_value(serde_json::json!({
            "workspace": "QA",
            "question": "Capital of France?",
            "answer": "Paris",
            "model": "llama3"
        }))
        .unwrap();
        assert_eq!(req.reference_answer, "Paris");
        assert_eq!(req.overrides.model.as_deref(), Some("llama3"));

        let Json(body) = verify_single(State(state.clone()), Json(req)).await.unwrap();
        let snapshot = state.orchestrator.registry().get(body.task_id).await.unwrap();
        assert_eq!(snapshot.kind, TaskKind::Single);
    }

    #[test]
    fn timeout_errors_are_not_auth_errors() {
        assert!(!ServiceError::timeout("slow".to_string()).is_auth());
    }
}
