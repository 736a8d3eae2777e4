//! HTTP client for an AnythingLLM-compatible developer API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ChatService, ServiceError, WorkspaceHandle, WorkspaceSettings};
use crate::config::ApiConfig;

/// Questions are answered from workspace documents only.
const CHAT_MODE: &str = "query";

/// Client for one API endpoint and credential.
pub struct AnythingLlmClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnythingLlmClient {
    pub fn new(api: &ApiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(api.request_timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone().filter(|key| !key.trim().is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Send and turn non-success statuses into classified errors.
    async fn send(&self, request: RequestBuilder) -> Result<Response, ServiceError> {
        let resp = self.authorized(request).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!("Chat service error: {} - {}", status, truncate(&body, 300));
        Err(ServiceError::http(status.as_u16(), body))
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ServiceError> {
        let text = self.send(request).await?.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ServiceError::parse_error(format!(
                "Failed to parse response: {} - {}",
                e,
                truncate(&text, 300)
            ))
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkspaceRequest<'a> {
    name: &'a str,
    similarity_threshold: f64,
    open_ai_temp: f64,
    open_ai_history: u32,
    open_ai_prompt: &'a str,
    query_refusal_response: &'a str,
    chat_mode: &'a str,
    top_n: u32,
    chat_provider: &'a str,
    chat_model: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateWorkspaceResponse {
    workspace: Option<WorkspaceEntry>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceEntry {
    #[serde(default)]
    name: Option<String>,
    slug: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest<'a> {
    message: &'a str,
    mode: &'a str,
    session_id: String,
    reset: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    #[serde(default)]
    text_response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default = "default_true")]
    authenticated: bool,
}

fn default_true() -> bool {
    true
}

/// Workspace listings come either as a bare array or as `{"workspaces": [...]}`.
pub fn parse_workspace_listing(value: Value) -> Result<Vec<WorkspaceHandle>, ServiceError> {
    let entries = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("workspaces") {
            Some(Value::Array(items)) => items,
            Some(_) | None => Vec::new(),
        },
        other => {
            return Err(ServiceError::parse_error(format!(
                "Unexpected workspace listing: {}",
                other
            )))
        }
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<WorkspaceEntry>(entry).ok())
        .filter_map(|entry| {
            let slug = entry.slug?;
            Some(WorkspaceHandle {
                name: entry.name.unwrap_or_else(|| slug.clone()),
                slug,
            })
        })
        .collect())
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl ChatService for AnythingLlmClient {
    async fn check_auth(&self) -> Result<(), ServiceError> {
        if self.api_key.is_none() {
            return Err(ServiceError::missing_credential());
        }
        let auth: AuthResponse = self
            .send_json(self.client.get(self.url("/api/v1/auth")))
            .await?;
        if !auth.authenticated {
            return Err(ServiceError::http(403, "Credential not accepted".to_string()));
        }
        Ok(())
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceHandle>, ServiceError> {
        let listing: Value = self
            .send_json(self.client.get(self.url("/api/v1/workspaces")))
            .await?;
        parse_workspace_listing(listing)
    }

    async fn create_workspace(
        &self,
        name: &str,
        settings: &WorkspaceSettings,
    ) -> Result<WorkspaceHandle, ServiceError> {
        let body = CreateWorkspaceRequest {
            name,
            similarity_threshold: settings.similarity_threshold,
            open_ai_temp: settings.temperature,
            open_ai_history: settings.history_length,
            open_ai_prompt: &settings.system_prompt,
            query_refusal_response: &settings.query_refusal_response,
            chat_mode: &settings.chat_mode,
            top_n: settings.top_n,
            chat_provider: &settings.provider,
            chat_model: &settings.model,
        };
        let created: CreateWorkspaceResponse = self
            .send_json(self.client.post(self.url("/api/v1/workspace/new")).json(&body))
            .await?;

        let entry = created
            .workspace
            .ok_or_else(|| ServiceError::parse_error("Response has no workspace".to_string()))?;
        let slug = entry
            .slug
            .ok_or_else(|| ServiceError::parse_error("Workspace has no slug".to_string()))?;
        Ok(WorkspaceHandle {
            name: entry.name.unwrap_or_else(|| name.to_string()),
            slug,
        })
    }

    async fn upload_document(
        &self,
        slug: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), ServiceError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ServiceError::io(format!("Failed to read {}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(content_type)
            .map_err(|e| ServiceError::io(format!("Invalid content type {}: {}", content_type, e)))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("addToWorkspaces", slug.to_string());

        self.send(self.client.post(self.url("/api/v1/document/upload")).multipart(form))
            .await?;
        Ok(())
    }

    async fn chat(&self, slug: &str, message: &str) -> Result<Option<String>, ServiceError> {
        let body = ChatRequest {
            message,
            mode: CHAT_MODE,
            session_id: Uuid::new_v4().to_string(),
            reset: false,
        };
        let path = format!("/api/v1/workspace/{}/chat", urlencoding::encode(slug));
        let reply: ChatResponse = self
            .send_json(self.client.post(self.url(&path)).json(&body))
            .await?;

        if let Some(error) = reply.error.filter(|e| !e.is_empty()) {
            tracing::warn!(workspace = %slug, "Chat service reported: {}", error);
        }
        Ok(reply.text_response)
    }
}
