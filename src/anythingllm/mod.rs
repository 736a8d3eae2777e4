//! External chat service: workspaces, document ingestion and question dispatch.
//!
//! `ChatService` is the seam the pipeline talks to; `AnythingLlmClient` is the
//! HTTP implementation. A `ChatServiceFactory` builds one client per task from
//! that task's effective API settings.

mod client;
mod error;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ApiConfig, Config};

pub use client::{parse_workspace_listing, AnythingLlmClient};
pub use error::{classify_http_status, ServiceError, ServiceErrorKind};

/// A workspace on the chat service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub name: String,
    pub slug: String,
}

/// Generation parameters sent when creating a workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceSettings {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub history_length: u32,
    pub system_prompt: String,
    pub query_refusal_response: String,
    pub chat_mode: String,
    pub top_n: u32,
    pub similarity_threshold: f64,
}

impl WorkspaceSettings {
    /// Settings from the configured workspace defaults and analyzer threshold.
    pub fn from_config(config: &Config) -> Self {
        let defaults = &config.workspace;
        Self {
            provider: defaults.provider.clone(),
            model: defaults.model.clone(),
            temperature: defaults.temperature,
            history_length: defaults.history_length,
            system_prompt: defaults.system_prompt.clone(),
            query_refusal_response: defaults.query_refusal_response.clone(),
            chat_mode: defaults.chat_mode.clone(),
            top_n: defaults.top_n,
            similarity_threshold: config.analyzer.similarity_threshold,
        }
    }
}

/// Operations the verification pipeline needs from the chat service.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Verify the configured credential.
    async fn check_auth(&self) -> Result<(), ServiceError>;

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceHandle>, ServiceError>;

    async fn create_workspace(
        &self,
        name: &str,
        settings: &WorkspaceSettings,
    ) -> Result<WorkspaceHandle, ServiceError>;

    /// Upload one file and embed it into the workspace.
    async fn upload_document(
        &self,
        slug: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), ServiceError>;

    /// Ask one question. `Ok(None)` means the service answered without a
    /// text response.
    async fn chat(&self, slug: &str, message: &str) -> Result<Option<String>, ServiceError>;

    /// Find a workspace whose display name or slug equals `name`.
    async fn find_workspace(&self, name: &str) -> Result<Option<WorkspaceHandle>, ServiceError> {
        let workspaces = self.list_workspaces().await?;
        Ok(workspaces
            .into_iter()
            .find(|ws| ws.name == name || ws.slug == name))
    }
}

/// Builds the chat client a task will use.
pub trait ChatServiceFactory: Send + Sync {
    fn connect(&self, api: &ApiConfig) -> Arc<dyn ChatService>;
}

/// Factory for the HTTP client.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnythingLlmConnector;

impl ChatServiceFactory for AnythingLlmConnector {
    fn connect(&self, api: &ApiConfig) -> Arc<dyn ChatService> {
        Arc::new(AnythingLlmClient::new(api))
    }
}
