//! Test doubles and fixtures shared by unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::anythingllm::{ChatService, ChatServiceFactory, ServiceError, WorkspaceHandle, WorkspaceSettings};
use crate::config::{ApiConfig, Config};
use crate::scoring::{ScoringError, SimilarityScore, SimilarityScorer};
use crate::task::{ChannelItem, ProgressEvent, ProgressReceiver};

/// Chat service with per-question scripted outcomes. Unscripted questions are
/// echoed back.
pub struct ScriptedChat {
    auth: Result<(), ServiceError>,
    allow_create: bool,
    workspaces: Mutex<Vec<WorkspaceHandle>>,
    replies: HashMap<String, Result<Option<String>, ServiceError>>,
    failing_uploads: Vec<String>,
    chat_calls: AtomicUsize,
    created: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
}

impl ScriptedChat {
    pub fn new() -> Self {
        Self {
            auth: Ok(()),
            allow_create: true,
            workspaces: Mutex::new(vec![WorkspaceHandle {
                name: "QA".to_string(),
                slug: "qa".to_string(),
            }]),
            replies: HashMap::new(),
            failing_uploads: Vec::new(),
            chat_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(mut self, question: &str, answer: &str) -> Self {
        self.replies
            .insert(question.to_string(), Ok(Some(answer.to_string())));
        self
    }

    pub fn fail(mut self, question: &str, error: ServiceError) -> Self {
        self.replies.insert(question.to_string(), Err(error));
        self
    }

    pub fn rejecting_credentials(mut self) -> Self {
        self.auth = Err(ServiceError::http(403, "Invalid API Key".to_string()));
        self
    }

    pub fn refusing_workspace_creation(mut self) -> Self {
        self.allow_create = false;
        self
    }

    pub fn failing_upload(mut self, file_name: &str) -> Self {
        self.failing_uploads.push(file_name.to_string());
        self
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatService for ScriptedChat {
    async fn check_auth(&self) -> Result<(), ServiceError> {
        self.auth.clone()
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceHandle>, ServiceError> {
        Ok(self.workspaces.lock().unwrap().clone())
    }

    async fn create_workspace(
        &self,
        name: &str,
        _settings: &WorkspaceSettings,
    ) -> Result<WorkspaceHandle, ServiceError> {
        if !self.allow_create {
            return Err(ServiceError::http(500, "cannot create".to_string()));
        }
        let handle = WorkspaceHandle {
            name: name.to_string(),
            slug: name.to_lowercase().replace(' ', "-"),
        };
        self.created.lock().unwrap().push(name.to_string());
        self.workspaces.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn upload_document(
        &self,
        _slug: &str,
        path: &Path,
        _content_type: &str,
    ) -> Result<(), ServiceError> {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if self.failing_uploads.contains(&name) {
            return Err(ServiceError::http(422, "unsupported".to_string()));
        }
        self.uploads.lock().unwrap().push(name);
        Ok(())
    }

    async fn chat(&self, _slug: &str, message: &str) -> Result<Option<String>, ServiceError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.get(message) {
            Some(outcome) => outcome.clone(),
            None => Ok(Some(message.to_string())),
        }
    }
}

/// Hands out one shared `ScriptedChat` and remembers the API settings each
/// task asked for.
pub struct FixedFactory {
    chat: Arc<ScriptedChat>,
    seen: Mutex<Vec<ApiConfig>>,
}

impl FixedFactory {
    pub fn new(chat: Arc<ScriptedChat>) -> Self {
        Self {
            chat,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<ApiConfig> {
        self.seen.lock().unwrap().clone()
    }
}

impl ChatServiceFactory for FixedFactory {
    fn connect(&self, api: &ApiConfig) -> Arc<dyn ChatService> {
        self.seen.lock().unwrap().push(api.clone());
        self.chat.clone()
    }
}

/// Always fails.
pub struct FailingScorer;

#[async_trait]
impl SimilarityScorer for FailingScorer {
    fn metric_names(&self) -> Vec<String> {
        vec!["token_f1".to_string()]
    }

    async fn score(&self, _: &str, _: &str) -> Result<SimilarityScore, ScoringError> {
        Err(ScoringError::Embedding("scorer offline".to_string()))
    }
}

/// Panics on every call.
pub struct PanickingScorer;

#[async_trait]
impl SimilarityScorer for PanickingScorer {
    fn metric_names(&self) -> Vec<String> {
        vec!["token_f1".to_string()]
    }

    async fn score(&self, _: &str, _: &str) -> Result<SimilarityScore, ScoringError> {
        panic!("scorer bug")
    }
}

/// Defaults with working directories under `root`.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.api.api_key = Some("test-key".to_string());
    config.file.upload_dir = root.join("uploads");
    config.file.output_dir = root.join("output");
    config
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Every event currently queued, sentinel excluded.
pub fn drain_events(rx: &mut ProgressReceiver) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Some(item) = rx.try_recv() {
        match item {
            ChannelItem::Event(event) => events.push(event),
            ChannelItem::Done => break,
        }
    }
    events
}
