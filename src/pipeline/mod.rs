//! Verification pipeline: request variants, stages and the state machine.
//!
//! Batch and single verification share one state machine. A batch reads its
//! items from a CSV source and may ingest reference documents; a single
//! request is a one-item workbook whose result is also returned in memory.

mod error;
mod runner;

use std::path::PathBuf;

use serde::Deserialize;

use crate::config::Config;
use crate::task::TaskKind;

pub use error::PipelineError;
pub use runner::{PipelineOutcome, VerificationPipeline};

/// Per-task overrides of the loaded configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AdvancedOverrides {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub similarity_threshold: Option<f64>,
}

impl AdvancedOverrides {
    /// Apply non-empty overrides to `config`; returns one line per override
    /// applied. The key itself never appears in the lines.
    pub fn apply(&self, config: &mut Config) -> Vec<String> {
        let mut applied = Vec::new();
        if let Some(url) = non_empty(&self.api_url) {
            config.api.base_url = url.trim_end_matches('/').to_string();
            applied.push(format!("Using API endpoint {}", config.api.base_url));
        }
        if let Some(key) = non_empty(&self.api_key) {
            config.api.api_key = Some(key.to_string());
            applied.push("Using the API key supplied with the request".to_string());
        }
        if let Some(model) = non_empty(&self.model) {
            config.workspace.model = model.to_string();
            applied.push(format!("Using chat model {}", model));
        }
        if let Some(threshold) = self.similarity_threshold {
            if (0.0..=1.0).contains(&threshold) {
                config.analyzer.similarity_threshold = threshold;
                applied.push(format!("Using similarity threshold {:.2}", threshold));
            } else {
                applied.push(format!(
                    "Ignoring similarity threshold {} outside 0..1",
                    threshold
                ));
            }
        }
        applied
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// What to verify.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationRequest {
    /// Every item of a CSV file or directory of CSV files
    Batch {
        workspace: String,
        source: PathBuf,
        /// Reference documents to ingest first
        documents: Option<PathBuf>,
        overrides: AdvancedOverrides,
    },
    /// One question, answered in memory
    Single {
        workspace: String,
        question: String,
        reference_answer: String,
        overrides: AdvancedOverrides,
    },
}

impl VerificationRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            VerificationRequest::Batch { .. } => TaskKind::Batch,
            VerificationRequest::Single { .. } => TaskKind::Single,
        }
    }

    pub fn workspace(&self) -> &str {
        match self {
            VerificationRequest::Batch { workspace, .. }
            | VerificationRequest::Single { workspace, .. } => workspace,
        }
    }

    pub fn overrides(&self) -> &AdvancedOverrides {
        match self {
            VerificationRequest::Batch { overrides, .. }
            | VerificationRequest::Single { overrides, .. } => overrides,
        }
    }
}

/// Pipeline states in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    AuthCheck,
    WorkspaceResolve,
    DocumentIngestion,
    ItemProcessing,
    ReportGeneration,
    Persist,
    Done,
}

impl Stage {
    /// Progress band `(start, end)` in percent.
    pub fn band(&self) -> (u8, u8) {
        match self {
            Stage::Init => (0, 5),
            Stage::AuthCheck => (5, 10),
            Stage::WorkspaceResolve => (10, 20),
            Stage::DocumentIngestion => (20, 30),
            Stage::ItemProcessing => (30, 85),
            Stage::ReportGeneration => (85, 95),
            Stage::Persist => (95, 100),
            Stage::Done => (100, 100),
        }
    }

    /// Status label shown to observers.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Init => "Initializing",
            Stage::AuthCheck => "Checking credentials",
            Stage::WorkspaceResolve => "Resolving workspace",
            Stage::DocumentIngestion => "Uploading documents",
            Stage::ItemProcessing => "Processing questions",
            Stage::ReportGeneration => "Generating report",
            Stage::Persist => "Saving results",
            Stage::Done => "Completed",
        }
    }

    /// Percentage `done/total` of the way through this stage's band.
    pub fn progress_at(&self, done: usize, total: usize) -> u8 {
        let (start, end) = self.band();
        if total == 0 {
            return end;
        }
        let span = usize::from(end - start);
        let advanced = span * done.min(total) / total;
        start + advanced as u8
    }
}
