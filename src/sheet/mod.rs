//! Question/answer sources and the result artifact.
//!
//! A source is one or more groups (CSV files or spreadsheet sheets) of rows
//! whose first two columns are a question and its reference answer. Results
//! are written back next to each row: model response, then one column per
//! similarity metric.

mod workbook;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::scoring::SimilarityScore;

pub use workbook::{is_spreadsheet, Workbook, RESPONSE_COLUMN};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to read {0}: {1}")]
    Read(PathBuf, String),

    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, String),

    #[error("No question sources found in {0}")]
    NoSources(PathBuf),

    #[error("No row at position {position} in group {group}")]
    UnknownItem { group: String, position: usize },

    #[error("Failed to render group {0}: {1}")]
    Render(String, String),

    #[error("Failed to write {0}: {1}")]
    Write(PathBuf, String),
}

/// One non-blank question/answer pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QaItem {
    /// Group (sheet) name
    pub group: String,
    /// 1-based index among the group's non-blank items
    pub ordinal: usize,
    /// 0-based row index in the backing source, blank rows included
    pub position: usize,
    pub question: String,
    pub reference_answer: String,
}

/// Accumulates per-item results and persists them.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Every item, groups in order, rows in source order.
    fn items(&self) -> Vec<QaItem>;

    /// Number of groups.
    fn group_count(&self) -> usize;

    /// Set the metric columns. Call before the first `record`.
    fn declare_metrics(&mut self, names: &[String]);

    /// Store a response (and scores, when scoring succeeded) at the item's row.
    fn record(
        &mut self,
        item: &QaItem,
        response: &str,
        scores: Option<&SimilarityScore>,
    ) -> Result<(), SinkError>;

    /// Write one file per group into `dir`; returns the files written.
    async fn persist(&self, dir: &Path) -> Result<Vec<PathBuf>, SinkError>;
}
