//! Task identity, lifecycle status, and the payloads a finished task carries.
//!
//! # Invariants
//! - `TaskId`s are v4 UUIDs and never reused within a process
//! - Status only moves forward: `Pending -> Running -> {Completed | Error}`

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scoring::SimilarityScore;

/// Unique identifier for a verification task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a fresh random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self::from)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Running -> Completed
///                   \-> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, pipeline not yet started
    Pending,
    /// Pipeline is executing
    Running,
    /// Pipeline finished; individual items may still have been skipped
    Completed,
    /// A fatal pipeline state failed or the pipeline crashed
    Error,
}

impl TaskStatus {
    /// `true` for Completed and Error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Error)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Error)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Which request variant a task was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Batch,
    Single,
}

/// Structured counts of what a verification run did.
///
/// `submitted - scored` items were skipped (dispatch or scoring failure).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    /// Non-blank question/answer pairs read from the source
    pub submitted: usize,
    /// Items that produced a similarity score
    pub scored: usize,
    /// Items whose dispatch or scoring failed
    pub skipped: usize,
    pub documents_uploaded: usize,
    pub documents_failed: usize,
}

/// In-memory result of a single-item verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleItemResult {
    pub question: String,
    pub reference_answer: String,
    /// Answer with reasoning spans removed
    pub response: String,
    pub scores: SimilarityScore,
}
