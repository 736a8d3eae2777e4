//! Process-wide task registry.
//!
//! Maps task ids to their bookkeeping: status, creation time, the parked
//! consumer half of the progress channel, and any attached payloads. Entries
//! are evicted by age, whatever their status; eviction never touches the
//! pipeline that may still be running for the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::progress::ProgressReceiver;
use super::task::{SingleItemResult, TaskId, TaskKind, TaskStatus, VerificationSummary};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Task {0} already exists")]
    DuplicateId(TaskId),

    #[error("Invalid status transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {0} already has an active stream")]
    Busy(TaskId),
}

/// What the orchestrator hands over when registering a task.
#[derive(Debug)]
pub struct NewTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub receiver: ProgressReceiver,
}

struct TaskRecord {
    kind: TaskKind,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    receiver: Arc<Mutex<ProgressReceiver>>,
    result: Option<SingleItemResult>,
    summary: Option<VerificationSummary>,
}

/// Read-only view of a task, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<VerificationSummary>,
    pub has_result: bool,
}

impl TaskRecord {
    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            kind: self.kind,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            summary: self.summary.clone(),
            has_result: self.result.is_some(),
        }
    }
}

pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    ttl: Duration,
}

impl TaskRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a Pending task.
    pub async fn create(&self, task: NewTask) -> Result<TaskId, RegistryError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(RegistryError::DuplicateId(task.id));
        }
        let now = Utc::now();
        tasks.insert(
            task.id,
            TaskRecord {
                kind: task.kind,
                status: TaskStatus::Pending,
                created_at: now,
                updated_at: now,
                receiver: Arc::new(Mutex::new(task.receiver)),
                result: None,
                summary: None,
            },
        );
        tracing::debug!(task_id = %task.id, kind = ?task.kind, "Task registered");
        Ok(task.id)
    }

    pub async fn get(&self, id: TaskId) -> Result<TaskSnapshot, RegistryError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .map(|record| record.snapshot(id))
            .ok_or(RegistryError::NotFound(id))
    }

    pub async fn status(&self, id: TaskId) -> Result<TaskStatus, RegistryError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .map(|record| record.status)
            .ok_or(RegistryError::NotFound(id))
    }

    /// Move a task forward in its lifecycle. Setting the current status again
    /// is a no-op; anything else that isn't a forward step is rejected.
    pub async fn update_status(&self, id: TaskId, status: TaskStatus) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        if record.status == status {
            return Ok(());
        }
        if !record.status.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition {
                id,
                from: record.status,
                to: status,
            });
        }
        tracing::debug!(task_id = %id, from = %record.status, to = %status, "Task status changed");
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    pub async fn attach_result(&self, id: TaskId, result: SingleItemResult) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        record.result = Some(result);
        record.updated_at = Utc::now();
        Ok(())
    }

    pub async fn attach_summary(
        &self,
        id: TaskId,
        summary: VerificationSummary,
    ) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        record.summary = Some(summary);
        record.updated_at = Utc::now();
        Ok(())
    }

    /// The attached single-item result, if any.
    pub async fn result(&self, id: TaskId) -> Result<Option<SingleItemResult>, RegistryError> {
        let tasks = self.tasks.read().await;
        tasks
            .get(&id)
            .map(|record| record.result.clone())
            .ok_or(RegistryError::NotFound(id))
    }

    /// Take exclusive hold of a task's channel consumer.
    ///
    /// The guard keeps the receiver alive even if the entry is evicted while
    /// a stream is open. A second concurrent observer gets `Busy`.
    pub async fn subscribe(&self, id: TaskId) -> Result<OwnedMutexGuard<ProgressReceiver>, RegistryError> {
        let receiver = {
            let tasks = self.tasks.read().await;
            let record = tasks.get(&id).ok_or(RegistryError::NotFound(id))?;
            Arc::clone(&record.receiver)
        };
        receiver.try_lock_owned().map_err(|_| RegistryError::Busy(id))
    }

    /// Remove every entry older than the TTL. Returns how many were evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|id, record| {
            let keep = now.signed_duration_since(record.created_at) <= ttl;
            if !keep {
                tracing::debug!(task_id = %id, status = %record.status, "Evicting expired task");
            }
            keep
        });
        before - tasks.len()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

/// Periodically evict expired tasks.
pub fn start_sweeper(registry: Arc<TaskRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = registry.sweep(Utc::now()).await;
            if evicted > 0 {
                tracing::info!(evicted, "Swept expired tasks");
            }
        }
    })
}
