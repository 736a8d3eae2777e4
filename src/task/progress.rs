//! Per-task progress channel.
//!
//! One producer side (`ProgressSender`, cloned freely inside the task) and one
//! consumer side (`ProgressReceiver`, parked in the registry until an observer
//! subscribes). The channel carries structured events followed by exactly one
//! `ChannelItem::Done` sentinel.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::task::TaskId;

/// Severity of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// One structured progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    /// Overall percentage, 0-100
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Human-readable stage label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Map<String, Value>>,
}

impl ProgressEvent {
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            progress: None,
            status: None,
            detail: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(EventLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, message)
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Add one entry to the detail bag.
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// What travels through the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelItem {
    Event(ProgressEvent),
    /// Terminal sentinel; nothing follows it
    Done,
}

struct SenderState {
    finished: bool,
    last_progress: u8,
}

/// Producer half. Cheap to clone; all clones share the finished flag and the
/// progress high-water mark.
#[derive(Clone)]
pub struct ProgressSender {
    task_id: TaskId,
    tx: mpsc::UnboundedSender<ChannelItem>,
    // std mutex: never held across an await, and the send below is non-blocking.
    state: Arc<Mutex<SenderState>>,
}

/// Consumer half.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ChannelItem>,
}

/// Create the channel pair for one task.
pub fn progress_channel(task_id: TaskId) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = ProgressSender {
        task_id,
        tx,
        state: Arc::new(Mutex::new(SenderState {
            finished: false,
            last_progress: 0,
        })),
    };
    (sender, ProgressReceiver { rx })
}

impl ProgressSender {
    /// Push an event. Progress is raised to the high-water mark if it would
    /// go backwards. Returns `false` once the sentinel has been sent.
    ///
    /// A closed receiver (observer gone, task evicted) is not an error: the
    /// event is still mirrored to the log.
    pub fn send(&self, mut event: ProgressEvent) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.finished {
            tracing::debug!(task_id = %self.task_id, message = %event.message, "Dropping event after sentinel");
            return false;
        }
        if let Some(progress) = event.progress {
            let clamped = progress.max(state.last_progress);
            state.last_progress = clamped;
            event.progress = Some(clamped);
        }

        mirror(self.task_id, &event);
        let _ = self.tx.send(ChannelItem::Event(event));
        true
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.send(ProgressEvent::info(message))
    }

    pub fn warning(&self, message: impl Into<String>) -> bool {
        self.send(ProgressEvent::warning(message))
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(ProgressEvent::error(message))
    }

    /// Push the terminal sentinel. Only the first call has an effect.
    pub fn finish(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.finished {
            return false;
        }
        state.finished = true;
        let _ = self.tx.send(ChannelItem::Done);
        tracing::debug!(task_id = %self.task_id, "Progress channel finished");
        true
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().map(|s| s.finished).unwrap_or(true)
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender")
            .field("task_id", &self.task_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn mirror(task_id: TaskId, event: &ProgressEvent) {
    match event.level {
        EventLevel::Info => tracing::info!(
            task_id = %task_id,
            progress = ?event.progress,
            status = ?event.status,
            "{}",
            event.message
        ),
        EventLevel::Warning => tracing::warn!(
            task_id = %task_id,
            progress = ?event.progress,
            "{}",
            event.message
        ),
        EventLevel::Error => tracing::error!(
            task_id = %task_id,
            progress = ?event.progress,
            "{}",
            event.message
        ),
    }
}

impl ProgressReceiver {
    /// Wait for the next item. `None` means every sender is gone.
    pub async fn recv(&mut self) -> Option<ChannelItem> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<ChannelItem> {
        self.rx.try_recv().ok()
    }
}
