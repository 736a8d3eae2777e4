//! Consumer side of the progress protocol.
//!
//! Drains one task's channel into a sequence of flat wire records. Each wait
//! is bounded by the heartbeat interval; an idle interval produces exactly one
//! heartbeat. A wall-clock ceiling detaches the observer with a `reconnect`
//! record while the pipeline keeps running. Delivery is at-most-once: events
//! consumed by an earlier session are not replayed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::progress::{ChannelItem, EventLevel, ProgressEvent};
use super::registry::{RegistryError, TaskRegistry};
use super::task::{TaskId, TaskStatus};

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub heartbeat: Duration,
    pub ceiling: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(10),
            ceiling: Duration::from_secs(60 * 60),
        }
    }
}

impl From<&crate::config::TaskConfig> for StreamSettings {
    fn from(tasks: &crate::config::TaskConfig) -> Self {
        Self {
            heartbeat: tasks.heartbeat_interval(),
            ceiling: tasks.stream_ceiling(),
        }
    }
}

/// How a stream session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Completed,
    Error,
    /// Ceiling reached; the task may still be running
    Reconnect,
}

/// A log or progress line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<EventLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Map<String, Value>>,
}

/// One self-describing record on the wire. Every variant serializes as a
/// flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireRecord {
    Log(LogRecord),
    Heartbeat {
        heartbeat: bool,
        timestamp: DateTime<Utc>,
    },
    Terminal {
        status: StreamStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        log: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
}

impl WireRecord {
    /// Wrap raw text as `{"log": text}`.
    pub fn raw(text: impl Into<String>) -> Self {
        WireRecord::Log(LogRecord {
            log: text.into(),
            level: None,
            timestamp: None,
            progress: None,
            status: None,
            detail: None,
        })
    }

    pub fn heartbeat() -> Self {
        WireRecord::Heartbeat {
            heartbeat: true,
            timestamp: Utc::now(),
        }
    }

    pub fn terminal(status: StreamStatus, log: Option<String>, detail: Option<Value>) -> Self {
        WireRecord::Terminal { status, log, detail }
    }

    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            WireRecord::Log(_) => "log",
            WireRecord::Heartbeat { .. } => "heartbeat",
            WireRecord::Terminal { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WireRecord::Terminal { .. })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "log": "unserializable record" }))
    }
}

impl From<ProgressEvent> for WireRecord {
    fn from(event: ProgressEvent) -> Self {
        WireRecord::Log(LogRecord {
            log: event.message,
            level: Some(event.level),
            timestamp: Some(event.timestamp),
            progress: event.progress,
            status: event.status,
            detail: event.detail,
        })
    }
}

/// Stream the progress of `task_id` as wire records, ending with exactly one
/// terminal record.
pub fn progress_records(
    registry: Arc<TaskRegistry>,
    task_id: TaskId,
    settings: StreamSettings,
) -> impl Stream<Item = WireRecord> + Send + 'static {
    async_stream::stream! {
        let mut receiver = match registry.subscribe(task_id).await {
            Ok(guard) => guard,
            Err(RegistryError::Busy(_)) => {
                yield WireRecord::terminal(
                    StreamStatus::Error,
                    Some(format!("Task {task_id} is already being streamed by another observer")),
                    None,
                );
                return;
            }
            Err(_) => {
                yield WireRecord::terminal(
                    StreamStatus::Error,
                    Some(format!("Task {task_id} not found")),
                    None,
                );
                return;
            }
        };

        let deadline = Instant::now() + settings.ceiling;
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::info!(task_id = %task_id, "Stream ceiling reached, asking observer to reconnect");
                yield WireRecord::terminal(
                    StreamStatus::Reconnect,
                    Some("Stream time limit reached, reconnect to continue".to_string()),
                    None,
                );
                return;
            }

            let wait = settings.heartbeat.min(deadline - now);
            match tokio::time::timeout(wait, receiver.recv()).await {
                Ok(Some(ChannelItem::Event(event))) => yield WireRecord::from(event),
                Ok(Some(ChannelItem::Done)) | Ok(None) => {
                    yield final_record(&registry, task_id).await;
                    return;
                }
                // A partial wait cut short by the ceiling is not a full idle interval.
                Err(_) if wait >= settings.heartbeat => yield WireRecord::heartbeat(),
                Err(_) => {}
            }
        }
    }
}

async fn final_record(registry: &TaskRegistry, task_id: TaskId) -> WireRecord {
    match registry.get(task_id).await {
        Ok(snapshot) => {
            let detail = snapshot
                .summary
                .as_ref()
                .and_then(|summary| serde_json::to_value(summary).ok());
            match snapshot.status {
                TaskStatus::Completed => WireRecord::terminal(StreamStatus::Completed, None, detail),
                TaskStatus::Error => WireRecord::terminal(
                    StreamStatus::Error,
                    Some("Verification failed".to_string()),
                    detail,
                ),
                other => WireRecord::terminal(
                    StreamStatus::Error,
                    Some(format!("Task channel closed while task was {other}")),
                    detail,
                ),
            }
        }
        Err(_) => WireRecord::terminal(
            StreamStatus::Error,
            Some(format!("Task {task_id} no longer available")),
            None,
        ),
    }
}
