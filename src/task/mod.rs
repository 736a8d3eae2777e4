//! Task module - task identity, the task registry, and the progress protocol.
//!
//! - `task`: ids, lifecycle status, finished-task payloads
//! - `registry`: concurrency-safe map of live tasks with TTL eviction
//! - `progress`: per-task event channel (producer side)
//! - `stream`: channel consumer that produces wire records for observers

pub mod progress;
pub mod registry;
pub mod stream;
pub mod task;

pub use progress::{progress_channel, ChannelItem, EventLevel, ProgressEvent, ProgressReceiver, ProgressSender};
pub use registry::{start_sweeper, NewTask, RegistryError, TaskRegistry, TaskSnapshot};
pub use stream::{progress_records, StreamSettings, StreamStatus, WireRecord};
pub use task::{SingleItemResult, TaskId, TaskKind, TaskStatus, VerificationSummary};
