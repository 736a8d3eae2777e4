//! # QA Verifier
//!
//! Grades the answers of a retrieval-augmented chat workspace against
//! reference answers.
//!
//! ## Task Flow
//! 1. Receive a batch (CSV or spreadsheet upload) or single-question task via API or CLI
//! 2. Check credentials, find or create the workspace, upload documents
//! 3. Ask every question, score the answer against its reference
//! 4. Write the annotated CSV and the similarity summary
//! 5. Stream progress events to one observer until a terminal record
//!
//! ## Modules
//! - `task`: Task registry, progress channel, and wire streaming
//! - `pipeline`: Verification state machine
//! - `orchestrator`: Background task launch and terminal bookkeeping
//! - `anythingllm`: Chat workspace client
//! - `scoring`: Similarity scorers and summary reports
//! - `sheet`: CSV and spreadsheet question sources, CSV result sink

pub mod anythingllm;
pub mod api;
pub mod config;
pub mod orchestrator;
pub mod pipeline;
pub mod scoring;
pub mod sheet;
pub mod task;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use orchestrator::Orchestrator;
