//! HTTP API for the QA verifier.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/defaults` - Configured API endpoint and model
//! - `POST /api/validate_connection` - Check an endpoint and key
//! - `POST /api/verify` - Start a batch verification (multipart CSV or spreadsheet upload)
//! - `POST /api/verify/single` - Start a single-question verification
//! - `GET /api/stream/{id}` - Stream task progress via SSE
//! - `GET /api/tasks/{id}` - Task status and counts
//! - `GET /api/result/{id}` - Single-question result
//! - `GET /api/results/{id}` - List a task's output files
//! - `GET /api/preview/{id}/{file}` - HTML preview of an output file
//! - `GET /outputs/{id}/{file}` - Download an output file

mod results;
mod routes;
pub mod types;
mod verify;

pub use routes::{router, serve, AppState};
pub use types::*;
