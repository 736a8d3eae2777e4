//! Command-line batch runner.
//!
//! Runs one batch verification through the same orchestrator the server
//! uses and prints every wire record as a JSON line on stdout. Logs go to
//! stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qa_verifier::config::Config;
use qa_verifier::orchestrator::Orchestrator;
use qa_verifier::pipeline::AdvancedOverrides;
use qa_verifier::task::{progress_records, StreamSettings, StreamStatus, WireRecord};

#[derive(Debug, Parser)]
#[command(name = "qa-verify", version, about = "Verify a workspace's answers against a CSV of reference answers")]
struct Args {
    /// Workspace name (created if missing)
    #[arg(short, long)]
    workspace: String,

    /// CSV or spreadsheet source, or a directory of CSV files
    #[arg(short = 'e', long)]
    source: Option<PathBuf>,

    /// Directory of reference documents to upload first
    #[arg(short, long)]
    documents: Option<PathBuf>,

    /// Output directory (defaults to the configured one)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long, env = "QA_VERIFY_API_URL")]
    api_url: Option<String>,

    /// Override the model
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qa_verifier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(output) = args.output {
        config.file.output_dir = output;
    }
    let source = args
        .source
        .unwrap_or_else(|| config.file.default_source.clone());
    let documents = args.documents.or_else(|| config.file.default_upload_dir.clone());

    let settings = StreamSettings::from(&config.tasks);
    let orchestrator = Orchestrator::from_config(config);
    let overrides = AdvancedOverrides {
        api_url: args.api_url,
        model: args.model,
        ..AdvancedOverrides::default()
    };

    let task_id = orchestrator
        .start_batch(args.workspace, source, documents, overrides)
        .await?;
    tracing::info!(task = %task_id, "Verification started");

    let registry = Arc::clone(orchestrator.registry());
    let status = loop {
        let mut records = Box::pin(progress_records(Arc::clone(&registry), task_id, settings));
        let mut terminal = None;
        while let Some(record) = records.next().await {
            println!("{}", record.to_json());
            if let WireRecord::Terminal { status, .. } = record {
                terminal = Some(status);
            }
        }
        match terminal {
            Some(StreamStatus::Reconnect) => continue,
            Some(status) => break status,
            None => break StreamStatus::Error,
        }
    };

    tracing::info!(
        task = %task_id,
        output = %orchestrator.output_dir(task_id).display(),
        "Verification finished: {:?}",
        status
    );

    Ok(match status {
        StreamStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
