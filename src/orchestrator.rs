//! Task orchestrator: registers a task, runs its pipeline in the background,
//! and records the outcome.
//!
//! Every launched task ends with exactly one terminal status update followed
//! by exactly one sentinel on its channel, whether the pipeline succeeds,
//! fails, or panics.

use std::path::PathBuf;
use std::sync::Arc;

use crate::anythingllm::{AnythingLlmConnector, ChatServiceFactory};
use crate::config::Config;
use crate::pipeline::{AdvancedOverrides, PipelineError, PipelineOutcome, VerificationPipeline, VerificationRequest};
use crate::scoring::{scorer_from_config, ReportGenerator, SimilarityScorer, SummaryReport};
use crate::task::{
    progress_channel, start_sweeper, NewTask, ProgressEvent, ProgressSender, RegistryError, TaskId,
    TaskRegistry, TaskStatus,
};

/// Sends the sentinel when dropped, covering unwinds out of `run_task`.
struct SentinelGuard(ProgressSender);

impl Drop for SentinelGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Config,
    registry: Arc<TaskRegistry>,
    services: Arc<dyn ChatServiceFactory>,
    reports: Arc<dyn ReportGenerator>,
    /// Fixed scorer; `None` builds one per task from its effective config.
    scorer: Option<Arc<dyn SimilarityScorer>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: Arc<TaskRegistry>,
        services: Arc<dyn ChatServiceFactory>,
        reports: Arc<dyn ReportGenerator>,
    ) -> Self {
        Self {
            config,
            registry,
            services,
            reports,
            scorer: None,
        }
    }

    /// HTTP chat client, configured scorers and the summary report.
    pub fn from_config(config: Config) -> Self {
        let registry = Arc::new(TaskRegistry::new(config.tasks.ttl()));
        Self::new(
            config,
            registry,
            Arc::new(AnythingLlmConnector),
            Arc::new(SummaryReport),
        )
    }

    /// Use `scorer` for every task instead of building one from config.
    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Arc<dyn ChatServiceFactory> {
        &self.services
    }

    /// Output directory of a task.
    pub fn output_dir(&self, id: TaskId) -> PathBuf {
        self.config.file.output_dir.join(id.to_string())
    }

    /// Start evicting expired tasks in the background.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        start_sweeper(Arc::clone(&self.registry), self.config.tasks.sweep_interval())
    }

    pub async fn start_batch(
        &self,
        workspace: String,
        source: PathBuf,
        documents: Option<PathBuf>,
        overrides: AdvancedOverrides,
    ) -> Result<TaskId, RegistryError> {
        self.start(VerificationRequest::Batch {
            workspace,
            source,
            documents,
            overrides,
        })
        .await
    }

    pub async fn start_single(
        &self,
        workspace: String,
        question: String,
        reference_answer: String,
        overrides: AdvancedOverrides,
    ) -> Result<TaskId, RegistryError> {
        self.start(VerificationRequest::Single {
            workspace,
            question,
            reference_answer,
            overrides,
        })
        .await
    }

    /// Register a Pending task and launch its pipeline. Returns immediately.
    pub async fn start(&self, request: VerificationRequest) -> Result<TaskId, RegistryError> {
        self.start_as(TaskId::new(), request).await
    }

    /// `start` with a caller-allocated id, for callers that stage files
    /// under the task id first. Fails on an id already registered.
    pub async fn start_as(&self, id: TaskId, request: VerificationRequest) -> Result<TaskId, RegistryError> {
        let (progress, receiver) = progress_channel(id);
        self.registry
            .create(NewTask {
                id,
                kind: request.kind(),
                receiver,
            })
            .await?;

        let mut config = self.config.clone();
        let applied = request.overrides().apply(&mut config);
        let chat = self.services.connect(&config.api);
        let scorer = match &self.scorer {
            Some(scorer) => Arc::clone(scorer),
            None => scorer_from_config(&config.analyzer),
        };
        let pipeline = VerificationPipeline::new(
            config,
            chat,
            scorer,
            Arc::clone(&self.reports),
            progress.clone(),
            self.output_dir(id),
        );

        tracing::info!(task_id = %id, kind = ?request.kind(), workspace = %request.workspace(), "Starting verification task");
        tokio::spawn(run_task(
            Arc::clone(&self.registry),
            id,
            pipeline,
            request,
            progress,
            applied,
        ));
        Ok(id)
    }
}

async fn run_task(
    registry: Arc<TaskRegistry>,
    id: TaskId,
    pipeline: VerificationPipeline,
    request: VerificationRequest,
    progress: ProgressSender,
    applied_overrides: Vec<String>,
) {
    let _sentinel = SentinelGuard(progress.clone());

    if let Err(e) = registry.update_status(id, TaskStatus::Running).await {
        tracing::warn!(task_id = %id, "Could not mark task running: {}", e);
    }
    for line in applied_overrides {
        progress.info(line);
    }

    // Inner spawn so a panic in the pipeline surfaces as a JoinError.
    let status = match tokio::spawn(pipeline.run(request)).await {
        Ok(Ok(outcome)) => {
            record_outcome(&registry, id, outcome).await;
            TaskStatus::Completed
        }
        Ok(Err(err)) => {
            report_failure(&progress, &err);
            TaskStatus::Error
        }
        Err(join_err) => {
            tracing::error!(task_id = %id, "Pipeline task failed: {}", join_err);
            progress.send(
                ProgressEvent::error(format!("Verification crashed: {}", join_err))
                    .with_status("Error"),
            );
            TaskStatus::Error
        }
    };

    if let Err(e) = registry.update_status(id, status).await {
        // Evicted before finishing; the observer sees "no longer available".
        tracing::warn!(task_id = %id, "Could not record final status {}: {}", status, e);
    }
    progress.finish();
}

async fn record_outcome(registry: &TaskRegistry, id: TaskId, outcome: PipelineOutcome) {
    if let Err(e) = registry.attach_summary(id, outcome.summary).await {
        tracing::warn!(task_id = %id, "Could not attach summary: {}", e);
    }
    if let Some(result) = outcome.single {
        if let Err(e) = registry.attach_result(id, result).await {
            tracing::warn!(task_id = %id, "Could not attach result: {}", e);
        }
    }
}

fn report_failure(progress: &ProgressSender, err: &PipelineError) {
    let stage = match err {
        PipelineError::Auth(_) => "Authentication failed",
        PipelineError::Workspace(_) => "Workspace unavailable",
        PipelineError::Source(_) => "Source unreadable",
        _ => "Error",
    };
    progress.send(ProgressEvent::error(format!("Verification failed: {err}")).with_status(stage));
}
