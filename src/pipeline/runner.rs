//! The verification state machine.
//!
//! ```text
//! Init -> AuthCheck -> WorkspaceResolve -> [DocumentIngestion] -> ItemProcessing
//!      -> [ReportGeneration] -> Persist -> Done
//! ```
//!
//! Each stage returns `Result<_, PipelineError>`. Fatal errors end the run
//! through `?`; recoverable ones are reported on the progress channel and
//! the machine moves on. The orchestrator owns the terminal status and the
//! sentinel, so `run` never finishes the channel itself.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::anythingllm::{ChatService, WorkspaceHandle, WorkspaceSettings};
use crate::config::Config;
use crate::scoring::{ReportGenerator, SimilarityScore, SimilarityScorer};
use crate::sheet::{QaItem, ResultSink, Workbook};
use crate::task::{ProgressEvent, ProgressSender, SingleItemResult, VerificationSummary};
use crate::util::strip_reasoning;

use super::{PipelineError, Stage, VerificationRequest};

/// Characters of a model answer echoed into the progress log.
const PREVIEW_CHARS: usize = 200;

/// What a successful run produced.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub summary: VerificationSummary,
    /// Present for single-item requests that got an answer
    pub single: Option<SingleItemResult>,
    /// Files written to the output directory
    pub artifacts: Vec<PathBuf>,
}

enum ItemOutcome {
    Skipped,
    Answered {
        response: String,
        scores: Option<SimilarityScore>,
    },
}

pub struct VerificationPipeline {
    config: Config,
    chat: Arc<dyn ChatService>,
    scorer: Arc<dyn SimilarityScorer>,
    reports: Arc<dyn ReportGenerator>,
    progress: ProgressSender,
    output_dir: PathBuf,
}

impl VerificationPipeline {
    /// `config` is the task's effective configuration, overrides applied.
    pub fn new(
        config: Config,
        chat: Arc<dyn ChatService>,
        scorer: Arc<dyn SimilarityScorer>,
        reports: Arc<dyn ReportGenerator>,
        progress: ProgressSender,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            chat,
            scorer,
            reports,
            progress,
            output_dir,
        }
    }

    pub async fn run(self, request: VerificationRequest) -> Result<PipelineOutcome, PipelineError> {
        self.enter(
            Stage::Init,
            format!(
                "Starting {:?} verification against workspace '{}'",
                request.kind(),
                request.workspace()
            ),
        );
        let mut sink = self.open_source(&request).await?;
        let items = sink.items();
        let mut summary = VerificationSummary {
            submitted: items.len(),
            ..Default::default()
        };
        self.progress.info(format!(
            "Loaded {} question(s) from {} group(s)",
            items.len(),
            sink.group_count()
        ));

        self.enter(Stage::AuthCheck, "Checking API credentials");
        self.chat.check_auth().await.map_err(PipelineError::Auth)?;
        self.progress.info("Credentials accepted");

        let workspace = self.resolve_workspace(request.workspace()).await?;

        if let VerificationRequest::Batch {
            documents: Some(dir),
            ..
        } = &request
        {
            self.enter(Stage::DocumentIngestion, format!("Ingesting documents from {}", dir.display()));
            match self.ingest_documents(&workspace, dir, &mut summary).await {
                Ok(()) => {}
                Err(err) => self.report(&err, "continuing without reference documents"),
            }
        }

        let single_mode = matches!(request, VerificationRequest::Single { .. });
        let (scores, single) = self
            .process_items(&workspace, sink.as_mut(), &items, &mut summary, single_mode)
            .await;

        let mut artifacts = Vec::new();
        if scores.is_empty() {
            self.progress.info("No scores to summarize, skipping report");
        } else {
            self.enter(Stage::ReportGeneration, format!("Summarizing {} score(s)", scores.len()));
            let threshold = self.config.analyzer.similarity_threshold;
            match self.reports.generate(&scores, &self.output_dir, threshold).await {
                Ok(files) => {
                    self.progress.info(format!("Report written ({} file(s))", files.len()));
                    artifacts.extend(files);
                }
                Err(err) => self.report(&PipelineError::Report(err), "report skipped"),
            }
        }

        self.enter(Stage::Persist, "Saving results");
        match sink.persist(&self.output_dir).await {
            Ok(files) => {
                for file in &files {
                    self.progress.info(format!("Results saved to {}", file.display()));
                }
                artifacts.extend(files);
            }
            Err(err) => self.report(&PipelineError::Persist(err.to_string()), "results not saved"),
        }

        let detail = serde_json::to_value(&summary).unwrap_or_default();
        self.progress.send(
            ProgressEvent::info(format!(
                "Verification finished: {} of {} question(s) scored, {} skipped",
                summary.scored, summary.submitted, summary.skipped
            ))
            .with_progress(Stage::Done.band().0)
            .with_status(Stage::Done.label())
            .with_detail("summary", detail),
        );

        Ok(PipelineOutcome {
            summary,
            single,
            artifacts,
        })
    }

    /// Announce a stage at the start of its band.
    fn enter(&self, stage: Stage, message: impl Into<String>) {
        self.progress.send(
            ProgressEvent::info(message)
                .with_progress(stage.band().0)
                .with_status(stage.label()),
        );
    }

    /// Log a recoverable failure and keep going.
    fn report(&self, err: &PipelineError, consequence: &str) {
        let message = format!("{err}; {consequence}");
        match err {
            PipelineError::Report(_) | PipelineError::Persist(_) => self.progress.error(message),
            _ => self.progress.warning(message),
        };
    }

    async fn open_source(&self, request: &VerificationRequest) -> Result<Box<dyn ResultSink>, PipelineError> {
        match request {
            VerificationRequest::Batch { source, .. } => Ok(Box::new(Workbook::load(source).await?)),
            VerificationRequest::Single {
                question,
                reference_answer,
                ..
            } => Ok(Box::new(Workbook::single(question, reference_answer))),
        }
    }

    async fn resolve_workspace(&self, name: &str) -> Result<WorkspaceHandle, PipelineError> {
        self.enter(Stage::WorkspaceResolve, format!("Looking up workspace '{}'", name));
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::Workspace("workspace name is empty".to_string()));
        }

        let existing = self
            .chat
            .find_workspace(name)
            .await
            .map_err(|e| PipelineError::Workspace(format!("failed to list workspaces: {e}")))?;
        if let Some(workspace) = existing {
            self.progress.info(format!(
                "Found workspace '{}' ({})",
                workspace.name, workspace.slug
            ));
            return Ok(workspace);
        }

        self.progress.info(format!("Workspace '{}' not found, creating it", name));
        let settings = WorkspaceSettings::from_config(&self.config);
        let workspace = self
            .chat
            .create_workspace(name, &settings)
            .await
            .map_err(|e| PipelineError::Workspace(format!("failed to create '{name}': {e}")))?;
        self.progress.info(format!(
            "Created workspace '{}' ({}) with model {}",
            workspace.name, workspace.slug, settings.model
        ));
        Ok(workspace)
    }

    /// Every file in `dir` matching a supported pattern, with its content type.
    fn supported_documents(&self, dir: &Path) -> Vec<(PathBuf, String)> {
        let base = glob::Pattern::escape(&dir.to_string_lossy());
        let mut seen = BTreeSet::new();
        let mut files = Vec::new();
        for (pattern, mime) in &self.config.supported_documents {
            let Ok(paths) = glob::glob(&format!("{base}/{pattern}")) else {
                tracing::warn!(pattern = %pattern, "Ignoring invalid document pattern");
                continue;
            };
            for path in paths.filter_map(Result::ok).filter(|p| p.is_file()) {
                if seen.insert(path.clone()) {
                    files.push((path, mime.clone()));
                }
            }
        }
        files.sort();
        files
    }

    async fn ingest_documents(
        &self,
        workspace: &WorkspaceHandle,
        dir: &Path,
        summary: &mut VerificationSummary,
    ) -> Result<(), PipelineError> {
        if !dir.is_dir() {
            return Err(PipelineError::Ingestion(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let files = self.supported_documents(dir);
        if files.is_empty() {
            return Err(PipelineError::Ingestion(format!(
                "no supported documents in {}",
                dir.display()
            )));
        }

        let total = files.len();
        for (index, (path, mime)) in files.iter().enumerate() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.chat.upload_document(&workspace.slug, path, mime).await {
                Ok(()) => {
                    summary.documents_uploaded += 1;
                    self.progress.send(
                        ProgressEvent::info(format!("Uploaded {name}"))
                            .with_progress(Stage::DocumentIngestion.progress_at(index + 1, total)),
                    );
                }
                Err(e) => {
                    summary.documents_failed += 1;
                    self.report(&PipelineError::Ingestion(format!("{name}: {e}")), "file skipped");
                }
            }
        }

        self.progress.info(format!(
            "Uploaded {}/{} document(s)",
            summary.documents_uploaded, total
        ));
        if summary.documents_uploaded == 0 {
            return Err(PipelineError::Ingestion("every upload failed".to_string()));
        }
        Ok(())
    }

    async fn process_items(
        &self,
        workspace: &WorkspaceHandle,
        sink: &mut dyn ResultSink,
        items: &[QaItem],
        summary: &mut VerificationSummary,
        single_mode: bool,
    ) -> (Vec<SimilarityScore>, Option<SingleItemResult>) {
        sink.declare_metrics(&self.scorer.metric_names());
        self.enter(Stage::ItemProcessing, format!("Processing {} question(s)", items.len()));

        let total = items.len();
        let mut group_totals: HashMap<&str, usize> = HashMap::new();
        for item in items {
            *group_totals.entry(item.group.as_str()).or_default() += 1;
        }

        let mut scores = Vec::new();
        let mut single = None;
        for (index, item) in items.iter().enumerate() {
            self.progress.send(
                ProgressEvent::info(format!(
                    "Question {}/{} [{} #{}]: {}",
                    index + 1,
                    total,
                    item.group,
                    item.ordinal,
                    item.question
                ))
                .with_detail("group", item.group.clone())
                .with_detail("ordinal", item.ordinal),
            );

            match self.process_item(workspace, item).await {
                ItemOutcome::Skipped => summary.skipped += 1,
                ItemOutcome::Answered { response, scores: item_scores } => {
                    if let Err(e) = sink.record(item, &response, item_scores.as_ref()) {
                        tracing::warn!(group = %item.group, position = item.position, "Write-back failed: {}", e);
                    }
                    match &item_scores {
                        Some(score) => {
                            summary.scored += 1;
                            scores.push(score.clone());
                        }
                        None => summary.skipped += 1,
                    }
                    if single_mode {
                        single = Some(SingleItemResult {
                            question: item.question.clone(),
                            reference_answer: item.reference_answer.clone(),
                            response,
                            scores: item_scores.unwrap_or_default(),
                        });
                    }
                }
            }

            let done = index + 1;
            let group_total = group_totals.get(item.group.as_str()).copied().unwrap_or(1);
            let group_percent = item.ordinal * 100 / group_total.max(1);
            let overall = Stage::ItemProcessing.progress_at(done, total);
            self.progress.send(
                ProgressEvent::info(format!("Completed {done}/{total}"))
                    .with_progress(overall)
                    .with_status(Stage::ItemProcessing.label())
                    .with_detail("group", item.group.clone())
                    .with_detail("group_progress", group_percent)
                    .with_detail("completed", done)
                    .with_detail("total", total),
            );
        }
        (scores, single)
    }

    async fn process_item(&self, workspace: &WorkspaceHandle, item: &QaItem) -> ItemOutcome {
        let response = match self.dispatch(workspace, item).await {
            Ok(response) => response,
            Err(err) => {
                self.skip_item(item, &err);
                return ItemOutcome::Skipped;
            }
        };
        self.progress.info(format!("Answer: {}", preview(&response)));

        let scores = match self.scorer.score(&response, &item.reference_answer).await {
            Ok(score) => {
                let rendered: Vec<String> = score.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
                self.progress.info(format!("Scores: {}", rendered.join(", ")));
                Some(score)
            }
            Err(err) => {
                self.skip_item(item, &PipelineError::Scoring(err));
                None
            }
        };
        ItemOutcome::Answered { response, scores }
    }

    async fn dispatch(&self, workspace: &WorkspaceHandle, item: &QaItem) -> Result<String, PipelineError> {
        let raw = self
            .chat
            .chat(&workspace.slug, &item.question)
            .await
            .map_err(|e| PipelineError::Dispatch(e.to_string()))?
            .ok_or_else(|| PipelineError::Dispatch("no text response".to_string()))?;
        let cleaned = strip_reasoning(&raw);
        if cleaned.is_empty() {
            return Err(PipelineError::Dispatch("empty response".to_string()));
        }
        Ok(cleaned)
    }

    /// Exactly one warning per skipped item.
    fn skip_item(&self, item: &QaItem, err: &PipelineError) {
        self.progress.send(
            ProgressEvent::warning(format!(
                "Skipping question {} of '{}' (row {}): {}",
                item.ordinal,
                item.group,
                item.position + 1,
                err
            ))
            .with_detail("group", item.group.clone())
            .with_detail("ordinal", item.ordinal)
            .with_detail("position", item.position),
        );
    }
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anythingllm::ServiceError;
    use crate::pipeline::AdvancedOverrides;
    use crate::scoring::{LexicalScorer, SummaryReport};
    use crate::task::{progress_channel, EventLevel, TaskId};
    use crate::testing::{drain_events, test_config, write_file, FailingScorer, ScriptedChat};

    fn pipeline(
        chat: Arc<ScriptedChat>,
        scorer: Arc<dyn SimilarityScorer>,
        out: &Path,
    ) -> (VerificationPipeline, crate::task::ProgressReceiver) {
        let (tx, rx) = progress_channel(TaskId::new());
        let pipeline = VerificationPipeline::new(
            test_config(out),
            chat,
            scorer,
            Arc::new(SummaryReport),
            tx,
            out.join("task"),
        );
        (pipeline, rx)
    }

    fn batch(source: PathBuf, documents: Option<PathBuf>) -> VerificationRequest {
        VerificationRequest::Batch {
            workspace: "QA".into(),
            source,
            documents,
            overrides: AdvancedOverrides::default(),
        }
    }

    #[tokio::test]
    async fn failed_dispatch_skips_only_that_item() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "qa.csv", "q1,alpha\nq2,beta\nq3,gamma\n");
        let chat = Arc::new(
            ScriptedChat::new()
                .reply("q1", "alpha")
                .fail("q2", ServiceError::http(500, "boom".into()))
                .reply("q3", "gamma"),
        );
        let (pipeline, mut rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let outcome = pipeline.run(batch(source, None)).await.unwrap();
        assert_eq!(outcome.summary.submitted, 3);
        assert_eq!(outcome.summary.scored, 2);
        assert_eq!(outcome.summary.skipped, 1);
        assert_eq!(chat.chat_calls(), 3);

        let events = drain_events(&mut rx);
        let warnings: Vec<&ProgressEvent> =
            events.iter().filter(|e| e.level == EventLevel::Warning).collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].detail.as_ref().unwrap()["ordinal"], 2);
        assert!(warnings[0].message.contains("boom"));

        let written = std::fs::read_to_string(dir.path().join("task/qa.csv")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "question,reference_answer,response,token_f1");
        assert_eq!(lines[1], "q1,alpha,alpha,1.0000");
        assert_eq!(lines[2], "q2,beta,,");
        assert_eq!(lines[3], "q3,gamma,gamma,1.0000");
        assert!(dir.path().join("task/similarity_summary.json").exists());
    }

    #[tokio::test]
    async fn rejected_credentials_stop_before_any_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "qa.csv", "q1,a1\n");
        let chat = Arc::new(ScriptedChat::new().rejecting_credentials());
        let (pipeline, _rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let err = pipeline.run(batch(source, None)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
        assert!(err.is_fatal());
        assert_eq!(chat.chat_calls(), 0);
        assert!(chat.created().is_empty());
    }

    #[tokio::test]
    async fn single_mode_scores_cleaned_response() {
        let dir = tempfile::tempdir().unwrap();
        let chat = Arc::new(ScriptedChat::new().reply(
            "What colour is the sky?",
            "<think>the user wants a colour</think>The sky is blue",
        ));
        let (pipeline, _rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let outcome = pipeline
            .run(VerificationRequest::Single {
                workspace: "QA".into(),
                question: "What colour is the sky?".into(),
                reference_answer: "The sky is blue".into(),
                overrides: AdvancedOverrides::default(),
            })
            .await
            .unwrap();

        let single = outcome.single.unwrap();
        assert_eq!(single.response, "The sky is blue");
        assert_eq!(single.scores.get("token_f1"), Some(1.0));

        let written = std::fs::read_to_string(dir.path().join("task/single.csv")).unwrap();
        assert!(!written.contains("think"));
    }

    #[tokio::test]
    async fn zero_items_complete_without_report() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "empty.csv", "question,answer\n");
        let chat = Arc::new(ScriptedChat::new());
        let (pipeline, mut rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let outcome = pipeline.run(batch(source, None)).await.unwrap();
        assert_eq!(outcome.summary, VerificationSummary::default());
        assert!(!dir.path().join("task/similarity_summary.txt").exists());
        let written = std::fs::read_to_string(dir.path().join("task/empty.csv")).unwrap();
        assert_eq!(written, "question,reference_answer,response,token_f1\n");

        let events = drain_events(&mut rx);
        assert!(events.iter().all(|e| e.level == EventLevel::Info));
        assert_eq!(events.last().unwrap().progress, Some(100));
    }

    #[tokio::test]
    async fn missing_workspace_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "qa.csv", "q1,a1\n");
        let chat = Arc::new(ScriptedChat::new());
        let (pipeline, _rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let mut request = batch(source, None);
        if let VerificationRequest::Batch { workspace, .. } = &mut request {
            *workspace = "Brand New".into();
        }
        pipeline.run(request).await.unwrap();
        assert_eq!(chat.created(), vec!["Brand New".to_string()]);
    }

    #[tokio::test]
    async fn workspace_creation_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "qa.csv", "q1,a1\n");
        let chat = Arc::new(ScriptedChat::new().refusing_workspace_creation());
        let (pipeline, _rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let mut request = batch(source, None);
        if let VerificationRequest::Batch { workspace, .. } = &mut request {
            *workspace = "Missing".into();
        }
        let err = pipeline.run(request).await.unwrap_err();
        assert!(matches!(err, PipelineError::Workspace(_)));
        assert_eq!(chat.chat_calls(), 0);
    }

    #[tokio::test]
    async fn unreadable_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let chat = Arc::new(ScriptedChat::new());
        let (pipeline, _rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let err = pipeline
            .run(batch(dir.path().join("absent.csv"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)));
    }

    #[tokio::test]
    async fn ingestion_failures_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "qa.csv", "q1,a1\n");
        let docs = dir.path().join("docs");
        std::fs::create_dir(&docs).unwrap();
        write_file(&docs, "manual.pdf", "%PDF");
        write_file(&docs, "notes.txt", "notes");
        write_file(&docs, "image.png", "png");
        let chat = Arc::new(ScriptedChat::new().failing_upload("notes.txt"));
        let (pipeline, _rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        let outcome = pipeline.run(batch(source, Some(docs))).await.unwrap();
        assert_eq!(outcome.summary.documents_uploaded, 1);
        assert_eq!(outcome.summary.documents_failed, 1);
        assert_eq!(chat.uploads(), vec!["manual.pdf".to_string()]);
        assert_eq!(outcome.summary.scored, 1);
    }

    #[tokio::test]
    async fn scoring_failure_keeps_response_without_scores() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "qa.csv", "q1,a1\n");
        let chat = Arc::new(ScriptedChat::new().reply("q1", "a1"));
        let (pipeline, mut rx) = pipeline(Arc::clone(&chat), Arc::new(FailingScorer), dir.path());

        let outcome = pipeline.run(batch(source, None)).await.unwrap();
        assert_eq!(outcome.summary.scored, 0);
        assert_eq!(outcome.summary.skipped, 1);

        let written = std::fs::read_to_string(dir.path().join("task/qa.csv")).unwrap();
        assert_eq!(written.lines().nth(1), Some("q1,a1,a1,"));
        let warnings = drain_events(&mut rx)
            .into_iter()
            .filter(|e| e.level == EventLevel::Warning)
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_one_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "qa.csv", "q1,a1\nq2,a2\nq3,a3\nq4,a4\n");
        let chat = Arc::new(ScriptedChat::new());
        let (pipeline, mut rx) = pipeline(Arc::clone(&chat), Arc::new(LexicalScorer), dir.path());

        pipeline.run(batch(source, None)).await.unwrap();
        let progress: Vec<u8> = drain_events(&mut rx).iter().filter_map(|e| e.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(progress.contains(&57));
        assert_eq!(progress.last(), Some(&100));

        // The pipeline never emits the sentinel itself.
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn preview_truncates_long_answers() {
        let long = "x".repeat(PREVIEW_CHARS + 10);
        assert_eq!(preview(&long).len(), PREVIEW_CHARS + 3);
        assert_eq!(preview("short"), "short");
    }
}
