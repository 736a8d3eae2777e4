//! Task progress streaming, status, output files and their previews.

use std::convert::Infallible;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, header::HeaderValue, HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use tokio_util::io::ReaderStream;

use super::routes::AppState;
use crate::task::{
    progress_records, RegistryError, SingleItemResult, StreamSettings, StreamStatus, TaskId,
    TaskSnapshot, WireRecord,
};
use crate::util::path_within;

fn not_found(e: RegistryError) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, e.to_string())
}

fn to_sse_event(record: &WireRecord) -> Event {
    let event = Event::default().event(record.event_name());
    match event.json_data(record) {
        Ok(event) => event,
        Err(_) => Event::default()
            .event(record.event_name())
            .data(record.to_json().to_string()),
    }
}

/// Stream a task's progress as server-sent events. Unknown or malformed
/// task ids get a single terminal error record.
pub(super) async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let records = task_records(&state, &raw_id);
    Sse::new(records.map(|record| Ok(to_sse_event(&record))))
}

fn task_records(
    state: &AppState,
    raw_id: &str,
) -> impl Stream<Item = WireRecord> + Send + 'static {
    match raw_id.parse::<TaskId>() {
        Ok(task_id) => progress_records(
            Arc::clone(state.orchestrator.registry()),
            task_id,
            StreamSettings::from(&state.config.tasks),
        )
        .left_stream(),
        Err(e) => {
            tracing::warn!(task = %raw_id, "Stream requested for a malformed task id: {}", e);
            let record = WireRecord::terminal(
                StreamStatus::Error,
                Some(format!("Invalid task id: {}", raw_id)),
                None,
            );
            futures::stream::iter([record]).right_stream()
        }
    }
}

pub(super) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<TaskSnapshot>, (StatusCode, String)> {
    state
        .orchestrator
        .registry()
        .get(task_id)
        .await
        .map(Json)
        .map_err(not_found)
}

/// Result of a single-question task, once attached.
pub(super) async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<SingleItemResult>, (StatusCode, String)> {
    match state.orchestrator.registry().result(task_id).await {
        Ok(Some(result)) => Ok(Json(result)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            format!("No result available for task {}", task_id),
        )),
        Err(e) => Err(not_found(e)),
    }
}

/// Names of the files a task wrote, sorted.
pub(super) async fn list_results(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<Vec<String>>, (StatusCode, Json<serde_json::Value>)> {
    let dir = state.orchestrator.output_dir(task_id);
    let missing = || {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Results not found" })),
        )
    };

    let mut entries = tokio::fs::read_dir(&dir).await.map_err(|_| missing())?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|_| missing())? {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(Json(files))
}

fn content_type_for_path(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("csv") => "text/csv; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("json") => "application/json",
        Some("md") => "text/markdown; charset=utf-8",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Download one output file of a task.
pub(super) async fn serve_output(
    State(state): State<Arc<AppState>>,
    Path((task_id, file)): Path<(TaskId, String)>,
) -> Result<Response, (StatusCode, String)> {
    let base = state.orchestrator.output_dir(task_id);
    let target = base.join(file.trim_start_matches('/'));
    if !path_within(&base, &target) || !target.is_file() {
        return Err((StatusCode::NOT_FOUND, format!("File not found: {}", file)));
    }

    let filename = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_path(&target)),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", filename)
            .parse()
            .map_err(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Filename produces an invalid header value: {}", filename),
                )
            })?,
    );

    let file = tokio::fs::File::open(&target)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, format!("File not found: {}", e)))?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((headers, body).into_response())
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Render CSV as an HTML table; the first record is the header.
fn csv_table(bytes: &[u8]) -> Result<String, csv::Error> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut html = String::from(r#"<table class="table table-striped table-hover">"#);
    let mut rows = 0;
    for record in reader.records() {
        let record = record?;
        let (open, cell) = match rows {
            0 => ("<thead>", "th"),
            1 => ("<tbody>", "td"),
            _ => ("", "td"),
        };
        html.push_str(open);
        html.push_str("<tr>");
        for value in record.iter() {
            html.push_str(&format!("<{cell}>{}</{cell}>", escape_html(value)));
        }
        html.push_str("</tr>");
        if rows == 0 {
            html.push_str("</thead>");
        }
        rows += 1;
    }
    if rows > 1 {
        html.push_str("</tbody>");
    }
    html.push_str("</table>");
    Ok(html)
}

/// HTML fragment previewing one output file: images by reference, text and
/// CSV inline.
pub(super) async fn preview_output(
    State(state): State<Arc<AppState>>,
    Path((task_id, file)): Path<(TaskId, String)>,
) -> Result<Html<String>, (StatusCode, Html<String>)> {
    let file = file.trim_start_matches('/');
    let base = state.orchestrator.output_dir(task_id);
    let target = base.join(file);
    if !path_within(&base, &target) || !target.is_file() {
        return Err((
            StatusCode::NOT_FOUND,
            Html(format!("<p>File not found: {}</p>", escape_html(file))),
        ));
    }

    let read_failed = |e: String| {
        tracing::error!(task = %task_id, file = %file, "Failed to preview output: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(r#"<p style="color: red;">Failed to read the file.</p>"#.to_string()),
        )
    };

    let ext = target
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png" | "jpg" | "jpeg" | "gif") => {
            let src = file
                .split('/')
                .map(urlencoding::encode)
                .collect::<Vec<_>>()
                .join("/");
            Ok(Html(format!(
                r#"<img src="/outputs/{task_id}/{src}" style="max-width: 100%; height: auto;">"#
            )))
        }
        Some("txt") => {
            let text = tokio::fs::read_to_string(&target)
                .await
                .map_err(|e| read_failed(e.to_string()))?;
            Ok(Html(format!("<pre>{}</pre>", escape_html(&text))))
        }
        Some("csv") => {
            let bytes = tokio::fs::read(&target)
                .await
                .map_err(|e| read_failed(e.to_string()))?;
            csv_table(&bytes)
                .map(Html)
                .map_err(|e| read_failed(e.to_string()))
        }
        _ => Ok(Html(
            "<p>Preview is not supported for this file type.</p>".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Orchestrator;
    use crate::scoring::SummaryReport;
    use crate::task::{progress_channel, NewTask, TaskKind, TaskRegistry};
    use crate::testing::{test_config, FixedFactory, ScriptedChat};

    fn state(root: &std::path::Path) -> Arc<AppState> {
        let config = test_config(root);
        let registry = Arc::new(TaskRegistry::new(config.tasks.ttl()));
        let factory = Arc::new(FixedFactory::new(Arc::new(ScriptedChat::new())));
        Arc::new(AppState::new(Orchestrator::new(
            config,
            registry,
            factory,
            Arc::new(SummaryReport),
        )))
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let (status, _) = get_task(State(state.clone()), Path(TaskId::new()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_result(State(state.clone()), Path(TaskId::new()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, Json(body)) = list_results(State(state), Path(TaskId::new()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Results not found");
    }

    #[tokio::test]
    async fn result_missing_until_attached() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let id = TaskId::new();
        let (_tx, receiver) = progress_channel(id);
        state
            .orchestrator
            .registry()
            .create(NewTask {
                id,
                kind: TaskKind::Single,
                receiver,
            })
            .await
            .unwrap();

        let Json(snapshot) = get_task(State(state.clone()), Path(id)).await.unwrap();
        assert!(!snapshot.has_result);

        let (status, _) = get_result(State(state), Path(id)).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lists_output_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let id = TaskId::new();
        let out = state.orchestrator.output_dir(id);
        std::fs::create_dir_all(out.join("nested")).unwrap();
        std::fs::write(out.join("b.csv"), "x").unwrap();
        std::fs::write(out.join("a.txt"), "y").unwrap();

        let Json(files) = list_results(State(state), Path(id)).await.unwrap();
        assert_eq!(files, vec!["a.txt".to_string(), "b.csv".to_string()]);
    }

    #[tokio::test]
    async fn serves_files_but_not_outside_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let id = TaskId::new();
        let out = state.orchestrator.output_dir(id);
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("report.csv"), "question\n").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "no").unwrap();

        let response = serve_output(State(state.clone()), Path((id, "report.csv".to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );

        let (status, _) = serve_output(
            State(state),
            Path((id, "../../secret.txt".to_string())),
        )
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_task_id_streams_one_error_record() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let records: Vec<WireRecord> = task_records(&state, "not-a-uuid").collect().await;
        assert_eq!(records.len(), 1);
        match &records[0] {
            WireRecord::Terminal { status, log, .. } => {
                assert_eq!(*status, StreamStatus::Error);
                assert_eq!(log.as_deref(), Some("Invalid task id: not-a-uuid"));
            }
            other => panic!("expected a terminal record, got {:?}", other),
        }
    }

    fn preview_fixture() -> (tempfile::TempDir, Arc<AppState>, TaskId) {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let id = TaskId::new();
        let out = state.orchestrator.output_dir(id);
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("summary.txt"), "mean <0.80> & done").unwrap();
        std::fs::write(
            out.join("qa.csv"),
            "question,reference_answer,response\nWhat is 2+2?,4,<b>4</b>\n",
        )
        .unwrap();
        std::fs::write(out.join("chart.png"), [0x89, b'P', b'N', b'G']).unwrap();
        std::fs::write(out.join("report.json"), "{}").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "no").unwrap();
        (dir, state, id)
    }

    async fn preview(state: &Arc<AppState>, id: TaskId, file: &str) -> Result<String, StatusCode> {
        preview_output(State(state.clone()), Path((id, file.to_string())))
            .await
            .map(|Html(body)| body)
            .map_err(|(status, _)| status)
    }

    #[tokio::test]
    async fn previews_text_escaped() {
        let (_dir, state, id) = preview_fixture();
        let body = preview(&state, id, "summary.txt").await.unwrap();
        assert_eq!(body, "<pre>mean &lt;0.80&gt; &amp; done</pre>");
    }

    #[tokio::test]
    async fn previews_csv_as_table() {
        let (_dir, state, id) = preview_fixture();
        let body = preview(&state, id, "qa.csv").await.unwrap();
        assert!(body.starts_with(r#"<table class="table table-striped table-hover"><thead>"#));
        assert!(body.contains("<th>question</th>"));
        assert!(body.contains("<td>What is 2+2?</td>"));
        assert!(body.contains("<td>&lt;b&gt;4&lt;/b&gt;</td>"));
        assert!(body.ends_with("</tbody></table>"));
    }

    #[tokio::test]
    async fn previews_images_by_reference() {
        let (_dir, state, id) = preview_fixture();
        let body = preview(&state, id, "chart.png").await.unwrap();
        assert_eq!(
            body,
            format!(r#"<img src="/outputs/{id}/chart.png" style="max-width: 100%; height: auto;">"#)
        );
    }

    #[tokio::test]
    async fn other_types_are_not_previewed() {
        let (_dir, state, id) = preview_fixture();
        let body = preview(&state, id, "report.json").await.unwrap();
        assert!(body.starts_with("<p>"));
        assert!(body.contains("not supported"));
    }

    #[tokio::test]
    async fn preview_stays_inside_the_task() {
        let (_dir, state, id) = preview_fixture();
        assert_eq!(
            preview(&state, id, "../../secret.txt").await,
            Err(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            preview(&state, id, "missing.txt").await,
            Err(StatusCode::NOT_FOUND)
        );
    }

    #[test]
    fn empty_csv_is_an_empty_table() {
        assert_eq!(
            csv_table(b"").unwrap(),
            r#"<table class="table table-striped table-hover"></table>"#
        );
    }

    #[test]
    fn sse_event_names_follow_records() {
        let done = WireRecord::terminal(StreamStatus::Completed, None, None);
        assert_eq!(done.event_name(), "done");
        assert_eq!(WireRecord::heartbeat().event_name(), "heartbeat");
        assert_eq!(WireRecord::raw("hi").event_name(), "log");
        let _ = to_sse_event(&done);
    }
}
