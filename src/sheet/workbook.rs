//! In-memory workbook: one group per CSV file or spreadsheet sheet. Results
//! are always written back as CSV, one file per group.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use calamine::{open_workbook_auto, Data, Range, Reader};

use super::{QaItem, ResultSink, SinkError};
use crate::scoring::SimilarityScore;
use crate::util::sanitize_file_name;

pub const RESPONSE_COLUMN: &str = "response";
const QUESTION_COLUMN: &str = "question";
const REFERENCE_COLUMN: &str = "reference_answer";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Extensions loaded as multi-sheet spreadsheets.
pub const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];

/// Whether `path` names a spreadsheet rather than a CSV file.
pub fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| SPREADSHEET_EXTENSIONS.contains(&e.as_str()))
}

#[derive(Debug, Clone)]
struct Row {
    question: String,
    reference_answer: String,
    response: Option<String>,
    scores: Option<SimilarityScore>,
}

impl Row {
    fn is_item(&self) -> bool {
        !self.question.is_empty() && !self.reference_answer.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    /// Indexed by position; blank rows are kept so positions stay stable.
    rows: Vec<Row>,
}

/// In-memory copy of a task's source plus everything recorded against it.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    groups: Vec<Group>,
    metrics: Vec<String>,
}

impl Workbook {
    /// Load a source:
    /// - a spreadsheet (one group per sheet, in workbook order)
    /// - a CSV file (one group named after its stem)
    /// - a directory of CSV files (one group per file, in file-name order)
    pub async fn load(path: &Path) -> Result<Self, SinkError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| SinkError::Read(path.to_path_buf(), e.to_string()))?;

        let groups = if meta.is_file() && is_spreadsheet(path) {
            let owned = path.to_path_buf();
            tokio::task::spawn_blocking(move || parse_spreadsheet(&owned))
                .await
                .map_err(|e| SinkError::Read(path.to_path_buf(), e.to_string()))??
        } else {
            let files = if meta.is_dir() {
                let files = csv_files_in(path)?;
                if files.is_empty() {
                    return Err(SinkError::NoSources(path.to_path_buf()));
                }
                files
            } else {
                vec![path.to_path_buf()]
            };

            let mut groups = Vec::with_capacity(files.len());
            for file in files {
                let bytes = tokio::fs::read(&file)
                    .await
                    .map_err(|e| SinkError::Read(file.clone(), e.to_string()))?;
                let name = file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "sheet1".to_string());
                groups.push(parse_group(name, &bytes, &file)?);
            }
            groups
        };

        let workbook = Self {
            groups,
            metrics: Vec::new(),
        };
        tracing::debug!(
            source = %path.display(),
            groups = workbook.groups.len(),
            items = workbook.items().len(),
            "Loaded question source"
        );
        Ok(workbook)
    }

    /// Parse CSV bytes as a single group.
    pub fn from_csv(name: &str, bytes: &[u8]) -> Result<Self, SinkError> {
        let group = parse_group(name.to_string(), bytes, Path::new(name))?;
        Ok(Self {
            groups: vec![group],
            metrics: Vec::new(),
        })
    }

    /// A one-item workbook for single verification.
    pub fn single(question: &str, reference_answer: &str) -> Self {
        Self {
            groups: vec![Group {
                name: "single".to_string(),
                rows: vec![Row {
                    question: question.trim().to_string(),
                    reference_answer: reference_answer.trim().to_string(),
                    response: None,
                    scores: None,
                }],
            }],
            metrics: Vec::new(),
        }
    }

    /// Response recorded for `(group, position)`, if any.
    pub fn response_at(&self, group: &str, position: usize) -> Option<&str> {
        self.row(group, position)?.response.as_deref()
    }

    pub fn scores_at(&self, group: &str, position: usize) -> Option<&SimilarityScore> {
        self.row(group, position)?.scores.as_ref()
    }

    fn row(&self, group: &str, position: usize) -> Option<&Row> {
        self.groups
            .iter()
            .find(|g| g.name == group)?
            .rows
            .get(position)
    }

    /// Render one group as CSV: fixed columns, then one per metric.
    fn render_group(&self, group: &Group) -> Result<Vec<u8>, SinkError> {
        let render_err = |e: String| SinkError::Render(group.name.clone(), e);
        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header = vec![QUESTION_COLUMN, REFERENCE_COLUMN, RESPONSE_COLUMN];
        header.extend(self.metrics.iter().map(String::as_str));
        writer.write_record(&header).map_err(|e| render_err(e.to_string()))?;

        for row in &group.rows {
            let mut record = vec![
                row.question.clone(),
                row.reference_answer.clone(),
                row.response.clone().unwrap_or_default(),
            ];
            for metric in &self.metrics {
                let cell = row
                    .scores
                    .as_ref()
                    .and_then(|s| s.get(metric))
                    .map(|v| format!("{v:.4}"))
                    .unwrap_or_default();
                record.push(cell);
            }
            writer.write_record(&record).map_err(|e| render_err(e.to_string()))?;
        }

        writer.into_inner().map_err(|e| render_err(e.to_string()))
    }
}

fn csv_files_in(dir: &Path) -> Result<Vec<PathBuf>, SinkError> {
    let pattern = format!(
        "{}/*.csv",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let entries = glob::glob(&pattern).map_err(|e| SinkError::Read(dir.to_path_buf(), e.to_string()))?;
    let mut files: Vec<PathBuf> = entries.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}

fn parse_group(name: String, bytes: &[u8], origin: &Path) -> Result<Group, SinkError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| SinkError::Parse(origin.to_path_buf(), e.to_string()))?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok(Group {
        name,
        rows: rows_from_records(records),
    })
}

fn parse_spreadsheet(path: &Path) -> Result<Vec<Group>, SinkError> {
    let mut book =
        open_workbook_auto(path).map_err(|e| SinkError::Read(path.to_path_buf(), e.to_string()))?;

    let mut groups = Vec::new();
    for name in book.sheet_names().to_vec() {
        let range = book
            .worksheet_range(&name)
            .map_err(|e| SinkError::Parse(path.to_path_buf(), format!("sheet {name}: {e}")))?;
        let rows = rows_from_records(records_from_range(&range));
        groups.push(Group { name, rows });
    }
    if groups.is_empty() {
        return Err(SinkError::NoSources(path.to_path_buf()));
    }
    Ok(groups)
}

/// Cell text laid out from A1, so positions match sheet rows even when the
/// used range starts further down or right.
fn records_from_range(range: &Range<Data>) -> Vec<Vec<String>> {
    let (first_row, first_col) = range
        .start()
        .map(|(row, col)| (row as usize, col as usize))
        .unwrap_or((0, 0));

    let mut records = vec![Vec::new(); first_row];
    for row in range.rows() {
        let mut cells = vec![String::new(); first_col];
        cells.extend(row.iter().map(|cell| cell.to_string()));
        records.push(cells);
    }
    records
}

/// First two columns of each record. A leading `question` header, on the
/// first row with any question text, is dropped.
fn rows_from_records(records: Vec<Vec<String>>) -> Vec<Row> {
    let mut rows = Vec::with_capacity(records.len());
    let mut seen_content = false;
    for record in records {
        let cell = |index: usize| record.get(index).map(|c| c.trim()).unwrap_or("");
        let question = cell(0);
        if !seen_content && !question.is_empty() {
            seen_content = true;
            if question.eq_ignore_ascii_case(QUESTION_COLUMN) {
                continue;
            }
        }
        rows.push(Row {
            question: question.to_string(),
            reference_answer: cell(1).to_string(),
            response: None,
            scores: None,
        });
    }
    rows
}

#[async_trait]
impl ResultSink for Workbook {
    fn items(&self) -> Vec<QaItem> {
        let mut items = Vec::new();
        for group in &self.groups {
            let mut ordinal = 0;
            for (position, row) in group.rows.iter().enumerate() {
                if !row.is_item() {
                    continue;
                }
                ordinal += 1;
                items.push(QaItem {
                    group: group.name.clone(),
                    ordinal,
                    position,
                    question: row.question.clone(),
                    reference_answer: row.reference_answer.clone(),
                });
            }
        }
        items
    }

    fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn declare_metrics(&mut self, names: &[String]) {
        self.metrics = names.to_vec();
    }

    fn record(
        &mut self,
        item: &QaItem,
        response: &str,
        scores: Option<&SimilarityScore>,
    ) -> Result<(), SinkError> {
        let unknown = || SinkError::UnknownItem {
            group: item.group.clone(),
            position: item.position,
        };
        let row = self
            .groups
            .iter_mut()
            .find(|g| g.name == item.group)
            .and_then(|g| g.rows.get_mut(item.position))
            .filter(|row| row.is_item())
            .ok_or_else(unknown)?;
        row.response = Some(response.to_string());
        row.scores = scores.cloned();
        Ok(())
    }

    async fn persist(&self, dir: &Path) -> Result<Vec<PathBuf>, SinkError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| SinkError::Write(dir.to_path_buf(), e.to_string()))?;

        let mut written = Vec::with_capacity(self.groups.len());
        let mut taken = HashSet::new();
        for group in &self.groups {
            let bytes = self.render_group(group)?;
            let stem = sanitize_file_name(&group.name);
            let mut file_name = format!("{stem}.csv");
            let mut suffix = 2;
            // Case-insensitive filesystems would merge `A.csv` and `a.csv`.
            while !taken.insert(file_name.to_lowercase()) {
                file_name = format!("{stem}_{suffix}.csv");
                suffix += 1;
            }
            let path = dir.join(file_name);
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| SinkError::Write(path.clone(), e.to_string()))?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "question,answer\nWhat is 2+2?,4\n,\nCapital of France?,Paris\nOnly a question,\n";

    #[test]
    fn header_and_blank_rows_are_skipped_but_keep_positions() {
        let book = Workbook::from_csv("math", SOURCE.as_bytes()).unwrap();
        let items = book.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].position, 0);
        assert_eq!(items[0].ordinal, 1);
        assert_eq!(items[1].question, "Capital of France?");
        assert_eq!(items[1].position, 2);
        assert_eq!(items[1].ordinal, 2);
    }

    #[test]
    fn rows_without_header_are_all_data() {
        let book = Workbook::from_csv("g", "q1,a1\nq2,a2\n".as_bytes()).unwrap();
        assert_eq!(book.items().len(), 2);
    }

    #[test]
    fn record_rejects_blank_rows() {
        let mut book = Workbook::from_csv("math", SOURCE.as_bytes()).unwrap();
        let mut bogus = book.items()[0].clone();
        bogus.position = 1;
        assert!(matches!(
            book.record(&bogus, "x", None),
            Err(SinkError::UnknownItem { position: 1, .. })
        ));
    }

    #[tokio::test]
    async fn persisted_rows_land_at_their_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = Workbook::from_csv("math", SOURCE.as_bytes()).unwrap();
        book.declare_metrics(&["token_f1".to_string()]);
        let items = book.items();
        let score = SimilarityScore::from_pairs([("token_f1", 1.0)]);
        book.record(&items[1], "Paris", Some(&score)).unwrap();

        let files = book.persist(dir.path()).await.unwrap();
        assert_eq!(files, vec![dir.path().join("math.csv")]);

        let written = std::fs::read_to_string(&files[0]).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "question,reference_answer,response,token_f1");
        assert_eq!(lines[1], "What is 2+2?,4,,");
        assert_eq!(lines[2], ",,,");
        assert_eq!(lines[3], "Capital of France?,Paris,Paris,1.0000");
        assert_eq!(book.response_at("math", 2), Some("Paris"));
    }

    #[tokio::test]
    async fn empty_source_persists_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = Workbook::from_csv("empty", b"").unwrap();
        assert!(book.items().is_empty());
        book.declare_metrics(&["token_f1".to_string()]);
        let files = book.persist(dir.path()).await.unwrap();
        let written = std::fs::read_to_string(&files[0]).unwrap();
        assert_eq!(written, "question,reference_answer,response,token_f1\n");
    }

    #[tokio::test]
    async fn directory_sources_load_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_second.csv"), "q2,a2\n").unwrap();
        std::fs::write(dir.path().join("a_first.csv"), "\u{feff}q1,a1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let book = Workbook::load(dir.path()).await.unwrap();
        assert_eq!(book.group_count(), 2);
        let items = book.items();
        assert_eq!(items[0].group, "a_first");
        assert_eq!(items[0].question, "q1");
        assert_eq!(items[1].group, "b_second");
    }

    #[tokio::test]
    async fn missing_or_empty_sources_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Workbook::load(dir.path()).await,
            Err(SinkError::NoSources(_))
        ));
        assert!(matches!(
            Workbook::load(&dir.path().join("nope.csv")).await,
            Err(SinkError::Read(..))
        ));
    }

    #[tokio::test]
    async fn non_ascii_groups_persist_to_separate_files() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("問題.csv"), "q1,a1\n").unwrap();
        std::fs::write(src.path().join("答案.csv"), "q2,a2\n").unwrap();

        let mut book = Workbook::load(src.path()).await.unwrap();
        book.declare_metrics(&[]);
        for item in book.items() {
            let response = format!("{} answered", item.question);
            book.record(&item, &response, None).unwrap();
        }

        let out = tempfile::tempdir().unwrap();
        let mut files = book.persist(out.path()).await.unwrap();
        files.sort();
        assert_eq!(
            files,
            vec![out.path().join("問題.csv"), out.path().join("答案.csv")]
        );
        let first = std::fs::read_to_string(out.path().join("問題.csv")).unwrap();
        assert!(first.contains("q1,a1,q1 answered"));
        assert!(!first.contains("q2"));
        let second = std::fs::read_to_string(out.path().join("答案.csv")).unwrap();
        assert!(second.contains("q2,a2,q2 answered"));
    }

    #[tokio::test]
    async fn colliding_group_names_get_numbered() {
        let mut book = Workbook::from_csv("a/b", b"q1,a1\n").unwrap();
        book.groups.push(Group {
            name: "B".to_string(),
            rows: Vec::new(),
        });
        book.groups.push(Group {
            name: "b".to_string(),
            rows: Vec::new(),
        });

        let dir = tempfile::tempdir().unwrap();
        let files = book.persist(dir.path()).await.unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("b.csv"),
                dir.path().join("B_2.csv"),
                dir.path().join("b_3.csv"),
            ]
        );
        assert!(files.iter().all(|f| f.is_file()));
    }

    #[test]
    fn sheet_cells_keep_their_positions() {
        let mut range = Range::new((1, 1), (3, 2));
        range.set_value((1, 1), Data::String("Question".to_string()));
        range.set_value((1, 2), Data::String("Answer".to_string()));
        range.set_value((2, 1), Data::String("What is 2+2?".to_string()));
        range.set_value((2, 2), Data::Float(4.0));
        range.set_value((3, 1), Data::String("Capital of France?".to_string()));
        range.set_value((3, 2), Data::String("Paris".to_string()));

        let rows = rows_from_records(records_from_range(&range));
        let group = Group {
            name: "Sheet1".to_string(),
            rows,
        };
        // Leading blank row survives, header row does not.
        assert_eq!(group.rows.len(), 3);
        assert!(!group.rows[0].is_item());
        assert_eq!(group.rows[1].question, "What is 2+2?");
        assert_eq!(group.rows[1].reference_answer, "4");
        assert_eq!(group.rows[2].reference_answer, "Paris");
    }

    #[test]
    fn empty_sheet_has_no_rows() {
        let range: Range<Data> = Range::empty();
        assert!(rows_from_records(records_from_range(&range)).is_empty());
    }

    #[tokio::test]
    async fn unreadable_spreadsheet_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"not a zip archive").unwrap();
        assert!(is_spreadsheet(&path));
        assert!(matches!(
            Workbook::load(&path).await,
            Err(SinkError::Read(..))
        ));
    }

    #[test]
    fn spreadsheet_extensions_are_case_insensitive() {
        assert!(is_spreadsheet(Path::new("book.XLSX")));
        assert!(is_spreadsheet(Path::new("dir/book.ods")));
        assert!(!is_spreadsheet(Path::new("book.csv")));
        assert!(!is_spreadsheet(Path::new("xlsx")));
    }

    #[test]
    fn single_workbook_has_one_item() {
        let book = Workbook::single(" Q ", " A ");
        let items = book.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].group, "single");
        assert_eq!(items[0].question, "Q");
    }
}
