//! Aggregate similarity report over every scored item of a task.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use super::SimilarityScore;

/// Scores below this are flagged as poor matches.
const POOR_THRESHOLD: f64 = 0.5;

const TEXT_REPORT: &str = "similarity_summary.txt";
const JSON_REPORT: &str = "similarity_summary.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("No scores to summarize")]
    Empty,

    #[error("Failed to write {0}: {1}")]
    Write(PathBuf, String),

    #[error("Failed to serialize report: {0}")]
    Serialize(String),
}

/// Produces aggregate artifacts from a task's scores.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Write the report into `output_dir`; returns the files written.
    async fn generate(
        &self,
        scores: &[SimilarityScore],
        output_dir: &Path,
        threshold: f64,
    ) -> Result<Vec<PathBuf>, ReportError>;
}

/// Descriptive statistics for one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub at_or_above_threshold: usize,
    pub below_poor: usize,
}

impl MetricSummary {
    /// `None` for an empty slice.
    pub fn from_values(values: &[f64], threshold: f64) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Some(Self {
            count,
            mean,
            median,
            std: variance.sqrt(),
            min: sorted[0],
            max: sorted[count - 1],
            at_or_above_threshold: sorted.iter().filter(|v| **v >= threshold).count(),
            below_poor: sorted.iter().filter(|v| **v < POOR_THRESHOLD).count(),
        })
    }
}

/// Summarize every metric present in `scores`.
pub fn summarize(scores: &[SimilarityScore], threshold: f64) -> BTreeMap<String, MetricSummary> {
    let mut by_metric: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for score in scores {
        for (name, value) in score.iter() {
            by_metric.entry(name.to_string()).or_default().push(value);
        }
    }
    by_metric
        .into_iter()
        .filter_map(|(name, values)| MetricSummary::from_values(&values, threshold).map(|s| (name, s)))
        .collect()
}

#[derive(Serialize)]
struct JsonReport<'a> {
    threshold: f64,
    poor_threshold: f64,
    items: usize,
    metrics: &'a BTreeMap<String, MetricSummary>,
}

fn render_text(metrics: &BTreeMap<String, MetricSummary>, items: usize, threshold: f64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Similarity summary");
    let _ = writeln!(out, "{}", "=".repeat(50));
    let _ = writeln!(out, "Scored items: {items}");
    let _ = writeln!(out, "Good match threshold: {threshold:.2}");
    let _ = writeln!(out, "Poor match threshold: {POOR_THRESHOLD:.2}");
    let _ = writeln!(out);
    let _ = writeln!(out, "Interpretation");
    let _ = writeln!(out, "{}", "-".repeat(30));
    let _ = writeln!(out, "0.9-1.0: nearly identical meaning");
    let _ = writeln!(out, "0.7-0.9: same core meaning, different wording");
    let _ = writeln!(out, "0.5-0.7: partially related");
    let _ = writeln!(out, "0.0-0.5: mostly unrelated");
    let _ = writeln!(out);

    for (name, summary) in metrics {
        let _ = writeln!(out, "{name}");
        let _ = writeln!(out, "{}", "-".repeat(30));
        let _ = writeln!(out, "Mean: {:.4}", summary.mean);
        let _ = writeln!(out, "Median: {:.4}", summary.median);
        let _ = writeln!(out, "Std: {:.4}", summary.std);
        let _ = writeln!(out, "Min: {:.4}", summary.min);
        let _ = writeln!(out, "Max: {:.4}", summary.max);
        let _ = writeln!(out, ">= threshold: {}/{}", summary.at_or_above_threshold, summary.count);
        let _ = writeln!(out, "< {POOR_THRESHOLD:.1}: {}/{}", summary.below_poor, summary.count);
        let _ = writeln!(out);
    }
    out
}

/// Plain-text and JSON summary files.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryReport;

#[async_trait]
impl ReportGenerator for SummaryReport {
    async fn generate(
        &self,
        scores: &[SimilarityScore],
        output_dir: &Path,
        threshold: f64,
    ) -> Result<Vec<PathBuf>, ReportError> {
        let metrics = summarize(scores, threshold);
        if metrics.is_empty() {
            return Err(ReportError::Empty);
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| ReportError::Write(output_dir.to_path_buf(), e.to_string()))?;

        let text_path = output_dir.join(TEXT_REPORT);
        tokio::fs::write(&text_path, render_text(&metrics, scores.len(), threshold))
            .await
            .map_err(|e| ReportError::Write(text_path.clone(), e.to_string()))?;

        let json = serde_json::to_vec_pretty(&JsonReport {
            threshold,
            poor_threshold: POOR_THRESHOLD,
            items: scores.len(),
            metrics: &metrics,
        })
        .map_err(|e| ReportError::Serialize(e.to_string()))?;
        let json_path = output_dir.join(JSON_REPORT);
        tokio::fs::write(&json_path, json)
            .await
            .map_err(|e| ReportError::Write(json_path.clone(), e.to_string()))?;

        tracing::debug!(dir = %output_dir.display(), metrics = metrics.len(), "Similarity report written");
        Ok(vec![text_path, json_path])
    }
}
