//! Similarity scoring of model answers against reference answers.
//!
//! A scorer turns one (candidate, reference) pair into named metrics. Metric
//! names are fixed per scorer so result columns can be declared up front.

mod embed;
mod lexical;
mod report;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AnalyzerConfig;

pub use embed::{cosine_similarity, EmbeddingScorer};
pub use lexical::{tokenize, LexicalScorer};
pub use report::{MetricSummary, ReportError, ReportGenerator, SummaryReport};

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Embedding request failed: {0}")]
    Embedding(String),

    #[error("Metric {0} produced a non-finite value")]
    NonFinite(String),
}

/// Metric name -> value for one scored item. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimilarityScore(BTreeMap<String, f64>);

impl SimilarityScore {
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.0.get(metric).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combine two scores; `other` wins on name clashes.
    pub fn merged(&self, other: &SimilarityScore) -> Self {
        let mut combined = self.0.clone();
        combined.extend(other.0.iter().map(|(k, v)| (k.clone(), *v)));
        Self(combined)
    }

    fn check_finite(&self) -> Result<(), ScoringError> {
        match self.0.iter().find(|(_, v)| !v.is_finite()) {
            Some((name, _)) => Err(ScoringError::NonFinite(name.clone())),
            None => Ok(()),
        }
    }
}

/// Scores one candidate answer against its reference.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    /// Names of every metric `score` returns, in column order.
    fn metric_names(&self) -> Vec<String>;

    async fn score(&self, candidate: &str, reference: &str) -> Result<SimilarityScore, ScoringError>;
}

/// Runs several scorers and merges their metrics. Any member failing fails
/// the whole item.
pub struct CompositeScorer {
    scorers: Vec<Arc<dyn SimilarityScorer>>,
}

impl CompositeScorer {
    pub fn new(scorers: Vec<Arc<dyn SimilarityScorer>>) -> Self {
        Self { scorers }
    }
}

#[async_trait]
impl SimilarityScorer for CompositeScorer {
    fn metric_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for scorer in &self.scorers {
            for name in scorer.metric_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    async fn score(&self, candidate: &str, reference: &str) -> Result<SimilarityScore, ScoringError> {
        let mut combined = SimilarityScore::default();
        for scorer in &self.scorers {
            let score = scorer.score(candidate, reference).await?;
            combined = combined.merged(&score);
        }
        combined.check_finite()?;
        Ok(combined)
    }
}

/// Lexical overlap always; embedding cosine when an endpoint is configured.
pub fn scorer_from_config(analyzer: &AnalyzerConfig) -> Arc<dyn SimilarityScorer> {
    let mut scorers: Vec<Arc<dyn SimilarityScorer>> = Vec::new();
    if let Some(url) = analyzer.embed_url.as_deref().filter(|u| !u.trim().is_empty()) {
        tracing::info!(url = %url, model = %analyzer.embed_model, "Embedding similarity enabled");
        scorers.push(Arc::new(EmbeddingScorer::new(
            url.to_string(),
            analyzer.embed_api_key.clone(),
            analyzer.embed_model.clone(),
            analyzer.embed_timeout(),
        )));
    }
    scorers.push(Arc::new(LexicalScorer));
    Arc::new(CompositeScorer::new(scorers))
}
