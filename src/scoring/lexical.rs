//! Token-overlap F1 between candidate and reference.
//!
//! ASCII letters and digits form lowercase words; every other alphanumeric
//! character (CJK in particular) is a token on its own. Punctuation and
//! whitespace separate tokens.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{ScoringError, SimilarityScore, SimilarityScorer};

pub const TOKEN_F1: &str = "token_f1";

#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalScorer;

pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            word.push(ch.to_ascii_lowercase());
            continue;
        }
        if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
        if ch.is_alphanumeric() {
            tokens.extend(ch.to_lowercase().map(String::from));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn counts(tokens: &[String]) -> HashMap<&str, usize> {
    let mut map = HashMap::new();
    for token in tokens {
        *map.entry(token.as_str()).or_insert(0) += 1;
    }
    map
}

/// Multiset F1. Zero when either side has no tokens.
pub fn token_f1(candidate: &str, reference: &str) -> f64 {
    let candidate = tokenize(candidate);
    let reference = tokenize(reference);
    if candidate.is_empty() || reference.is_empty() {
        return 0.0;
    }

    let reference_counts = counts(&reference);
    let overlap: usize = counts(&candidate)
        .into_iter()
        .map(|(token, n)| n.min(reference_counts.get(token).copied().unwrap_or(0)))
        .sum();
    if overlap == 0 {
        return 0.0;
    }

    let precision = overlap as f64 / candidate.len() as f64;
    let recall = overlap as f64 / reference.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

#[async_trait]
impl SimilarityScorer for LexicalScorer {
    fn metric_names(&self) -> Vec<String> {
        vec![TOKEN_F1.to_string()]
    }

    async fn score(&self, candidate: &str, reference: &str) -> Result<SimilarityScore, ScoringError> {
        Ok(SimilarityScore::from_pairs([(TOKEN_F1, token_f1(candidate, reference))]))
    }
}
