//! Cosine-similarity ranking over the cached corpus.

use super::types::{EmbeddingEntry, SimilarityResult};
use crate::error::{Error, Result};

/// Cosine similarity of two equal-length vectors.
///
/// Returns `0.0` when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
            entry_id: String::new(),
        });
    }
    Ok(cosine_with_norm(a, norm(a), b))
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with the first vector's norm already known.
fn cosine_with_norm(a: &[f32], norm_a: f32, b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_b += y * y;
    }
    let denom = norm_a * norm_b.sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    // Rounding can push identical vectors just past 1.0.
    (dot / denom).clamp(-1.0, 1.0)
}

/// Rank `corpus` against `query`, best match first.
///
/// `top_k` is clamped to the corpus size; `0` yields an empty result. Equal
/// scores keep corpus order. Every entry is checked, so a single entry with
/// the wrong dimensionality fails the whole ranking with
/// [`Error::DimensionMismatch`].
pub fn rank(
    query: &[f32],
    corpus: &[EmbeddingEntry],
    top_k: usize,
) -> Result<Vec<SimilarityResult>> {
    if let Some(bad) = corpus.iter().find(|e| e.vector.len() != query.len()) {
        return Err(Error::DimensionMismatch {
            expected: query.len(),
            actual: bad.vector.len(),
            entry_id: bad.id.clone(),
        });
    }

    let top_k = top_k.min(corpus.len());
    if top_k == 0 {
        return Ok(Vec::new());
    }

    let query_norm = norm(query);
    let mut scored: Vec<(usize, f32)> = corpus
        .iter()
        .enumerate()
        .map(|(i, entry)| (i, cosine_with_norm(query, query_norm, &entry.vector)))
        .collect();

    // `sort_by` is stable, which gives the insertion-order tie break.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(top_k);

    Ok(scored
        .into_iter()
        .map(|(i, score)| SimilarityResult {
            entry: corpus[i].clone(),
            score,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, text: &str, vector: Vec<f32>) -> EmbeddingEntry {
        EmbeddingEntry::new(id, text, vector, 0)
    }

    fn sample_corpus() -> Vec<EmbeddingEntry> {
        vec![
            entry("1", "hello world", vec![1.0, 0.0]),
            entry("2", "goodbye", vec![0.0, 1.0]),
            entry("3", "hello there", vec![0.8, 0.6]),
            entry("4", "opposite", vec![-1.0, 0.0]),
            entry("5", "diagonal", vec![0.6, 0.8]),
        ]
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]).unwrap() + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_similarity_length_mismatch() {
        assert!(matches!(
            cosine_similarity(&[1.0, 0.0], &[1.0]),
            Err(Error::DimensionMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_hello_world_scenario() {
        let corpus = vec![
            entry("1", "hello world", vec![1.0, 0.0]),
            entry("2", "goodbye", vec![0.0, 1.0]),
        ];
        let results = rank(&[1.0, 0.0], &corpus, 1).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.text, "hello world");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_result_length_is_min_of_top_k_and_corpus() {
        let corpus = sample_corpus();
        for top_k in 0..10 {
            let results = rank(&[0.3, 0.7], &corpus, top_k).unwrap();
            assert_eq!(results.len(), top_k.min(corpus.len()), "top_k = {}", top_k);
        }
    }

    #[test]
    fn test_results_sorted_by_non_increasing_score() {
        let results = rank(&[0.9, 0.1], &sample_corpus(), 5).unwrap();
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(results[0].entry.id, "1");
        assert_eq!(results.last().unwrap().entry.id, "4");
    }

    #[test]
    fn test_ties_keep_corpus_order() {
        let corpus = vec![
            entry("a", "first", vec![0.0, 1.0]),
            entry("b", "second", vec![0.0, 2.0]),
            entry("c", "third", vec![0.0, 3.0]),
        ];
        let results = rank(&[1.0, 0.0], &corpus, 3).unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let corpus = sample_corpus();
        let first = rank(&[0.5, 0.5], &corpus, 3).unwrap();
        let second = rank(&[0.5, 0.5], &corpus, 3).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_top_k_zero_is_empty() {
        assert!(rank(&[1.0, 0.0], &sample_corpus(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_empty_corpus_is_empty() {
        assert!(rank(&[1.0, 0.0], &[], 5).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_is_rejected_not_skipped() {
        let mut corpus = sample_corpus();
        corpus.push(entry("bad", "three dims", vec![1.0, 0.0, 0.0]));

        match rank(&[1.0, 0.0], &corpus, 1) {
            Err(Error::DimensionMismatch {
                expected,
                actual,
                entry_id,
            }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
                assert_eq!(entry_id, "bad");
            }
            other => panic!("expected DimensionMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_dimension_mismatch_even_with_top_k_zero() {
        let corpus = vec![entry("bad", "x", vec![1.0])];
        assert!(rank(&[1.0, 0.0], &corpus, 0).is_err());
    }

    #[test]
    fn test_scores_stay_in_range() {
        let corpus = vec![entry("1", "same", vec![0.1, 0.2, 0.3])];
        let results = rank(&[0.1, 0.2, 0.3], &corpus, 1).unwrap();
        assert!(results[0].score <= 1.0 && results[0].score >= -1.0);
    }
}
