// memory-kb-rs/src/ranking.rs
// Pure ranking helpers for blended, category-weighted search.

use shared_types_rs::{EmbeddingCategory, MemorySearchResult, SIGNATURE_MATCH_THRESHOLD};

/// Blend a raw neighbor distance with its category weight. Higher-weight
/// categories shrink the distance and float toward the top of the merged
/// ranking.
pub fn weighted_distance(raw_distance: f64, weight: f32) -> f64 {
    raw_distance / weight as f64
}

/// The signature-match fast path: a near-duplicate error signature,
/// judged on the raw distance alone so the blended ranking cannot mask it.
pub fn is_signature_match(category: EmbeddingCategory, raw_distance: f64) -> bool {
    category == EmbeddingCategory::ErrorSignature && raw_distance < SIGNATURE_MATCH_THRESHOLD
}

/// Merge per-category hits into one ascending ranking by weighted
/// distance and keep the top k.
pub fn rank_top_k(mut results: Vec<MemorySearchResult>, k: usize) -> Vec<MemorySearchResult> {
    results.sort_by(|a, b| {
        a.weighted_distance
            .partial_cmp(&b.weighted_distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(job_failure_id: i64, category: EmbeddingCategory, distance: f64) -> MemorySearchResult {
        MemorySearchResult {
            id: job_failure_id,
            job_failure_id,
            content: String::new(),
            category,
            weight: category.weight(),
            distance,
            weighted_distance: weighted_distance(distance, category.weight()),
            query_chunk: String::new(),
        }
    }

    #[test]
    fn weighted_distance_divides_by_weight() {
        assert!((weighted_distance(0.3, 3.0) - 0.1).abs() < 1e-9);
        assert!((weighted_distance(0.5, 0.5) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn signature_match_uses_raw_distance_threshold() {
        assert!(is_signature_match(EmbeddingCategory::ErrorSignature, 0.1));
        assert!(!is_signature_match(EmbeddingCategory::ErrorSignature, 0.2));
        // Other categories never trigger the fast path, however close.
        assert!(!is_signature_match(EmbeddingCategory::CodeContext, 0.01));
    }

    #[test]
    fn rank_top_k_sorts_ascending_and_truncates() {
        let results = vec![
            hit(1, EmbeddingCategory::Metadata, 0.2),       // weighted 0.4
            hit(2, EmbeddingCategory::ErrorSignature, 0.3), // weighted 0.1
            hit(3, EmbeddingCategory::FailureLocation, 0.5), // weighted 0.25
        ];

        let ranked = rank_top_k(results, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].job_failure_id, 2);
        assert_eq!(ranked[1].job_failure_id, 3);
    }

    #[test]
    fn high_weight_category_outranks_closer_low_weight_hit() {
        // metadata at raw 0.25 (weighted 0.5) loses to error_signature at
        // raw 0.9 (weighted 0.3) despite being closer in raw terms.
        let results = vec![
            hit(10, EmbeddingCategory::Metadata, 0.25),
            hit(20, EmbeddingCategory::ErrorSignature, 0.9),
        ];
        let ranked = rank_top_k(results, 2);
        assert_eq!(ranked[0].job_failure_id, 20);
    }
}
