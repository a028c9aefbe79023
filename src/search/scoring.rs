//! Scoring functions for local search.

use crate::store::MetadataRecord;

pub const TITLE_WEIGHT: f32 = 3.0;
pub const TAG_WEIGHT: f32 = 2.0;
pub const DESCRIPTION_WEIGHT: f32 = 1.0;
pub const OCR_WEIGHT: f32 = 1.0;

/// Highest per-keyword score, used to bring keyword scores into [0, 1]
/// before blending with cosine similarity.
pub const MAX_KEYWORD_SCORE: f32 = TITLE_WEIGHT + TAG_WEIGHT + DESCRIPTION_WEIGHT + OCR_WEIGHT;

/// Split a free-text query into lowercase keywords.
pub fn keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text.split_whitespace() {
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if !word.is_empty() && !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

/// Weighted keyword matches against a metadata record, normalized by the
/// number of keywords. Matching is case-insensitive substring matching;
/// `keywords` are expected lowercase.
pub fn keyword_score(metadata: &MetadataRecord, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }

    let title = metadata.title.as_deref().map(str::to_lowercase);
    let description = metadata.description.as_deref().map(str::to_lowercase);
    let ocr = metadata.ocr.as_deref().map(str::to_lowercase);
    let tags: Vec<String> = metadata.tags.iter().map(|t| t.to_lowercase()).collect();

    let contains = |field: &Option<String>, kw: &str| {
        field.as_deref().is_some_and(|text| text.contains(kw))
    };

    let mut total = 0.0;
    for kw in keywords {
        if contains(&title, kw) {
            total += TITLE_WEIGHT;
        }
        if tags.iter().any(|tag| tag.contains(kw.as_str())) {
            total += TAG_WEIGHT;
        }
        if contains(&description, kw) {
            total += DESCRIPTION_WEIGHT;
        }
        if contains(&ocr, kw) {
            total += OCR_WEIGHT;
        }
    }

    total / keywords.len() as f32
}

/// Calculate cosine similarity between two vectors.
///
/// Zero when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// `alpha * keyword + (1 - alpha) * similarity`, with `alpha` clamped to [0, 1].
pub fn blend(keyword: f32, similarity: f32, alpha: f32) -> f32 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha * keyword + (1.0 - alpha) * similarity
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.0001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 0.0001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) - (-1.0)).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_self_similarity_is_one() {
        let v = vec![0.3, -2.5, 7.0, 0.001, 12.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        let zero = vec![0.0; 4];
        let v = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&v, &zero), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
        // Mismatched dimensions
        assert_eq!(cosine_similarity(&v, &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_keyword_score_sunset_beach() {
        let mut metadata = MetadataRecord::new("/photos/beach.jpg");
        metadata.title = Some("Sunset at Beach".into());
        metadata.tags = BTreeSet::from(["vacation".to_string(), "sunset".to_string()]);
        metadata.ocr = Some("sunset beach".into());

        let kws = vec!["sunset".to_string(), "beach".to_string()];
        let score = keyword_score(&metadata, &kws);
        assert!(score > 0.0);
        // sunset: title + tag + ocr = 6, beach: title + ocr = 4
        assert!((score - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_keyword_score_no_match_or_no_keywords() {
        let mut metadata = MetadataRecord::new("/photos/cat.jpg");
        metadata.title = Some("Cat".into());
        assert_eq!(keyword_score(&metadata, &["dog".to_string()]), 0.0);
        assert_eq!(keyword_score(&metadata, &[]), 0.0);
    }

    #[test]
    fn test_keywords_normalizes_query() {
        assert_eq!(keywords("  Sunset, BEACH! sunset "), vec!["sunset", "beach"]);
        assert!(keywords("  ... ").is_empty());
    }

    #[test]
    fn test_blend() {
        assert!((blend(1.0, 0.0, 0.7) - 0.7).abs() < 1e-6);
        assert!((blend(0.0, 1.0, 0.7) - 0.3).abs() < 1e-6);
        assert!((blend(0.5, 0.5, 2.0) - 0.5).abs() < 1e-6);
    }
}
