//! Concept phrase extraction and embedding math shared across the crate.

use std::collections::{BTreeSet, HashMap};

/// Words that carry no concept signal on their own.
const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "before", "being", "could", "every", "first",
    "other", "should", "their", "there", "these", "those", "through", "under",
    "using", "where", "which", "while", "would", "please", "explain",
    "describe", "system",
];

/// Extract the top `limit` concept words from `text`: alphanumeric tokens
/// longer than 4 characters, ranked by frequency, ties broken
/// alphabetically for determinism.
pub fn extract_concepts(text: &str, limit: usize) -> Vec<String> {
    let stop: BTreeSet<&str> = STOP_WORDS.iter().copied().collect();

    let mut counts = HashMap::<String, usize>::new();
    for token in text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| word.len() > 4)
        .map(|word| word.to_lowercase())
        .filter(|word| !stop.contains(word.as_str()))
    {
        *counts.entry(token).or_default() += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|(left_word, left_count), (right_word, right_count)| {
        right_count
            .cmp(left_count)
            .then_with(|| left_word.cmp(right_word))
    });

    ranked.into_iter().take(limit).map(|(word, _)| word).collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_words_are_skipped() {
        let concepts = extract_concepts("scan the host with nmap now", 5);
        // "nmap" (4 chars) and everything shorter is below the length floor.
        assert!(concepts.is_empty());
    }

    #[test]
    fn frequency_ranks_first() {
        let text = "injection injection injection payload payload firewall";
        let concepts = extract_concepts(text, 2);
        assert_eq!(concepts, vec!["injection", "payload"]);
    }

    #[test]
    fn ties_break_alphabetically() {
        let concepts = extract_concepts("zebra apple zebra apple", 2);
        assert_eq!(concepts, vec!["apple", "zebra"]);
    }

    #[test]
    fn limit_caps_output() {
        let text = "alpha1 bravo2 charlie3 delta4 echo5 foxtrot6 golfing7";
        assert_eq!(extract_concepts(text, 5).len(), 5);
    }

    #[test]
    fn stop_words_are_filtered() {
        let concepts = extract_concepts("please explain about phishing", 5);
        assert_eq!(concepts, vec!["phishing"]);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0, "dim mismatch");
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0, "zero vector");
    }
}
