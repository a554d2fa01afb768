//! Fuzzy text similarity for echo detection
//!
//! The worker echoes the prompt back with its own normalization applied
//! (collapsed whitespace, linkified URLs), so echo matching cannot be
//! exact. The predicate is pluggable; the default is a character-bigram
//! Dice coefficient over whitespace-normalized text, compared against a
//! configurable threshold.

use std::collections::HashMap;

/// Pluggable similarity predicate: returns a score in `[0, 1]`.
pub type SimilarityFn = fn(&str, &str) -> f64;

/// Default acceptance threshold for prompt-echo matching. Tunable via
/// configuration; 0.75 tolerates whitespace and link rewrites while
/// still rejecting unrelated messages.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;

/// Character-bigram Dice coefficient with whitespace normalization.
///
/// Runs of whitespace collapse to single spaces before comparison. Equal
/// normalized strings score 1.0; strings too short to form a bigram fall
/// back to exact comparison.
pub fn dice_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a == b {
        return 1.0;
    }

    let a_bigrams = bigrams(&a);
    let b_bigrams = bigrams(&b);
    if a_bigrams.is_empty() || b_bigrams.is_empty() {
        return 0.0;
    }

    let mut counts: HashMap<(char, char), usize> = HashMap::new();
    for bigram in &a_bigrams {
        *counts.entry(*bigram).or_insert(0) += 1;
    }
    let mut shared = 0usize;
    for bigram in &b_bigrams {
        if let Some(count) = counts.get_mut(bigram) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }

    (2.0 * shared as f64) / (a_bigrams.len() + b_bigrams.len()) as f64
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn bigrams(text: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_scores_one() {
        assert_eq!(dice_similarity("hello world", "hello world"), 1.0);
    }

    #[test]
    fn whitespace_differences_are_normalized_away() {
        assert_eq!(dice_similarity("hello   world", "hello world"), 1.0);
        assert_eq!(dice_similarity("hello\nworld", "hello world"), 1.0);
    }

    #[test]
    fn minor_rewrites_stay_above_threshold() {
        // Simulates the worker linkifying a URL inside the echoed prompt
        let sent = "summarize https://example.com/article please";
        let echoed = "summarize example.com/article please";
        assert!(dice_similarity(sent, echoed) > DEFAULT_SIMILARITY_THRESHOLD);
    }

    #[test]
    fn unrelated_text_scores_low() {
        let score = dice_similarity(
            "what is the capital of France",
            "the quarterly revenue grew by twelve percent",
        );
        assert!(score < DEFAULT_SIMILARITY_THRESHOLD, "got {score}");
    }

    #[test]
    fn empty_and_tiny_inputs_do_not_panic() {
        assert_eq!(dice_similarity("", ""), 1.0);
        assert_eq!(dice_similarity("a", "a"), 1.0);
        assert_eq!(dice_similarity("a", "b"), 0.0);
        assert_eq!(dice_similarity("", "something"), 0.0);
    }
}
