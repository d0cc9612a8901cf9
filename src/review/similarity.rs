//! Likely-same-issue scoring between two suggestions, and greedy clustering.
//!
//! The score is a convex combination of four signals: same file (hard gate),
//! line proximity, same category and description token overlap.

use crate::types::Suggestion;
use std::collections::HashSet;

/// Minimum score for two suggestions to be treated as the same issue
pub const SIMILARITY_THRESHOLD: f64 = 0.55;

const FILE_WEIGHT: f64 = 0.35;
const LINE_WEIGHT: f64 = 0.30;
const CATEGORY_WEIGHT: f64 = 0.15;
const TEXT_WEIGHT: f64 = 0.20;
/// Line distance at which the proximity contribution reaches zero
const MAX_LINE_DISTANCE: f64 = 5.0;
/// Tokens shorter than this are dropped before comparison
const MIN_TOKEN_LEN: usize = 3;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one", "our",
    "out", "has", "had", "its", "may", "use", "this", "that", "with", "from", "have", "been",
    "will", "would", "should", "could", "into", "than", "then", "them", "they", "there",
    "their", "these", "those", "when", "which", "while", "what", "where", "also", "more",
    "some", "such", "only", "very", "just", "here", "each", "other", "about", "being",
];

/// Score in `[0, 1]` that `a` and `b` describe the same underlying issue
pub fn similarity(a: &Suggestion, b: &Suggestion) -> f64 {
    if a.file_path != b.file_path {
        return 0.0;
    }

    let mut score = FILE_WEIGHT;

    let distance = (a.effective_line() - b.effective_line()).abs();
    if distance <= MAX_LINE_DISTANCE {
        score += LINE_WEIGHT * (1.0 - distance / MAX_LINE_DISTANCE);
    }

    if a.category == b.category {
        score += CATEGORY_WEIGHT;
    }

    score += TEXT_WEIGHT * token_overlap(&a.description, &b.description);

    score.clamp(0.0, 1.0)
}

/// Jaccard similarity of the normalized token sets of two texts
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let left = normalize_tokens(a);
    let right = normalize_tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

/// Lowercase, strip punctuation, drop short and stop words, then stem
pub fn normalize_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= MIN_TOKEN_LEN)
        .filter(|token| !STOP_WORDS.contains(token))
        .map(stem)
        .collect()
}

/// Strip at most one of `-ing`, `-ed`, `-s`, keeping a stem of at least three characters
fn stem(word: &str) -> String {
    let len = word.chars().count();
    if len > 5 && word.ends_with("ing") {
        return word[..word.len() - 3].to_string();
    }
    if len > 4 && word.ends_with("ed") {
        return word[..word.len() - 2].to_string();
    }
    if len > 3 && word.ends_with('s') {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

/// Anchor-based greedy clustering in arrival order
///
/// Each unassigned suggestion opens a cluster and pulls in every later
/// unassigned suggestion scoring at least [`SIMILARITY_THRESHOLD`] against it.
/// Membership is decided against the anchor only, not transitively.
pub fn group_by_similarity(suggestions: Vec<Suggestion>) -> Vec<Vec<Suggestion>> {
    let mut assigned = vec![false; suggestions.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for anchor in 0..suggestions.len() {
        if assigned[anchor] {
            continue;
        }
        assigned[anchor] = true;
        let mut members = vec![anchor];

        for candidate in anchor + 1..suggestions.len() {
            if !assigned[candidate]
                && similarity(&suggestions[anchor], &suggestions[candidate])
                    >= SIMILARITY_THRESHOLD
            {
                assigned[candidate] = true;
                members.push(candidate);
            }
        }
        clusters.push(members);
    }

    let mut slots: Vec<Option<Suggestion>> = suggestions.into_iter().map(Some).collect();
    clusters
        .into_iter()
        .map(|members| {
            members
                .into_iter()
                .filter_map(|i| slots[i].take())
                .collect()
        })
        .collect()
}
