//! Query normalization and cache fingerprints.
//!
//! The fingerprint must be stable across cosmetic phrasing differences:
//! `"What is SQL injection?"` and `"what is sql injection"` cache to the
//! same slot.  Normalization lowercases, strips punctuation runs, collapses
//! whitespace, and folds naive plural forms (`attacks` → `attack`) so
//! near-identical queries converge.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Runs of anything non-alphanumeric collapse into a single separator.
fn separator_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9]+").expect("static pattern"))
}

/// Canonical form of a query used for fingerprinting.
pub fn normalize(query: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    for token in separator_runs().split(query).filter(|t| !t.is_empty()) {
        let mut word = token.to_lowercase();
        // Plural folding: long words lose a trailing 's' unless doubled
        // ("access" keeps both).  Keeps "attacks"/"attack" on one slot
        // without dragging in a stemmer.
        if word.len() > 4 && word.ends_with('s') && !word.ends_with("ss") {
            word.pop();
        }
        words.push(word);
    }
    words.join(" ")
}

/// Stable hash of the normalized query plus salient options.
///
/// Options participate in the key so a category-filtered lookup never
/// collides with an unfiltered one.  `BTreeMap` keeps option order
/// deterministic.
pub fn fingerprint(query: &str, options: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(query).as_bytes());
    for (key, value) in options {
        hasher.update(b"\x1f");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}
