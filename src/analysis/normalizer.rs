use unicode_normalization::UnicodeNormalization;

use crate::core::error::{Error, Result};

/// Canonicalizes raw text into the lookup key used everywhere else: NFKC,
/// lowercase, trimmed, internal whitespace runs collapsed to a single space.
/// Ingest, query, filter, and history all go through this one function;
/// divergence here breaks cache hits and index lookups.
pub fn normalize(text: &str) -> Result<String> {
    normalize_with_limit(text, 80)
}

pub fn normalize_with_limit(text: &str, max_len: usize) -> Result<String> {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();

    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for ch in folded.trim().chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }

    if out.is_empty() {
        return Err(Error::invalid_input("phrase is empty after normalization"));
    }
    let len = out.chars().count();
    if len > max_len {
        return Err(Error::invalid_input(format!(
            "phrase is {} code points, limit is {}",
            len, max_len
        )));
    }
    if out.chars().any(|c| c.is_control()) {
        return Err(Error::invalid_input("phrase contains control characters"));
    }

    Ok(out)
}
