//! Title normalization and comparison
//!
//! Titles coming from the media server are messy: invisible direction marks, textual
//! `[U+200E]` debug markers, accents, release years in brackets. Everything that compares
//! titles goes through [`normalize`] first.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Textual bidi/zero-width markers some Plex agents leave in titles
static BIDI_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[U\+(?:200[B-F]|202[A-E]|206[6-9]|061C|FEFF)\]").expect("valid marker regex")
});

/// A four digit year wrapped in round or square brackets
static BRACKETED_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[(\[]\s*(?:18|19|20|21)\d{2}\s*[)\]]").expect("valid year regex")
});

/// Title similarity assumed when one normalized title contains the other
const CONTAINMENT_SIMILARITY: f64 = 0.9;

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' | '\u{FEFF}'
    )
}

/// Remove invisible direction/zero-width characters and their textual markers
pub fn clean_bidi(raw: &str) -> String {
    let without_chars: String = raw.chars().filter(|c| !is_invisible(*c)).collect();
    BIDI_MARKER.replace_all(&without_chars, "").trim().to_string()
}

/// Canonical form of a title for matching.
///
/// Deterministic and idempotent. `"Inception (2010)"` and `"Inception"` normalize to the
/// same string, `"Amélie"` becomes `"amelie"` and `"Lord's"` becomes `"lords"`.
pub fn normalize(raw: &str) -> String {
    let cleaned = clean_bidi(raw);
    if cleaned.is_empty() {
        return String::new();
    }

    // Lowercase on both sides of the decomposition: some uppercase letters only lose their
    // marks after folding, others (compatibility forms) only become uppercase after it.
    let folded: String = cleaned
        .to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    let without_years = BRACKETED_YEAR.replace_all(&folded, " ");

    let mut out = String::with_capacity(without_years.len());
    for c in without_years.chars() {
        match c {
            '\'' | '\u{2019}' | '\u{2018}' | '`' | '\u{00B4}' => {}
            c if c.is_alphanumeric() => out.push(c),
            _ => out.push(' '),
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity of two titles in `[0, 1]` after normalization.
///
/// Equal titles score 1.0. Otherwise the normalized Levenshtein similarity, raised to 0.9
/// when one title contains the other ("alien" vs "alien director's cut").
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    if na == nb {
        return 1.0;
    }

    let base = strsim::normalized_levenshtein(&na, &nb);
    if na.contains(&nb) || nb.contains(&na) {
        base.max(CONTAINMENT_SIMILARITY)
    } else {
        base
    }
}
