//! Hierarchical category resolution.
//!
//! Feeds describe categories as paths such as `"Apparel > Shoes > Running"`.
//! Destinations only know flat category ids, so the connection's category
//! map is keyed by whichever token the operator chose: usually the leaf,
//! sometimes the full path.

use std::sync::LazyLock;

use elementa_feed_models::CategoryMap;
use regex::Regex;

/// Delimiters tried after the connection's own delimiter, in order.
pub const FALLBACK_DELIMITERS: &[&str] = &[" > ", " | ", ">", "|", "/", "->", "-"];

/// Separators [`extract_leaf`] always splits on.
pub const LEAF_SEPARATORS: &[&str] = &["|", ">", ",", ";", "/", "-"];

static FALLBACK_LEAF_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| separator_pattern(LEAF_SEPARATORS.iter().copied()));

/// Ordered, de-duplicated delimiter candidates for `user_delimiter`.
#[must_use]
pub fn delimiter_candidates(user_delimiter: Option<&str>) -> Vec<&str> {
    let mut candidates: Vec<&str> = Vec::with_capacity(FALLBACK_DELIMITERS.len() + 1);
    for delimiter in user_delimiter
        .into_iter()
        .chain(FALLBACK_DELIMITERS.iter().copied())
    {
        if !delimiter.is_empty() && !candidates.contains(&delimiter) {
            candidates.push(delimiter);
        }
    }
    candidates
}

/// Resolves `category` to a destination category id.
///
/// First hit wins: the leaf under each candidate delimiter, then the whole
/// trimmed string, then the string with invisible and quoting characters
/// stripped as well. `None` means "leave uncategorized", not an error.
#[must_use]
pub fn normalize(
    category: &str,
    user_delimiter: Option<&str>,
    category_map: &CategoryMap,
) -> Option<u64> {
    let trimmed = category.trim();
    if trimmed.is_empty() {
        return None;
    }

    for delimiter in delimiter_candidates(user_delimiter) {
        if let Some(leaf) = leaf_for(trimmed, delimiter)
            && let Some(id) = category_map.get(leaf)
        {
            log::trace!("Category {trimmed:?} matched leaf {leaf:?} on {delimiter:?}");
            return Some(*id);
        }
    }

    if let Some(id) = category_map.get(trimmed) {
        return Some(*id);
    }

    let stripped = strict_trim(trimmed);
    if stripped.is_empty() {
        return None;
    }
    category_map.get(stripped).copied()
}

/// Returns the last non-empty segment of `category_key`, splitting on
/// `delimiter` (if any) and on every [`LEAF_SEPARATORS`] entry.
#[must_use]
pub fn extract_leaf(category_key: &str, delimiter: Option<&str>) -> Option<String> {
    let custom;
    let pattern = match delimiter.filter(|d| !d.is_empty()) {
        Some(delimiter) => {
            custom = separator_pattern(
                std::iter::once(delimiter).chain(LEAF_SEPARATORS.iter().copied()),
            );
            custom.as_ref()
        }
        None => FALLBACK_LEAF_PATTERN.as_ref(),
    }?;

    // regex::Split only runs forwards.
    pattern
        .split(category_key)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
}

fn leaf_for<'a>(category: &'a str, delimiter: &str) -> Option<&'a str> {
    category
        .rsplit(delimiter)
        .map(str::trim)
        .find(|segment| !segment.is_empty())
}

/// Trims whitespace plus zero-width, byte-order-mark, and quote characters
/// that survive a plain [`str::trim`] in spreadsheet exports.
fn strict_trim(s: &str) -> &str {
    s.trim_matches(|c: char| {
        c.is_whitespace() || matches!(c, '\u{200b}' | '\u{feff}' | '"' | '\'')
    })
}

/// Builds an alternation over `separators`, longest first so multi-character
/// separators win over their single-character prefixes.
fn separator_pattern<'a>(separators: impl Iterator<Item = &'a str>) -> Option<Regex> {
    let mut parts: Vec<&str> = separators.collect();
    parts.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    parts.dedup();
    let alternation = parts
        .iter()
        .map(|s| regex::escape(s))
        .collect::<Vec<_>>()
        .join("|");

    match Regex::new(&alternation) {
        Ok(re) => Some(re),
        Err(e) => {
            log::error!("Invalid category separator pattern {alternation:?}: {e}");
            None
        }
    }
}
