//! Hashtag extraction from post text.

use regex::Regex;
use std::sync::LazyLock;

static HASHTAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([^\s#]+)").expect("hashtag pattern is valid"));

/// Returns every hashtag in `text`, lowercased, in the order it appears.
///
/// Repeated hashtags are kept: a post mentioning `#rust` twice yields two
/// entries and is counted twice.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    HASHTAG
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|tag| tag.as_str().to_lowercase())
        .collect()
}
