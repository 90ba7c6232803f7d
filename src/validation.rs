use crate::error::ApiError;

/// Number of hashtags `/count` returns when no count is given.
pub const DEFAULT_RESULT_COUNT: i64 = 100;

/// Request parameter validation for the query API
pub struct RequestValidator;

impl RequestValidator {
    /// Parses the `n` path segment of `/count/{n}`.
    ///
    /// Non-numeric input is rejected. Negative numbers parse fine and later
    /// produce an empty ranking.
    pub fn parse_result_count(raw: &str) -> Result<i64, ApiError> {
        raw.trim()
            .parse::<i64>()
            .map_err(|_| ApiError::InvalidCount(raw.to_string()))
    }

    /// Picks the bucket a count request targets.
    pub fn resolve_filter<'a>(requested: Option<&'a str>, default: &'a str) -> &'a str {
        requested
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .unwrap_or(default)
    }
}
