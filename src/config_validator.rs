//! Field checks used by the `validator` derives in [`crate::config`].

use std::borrow::Cow;
use validator::ValidationError;

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(Cow::Borrowed(message));
    err
}

/// Validates a Redis URL
pub fn validate_redis_url(url: &str) -> Result<(), ValidationError> {
    if url.trim().is_empty() {
        return Err(invalid("redis_url", "Redis URL cannot be empty"));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") && !url.starts_with("unix://") {
        return Err(invalid(
            "redis_url",
            "Redis URL must start with 'redis://', 'rediss://' or 'unix://'",
        ));
    }

    Ok(())
}

/// Validates the upstream stream endpoint
pub fn validate_stream_url(url: &str) -> Result<(), ValidationError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(invalid(
            "stream_url",
            "Stream URL must start with 'http://' or 'https://'",
        ));
    }

    Ok(())
}

/// Rejects values that are empty once trimmed
pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(invalid("blank", "Value cannot be empty"));
    }

    Ok(())
}
