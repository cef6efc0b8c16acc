use std::time::Duration;

/// Split a comma separated value, dropping blanks.
pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Human readable duration (`250ms`, `2s`, `5min`, `1h 30m`) in milliseconds.
pub fn parse_duration_ms(raw: &str) -> Result<u64, String> {
    let duration = humantime::parse_duration(raw.trim()).map_err(|err| err.to_string())?;
    duration_to_ms(duration)
}

/// Like [`parse_duration_ms`], but `0`, `none`, `never` and `off` disable the
/// limit.
pub fn parse_optional_duration_ms(raw: &str) -> Result<Option<u64>, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "none" | "never" | "off" => Ok(None),
        other => parse_duration_ms(other).map(Some),
    }
}

fn duration_to_ms(duration: Duration) -> Result<u64, String> {
    u64::try_from(duration.as_millis()).map_err(|_| "duration is too large".to_string())
}
