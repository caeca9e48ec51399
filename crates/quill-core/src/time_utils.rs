/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Converts a chrono instant to Unix milliseconds, clamping pre-epoch values to zero.
pub fn unix_ms_from_datetime(value: chrono::DateTime<chrono::Utc>) -> u64 {
    u64::try_from(value.timestamp_millis()).unwrap_or(0)
}
