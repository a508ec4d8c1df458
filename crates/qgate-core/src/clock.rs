use std::time::{SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;

/// Quota partition keys are Beijing-time (UTC+8) strings derived from the
/// absolute UTC instant. No OS time-zone database is consulted, so ambient
/// configuration cannot shift a partition boundary.
const BEIJING_OFFSET_MS: i64 = 8 * 60 * 60 * 1000;

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn shifted(now_ms: i64) -> OffsetDateTime {
    let secs = (now_ms + BEIJING_OFFSET_MS).div_euclid(1000);
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// `YYYY-MM-DD` in Beijing time.
pub fn beijing_date(now_ms: i64) -> String {
    let dt = shifted(now_ms);
    format!(
        "{:04}-{:02}-{:02}",
        dt.year(),
        u8::from(dt.month()),
        dt.day()
    )
}

/// `YYYY-MM-DDTHH:MM` in Beijing time.
pub fn beijing_minute(now_ms: i64) -> String {
    let dt = shifted(now_ms);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute()
    )
}
