//! Small helpers shared across modules that don't warrant their own crate
//! dependency (a full `chrono` stack is more than correlation timestamps need).

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
