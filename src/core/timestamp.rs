use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Native clock of MPEG-TS and of H.264 over RTP.
pub const CLOCK_RATE: u32 = 90_000;

pub fn utc_ns_now() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_secs() * 1_000_000_000 + d.subsec_nanos() as u64
}

/// `ticks = round(seconds * 90000)`
pub fn duration_to_ticks(d: Duration) -> i64 {
    (d.as_secs_f64() * CLOCK_RATE as f64).round() as i64
}

pub fn ticks_to_duration(ticks: u64) -> Duration {
    let secs = ticks / CLOCK_RATE as u64;
    let rem = ticks % CLOCK_RATE as u64;
    Duration::from_secs(secs) + Duration::from_nanos(rem * 1_000_000_000 / CLOCK_RATE as u64)
}

/// Chunk file stamp, millisecond resolution: `2024-05-01_13-04-05_042`.
pub fn file_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S_%3f").to_string()
}
