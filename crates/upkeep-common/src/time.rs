//! ---
//! upkeep_section: "01-core-functionality"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Shared primitives and utilities for the orchestration runtime."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Roughly thirty years; stands in for "never" when a deadline overflows.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Age of a file relative to `now`, based on its modification time.
///
/// Files stamped in the future report an age of zero.
pub fn file_age(path: &Path, now: SystemTime) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(now.duration_since(modified).unwrap_or_default())
}

/// `start + timeout`, falling back to a far-off deadline when the sum overflows.
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Compact, sortable UTC stamp used in report file names.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn slug_sorts_lexicographically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 11, 2, 3, 4, 5).unwrap();
        assert_eq!(timestamp_slug(early), "20240102T030405.000Z");
        assert!(timestamp_slug(early) < timestamp_slug(late));
    }

    #[test]
    fn overflowing_deadline_saturates() {
        let start = Instant::now();
        assert_eq!(
            deadline_after(start, Duration::from_secs(5)),
            start + Duration::from_secs(5)
        );
        assert!(deadline_after(start, Duration::MAX) > start + Duration::from_secs(86_400));
    }

    #[test]
    fn fresh_file_is_young() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let age = file_age(file.path(), SystemTime::now() + Duration::from_secs(5)).unwrap();
        assert!(age >= Duration::from_secs(4));
        assert!(age < Duration::from_secs(60));
    }
}
