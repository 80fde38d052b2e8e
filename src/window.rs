use chrono::{Duration, Utc};
use serde::Serialize;

use crate::gitlab::types::Timestamp;

/// Half-open time range `[after, before)` that a fetch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub after: Timestamp,
    pub before: Timestamp,
}

impl SyncWindow {
    pub fn new(after: Timestamp, before: Timestamp) -> Self {
        Self { after, before }
    }

    /// The window ending now and spanning `span` into the past.
    pub fn trailing(span: Duration) -> Self {
        let before = Utc::now();
        Self::new(before - span, before)
    }

    /// Next live window: starts where this one ended and ends at `now`.
    ///
    /// Windows never move backward, even if the clock does.
    pub fn advance(&self, now: Timestamp) -> Self {
        Self::new(self.before, now.max(self.before))
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.after <= at && at < self.before
    }

    /// Whether `[after, before)` intersects this window; a missing bound is
    /// unbounded on that side.
    pub fn overlaps(&self, after: Option<Timestamp>, before: Option<Timestamp>) -> bool {
        after.map_or(true, |after| after < self.before)
            && before.map_or(true, |before| before > self.after)
    }
}

/// Walks backward from `now` in windows of `interval`, stopping once a window
/// lies entirely before `floor`.
///
/// The oldest window is clamped to `floor`.
pub fn catch_up_windows(
    now: Timestamp,
    interval: Duration,
    floor: Timestamp,
) -> impl Iterator<Item = SyncWindow> {
    let mut before = now;
    std::iter::from_fn(move || {
        if before <= floor || interval <= Duration::zero() {
            return None;
        }
        let after = (before - interval).max(floor);
        let window = SyncWindow::new(after, before);
        before = after;
        Some(window)
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn advance_is_monotonic() {
        let window = SyncWindow::new(at(1), at(2));
        assert_eq!(window.advance(at(3)), SyncWindow::new(at(2), at(3)));
        assert_eq!(window.advance(at(0)), SyncWindow::new(at(2), at(2)));
    }

    #[test]
    fn overlap_treats_missing_bounds_as_open() {
        let window = SyncWindow::new(at(4), at(6));
        assert!(window.overlaps(None, None));
        assert!(window.overlaps(Some(at(5)), None));
        assert!(window.overlaps(None, Some(at(5))));
        assert!(!window.overlaps(Some(at(6)), None));
        assert!(!window.overlaps(None, Some(at(4))));
        assert!(window.overlaps(Some(at(1)), Some(at(10))));
    }

    #[test]
    fn catch_up_walks_backward_to_floor() {
        let windows: Vec<_> = catch_up_windows(at(10), Duration::hours(4), at(1)).collect();
        assert_eq!(
            windows,
            [
                SyncWindow::new(at(6), at(10)),
                SyncWindow::new(at(2), at(6)),
                SyncWindow::new(at(1), at(2)),
            ]
        );
    }

    #[test]
    fn catch_up_is_empty_when_floor_is_in_the_future() {
        assert_eq!(catch_up_windows(at(1), Duration::hours(1), at(2)).count(), 0);
    }

    #[test]
    fn contains_is_half_open() {
        let window = SyncWindow::new(at(1), at(2));
        assert!(window.contains(at(1)));
        assert!(!window.contains(at(2)));
    }
}
