//! Delay windows and the run_at chaining rule.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelayRangeError {
    #[error("delay bounds must be non-negative (min={min}, max={max})")]
    Negative { min: i64, max: i64 },
    #[error("min delay {min} exceeds max delay {max}")]
    Inverted { min: i64, max: i64 },
    #[error("malformed time frame {0:?}, expected \"<min> to <max>\"")]
    Malformed(String),
    #[error("max delay {max} exceeds the {limit} second limit")]
    TooLarge { max: i64, limit: i64 },
}

/// Longest accepted delay bound: ten years.
pub const MAX_DELAY_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Inclusive window of whole seconds to wait after the partition's last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    min_seconds: i64,
    max_seconds: i64,
}

impl DelayRange {
    pub fn new(min_seconds: i64, max_seconds: i64) -> Result<Self, DelayRangeError> {
        if min_seconds < 0 || max_seconds < 0 {
            return Err(DelayRangeError::Negative {
                min: min_seconds,
                max: max_seconds,
            });
        }
        if min_seconds > max_seconds {
            return Err(DelayRangeError::Inverted {
                min: min_seconds,
                max: max_seconds,
            });
        }
        if max_seconds > MAX_DELAY_SECONDS {
            return Err(DelayRangeError::TooLarge {
                max: max_seconds,
                limit: MAX_DELAY_SECONDS,
            });
        }
        Ok(Self {
            min_seconds,
            max_seconds,
        })
    }

    pub fn min_seconds(&self) -> i64 {
        self.min_seconds
    }

    pub fn max_seconds(&self) -> i64 {
        self.max_seconds
    }

    pub fn contains(&self, seconds: i64) -> bool {
        (self.min_seconds..=self.max_seconds).contains(&seconds)
    }

    /// Uniform inclusive draw.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        rng.gen_range(self.min_seconds..=self.max_seconds)
    }
}

/// Chain a new run after the partition's latest staged run.
///
/// A latest run in the past (or none at all) is clamped forward to `now`, so
/// the result is never earlier than `now + delay_seconds`. Returns `None`
/// when the result falls outside the representable time range.
pub fn next_run_at(
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    delay_seconds: i64,
) -> Option<DateTime<Utc>> {
    let base = match last_run_at {
        Some(last) if last > now => last,
        _ => now,
    };
    base.checked_add_signed(Duration::try_seconds(delay_seconds)?)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn rejects_inverted_and_negative_ranges() {
        assert_eq!(
            DelayRange::new(300, 60),
            Err(DelayRangeError::Inverted { min: 300, max: 60 })
        );
        assert!(matches!(
            DelayRange::new(-1, 60),
            Err(DelayRangeError::Negative { .. })
        ));
        assert!(DelayRange::new(0, 0).is_ok());
    }

    #[test]
    fn rejects_bounds_past_the_limit() {
        assert!(DelayRange::new(0, MAX_DELAY_SECONDS).is_ok());
        assert_eq!(
            DelayRange::new(10_000_000_000_000, 10_000_000_000_000),
            Err(DelayRangeError::TooLarge {
                max: 10_000_000_000_000,
                limit: MAX_DELAY_SECONDS,
            })
        );
        assert!(matches!(
            DelayRange::new(0, i64::MAX),
            Err(DelayRangeError::TooLarge { .. })
        ));
    }

    #[test]
    fn draws_stay_inside_the_window() {
        let range = DelayRange::new(60, 65).expect("range");
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen_min = false;
        let mut seen_max = false;
        for _ in 0..2_000 {
            let drawn = range.draw(&mut rng);
            assert!(range.contains(drawn), "draw {drawn} escaped window");
            seen_min |= drawn == 60;
            seen_max |= drawn == 65;
        }
        assert!(seen_min && seen_max, "both bounds should be reachable");
    }

    #[test]
    fn degenerate_window_always_returns_the_bound() {
        let range = DelayRange::new(42, 42).expect("range");
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(range.draw(&mut rng), 42);
    }

    #[test]
    fn chains_off_a_future_run() {
        let now = Utc::now();
        let last = now + Duration::seconds(120);
        assert_eq!(
            next_run_at(Some(last), now, 30),
            Some(last + Duration::seconds(30))
        );
    }

    #[test]
    fn clamps_past_or_missing_runs_to_now() {
        let now = Utc::now();
        let stale = now - Duration::seconds(3_600);
        assert_eq!(
            next_run_at(Some(stale), now, 10),
            Some(now + Duration::seconds(10))
        );
        assert_eq!(next_run_at(None, now, 10), Some(now + Duration::seconds(10)));
    }

    #[test]
    fn out_of_range_runs_are_none() {
        let now = Utc::now();
        assert_eq!(next_run_at(None, now, i64::MAX), None);
        assert_eq!(next_run_at(Some(DateTime::<Utc>::MAX_UTC), now, 1), None);
    }
}
