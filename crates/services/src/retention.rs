//! Thread retention.
//!
//! A thread may stay inactive for `max` days when it has no replies. The
//! allowance shrinks along a cubic curve as the reply count approaches the
//! bump limit, reaching `min` days at the limit. Threads with posts deleted
//! by moderators get a third of the allowance. Nothing is pruned before
//! `min` days of inactivity.

use chrono::{DateTime, Utc};
use domains::{MaintenanceConfig, ThreadActivity};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    /// Minimum inactivity before pruning, in seconds
    min: f64,
    /// Inactivity allowance of a thread without replies, in seconds
    max: f64,
    bump_limit: f64,
}

impl RetentionPolicy {
    pub fn new(min_days: u32, max_days: u32, bump_limit: u32) -> Self {
        Self {
            min: f64::from(min_days) * SECONDS_PER_DAY,
            max: f64::from(max_days) * SECONDS_PER_DAY,
            bump_limit: f64::from(bump_limit.max(1)),
        }
    }

    pub fn from_config(conf: &MaintenanceConfig) -> Self {
        Self::new(conf.thread_expiry_min, conf.thread_expiry_max, conf.bump_limit)
    }

    /// Seconds of inactivity a thread is allowed before it is deleted.
    pub fn threshold(&self, post_count: u64, deleted_by_moderation: bool) -> f64 {
        let fill = post_count as f64 / self.bump_limit - 1.0;
        let mut threshold = self.min + (self.min - self.max) * fill.powi(3);
        if deleted_by_moderation {
            threshold /= 3.0;
        }
        threshold.max(self.min)
    }

    /// Whether a thread last bumped at `bump_time` has outlived its
    /// allowance at `now`. Strictly greater: a thread exactly at its
    /// threshold is kept.
    pub fn is_expired(
        &self,
        post_count: u64,
        bump_time: DateTime<Utc>,
        now: DateTime<Utc>,
        deleted_by_moderation: bool,
    ) -> bool {
        let inactive = (now - bump_time).num_seconds() as f64;
        inactive > self.threshold(post_count, deleted_by_moderation)
    }

    pub fn should_delete(&self, thread: &ThreadActivity, now: DateTime<Utc>) -> bool {
        self.is_expired(thread.post_count, thread.bump_time, now, thread.deleted_by_moderation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const DAY: i64 = 86_400;

    fn policy() -> RetentionPolicy {
        RetentionPolicy::new(7, 14, 1000)
    }

    #[test]
    fn threshold_spans_min_to_max() {
        let p = policy();
        assert_eq!(p.threshold(0, false), (14 * DAY) as f64);
        assert_eq!(p.threshold(1000, false), (7 * DAY) as f64);
        // Past the bump limit the curve drops below min and is clamped.
        assert_eq!(p.threshold(3000, false), (7 * DAY) as f64);
    }

    #[test]
    fn threshold_never_increases_with_posts_and_respects_floor() {
        let p = policy();
        let mut prev = f64::INFINITY;
        for count in 0..=1500 {
            let t = p.threshold(count, false);
            assert!(t <= prev, "threshold rose at post count {count}");
            assert!(t >= (7 * DAY) as f64);
            prev = t;
        }
    }

    #[test]
    fn moderation_deletion_cuts_allowance_to_a_third() {
        let p = policy();
        for count in [0, 1, 100, 500, 999, 1000, 2000] {
            let plain = p.threshold(count, false);
            let moderated = p.threshold(count, true);
            let floor = (7 * DAY) as f64;
            assert!(moderated <= plain / 3.0 || moderated == floor, "count {count}");
            assert!(moderated >= floor);
        }
    }

    #[test]
    fn expiry_comparison_is_strict() {
        let p = policy();
        let now = Utc::now();

        // A full thread's allowance is exactly `min`.
        let at_min = now - Duration::seconds(7 * DAY);
        assert!(!p.is_expired(1000, at_min, now, false));
        assert!(p.is_expired(1000, at_min - Duration::seconds(1), now, false));

        // An empty thread's allowance is exactly `max`.
        let at_max = now - Duration::seconds(14 * DAY);
        assert!(!p.is_expired(0, at_max, now, false));
        assert!(p.is_expired(0, at_max - Duration::seconds(1), now, false));
    }

    #[test]
    fn empty_thread_just_past_min_is_kept() {
        let p = policy();
        let now = Utc::now();
        let bump = now - Duration::seconds(7 * DAY + 1);
        assert!(!p.is_expired(0, bump, now, false));
    }

    #[test]
    fn zero_bump_limit_does_not_divide_by_zero() {
        let p = RetentionPolicy::new(1, 2, 0);
        assert!(p.threshold(5, false).is_finite());
    }
}
