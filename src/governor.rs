//! Request-quota pacing.
//!
//! Upstream reports the requests left in the current window with every
//! response. Reset timing is not observable, so at or below the floor the
//! loop waits a fixed backoff and lets the next fetch report the quota again.

use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::{error, warn};

/// `X-RateLimit-Remaining`; lowercase so it can be used as a static header name.
pub const QUOTA_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Quota is healthy: wait the regular poll interval.
    Standard(Duration),
    /// Quota is at/below the floor or unknown: wait for it to recover.
    Backoff,
}

/// Pure quota policy. Unknown quota takes the conservative path.
pub fn next_delay(remaining_quota: Option<i64>, floor_threshold: i64, poll_interval: Duration) -> Delay {
    match remaining_quota {
        Some(remaining) if remaining > floor_threshold => Delay::Standard(poll_interval),
        _ => Delay::Backoff,
    }
}

/// Reads the remaining-quota header; missing or non-numeric is `None`.
pub fn remaining_quota(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(QUOTA_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
}

/// Outcome of one throttle decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pause {
    pub wait: Duration,
    pub backing_off: bool,
    /// Set when this pause completed a run of `max_backoff_polls` backoffs.
    pub alarm: bool,
}

/// Stateful wrapper around [`next_delay`] that tracks consecutive backoff
/// waits and raises an alarm instead of stalling silently.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    floor_threshold: i64,
    poll_interval: Duration,
    backoff_interval: Duration,
    max_backoff_polls: u32,
    consecutive_backoffs: u32,
    alarms: u64,
}

impl RateGovernor {
    pub fn new(
        floor_threshold: i64,
        poll_interval: Duration,
        backoff_interval: Duration,
        max_backoff_polls: u32,
    ) -> Self {
        Self {
            floor_threshold,
            poll_interval,
            backoff_interval,
            max_backoff_polls: max_backoff_polls.max(1),
            consecutive_backoffs: 0,
            alarms: 0,
        }
    }

    pub fn from_config(cfg: &crate::config::Ingest) -> Self {
        Self::new(
            cfg.quota_floor,
            cfg.poll_interval(),
            cfg.backoff_interval(),
            cfg.max_backoff_polls,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn consecutive_backoffs(&self) -> u32 {
        self.consecutive_backoffs
    }

    pub fn alarms(&self) -> u64 {
        self.alarms
    }

    pub fn pause(&mut self, remaining_quota: Option<i64>) -> Pause {
        match next_delay(remaining_quota, self.floor_threshold, self.poll_interval) {
            Delay::Standard(wait) => {
                self.consecutive_backoffs = 0;
                Pause {
                    wait,
                    backing_off: false,
                    alarm: false,
                }
            }
            Delay::Backoff => self.back_off(remaining_quota),
        }
    }

    /// Pause after upstream refused a request. A rate-limit refusal, or one
    /// reporting a quota at or below the floor, counts as a backoff; other
    /// refusals return `None` and the caller keeps its regular interval.
    pub fn after_refusal(&mut self, remaining_quota: Option<i64>, rate_limited: bool) -> Option<Pause> {
        let at_floor = remaining_quota.is_some_and(|r| r <= self.floor_threshold);
        (rate_limited || at_floor).then(|| self.back_off(remaining_quota))
    }

    fn back_off(&mut self, remaining_quota: Option<i64>) -> Pause {
        self.consecutive_backoffs += 1;
        warn!(
            remaining = ?remaining_quota,
            floor = self.floor_threshold,
            attempt = self.consecutive_backoffs,
            wait_ms = self.backoff_interval.as_millis() as u64,
            "quota at floor; waiting for it to reset"
        );
        let alarm = self.consecutive_backoffs >= self.max_backoff_polls;
        if alarm {
            self.alarms += 1;
            error!(
                polls = self.consecutive_backoffs,
                remaining = ?remaining_quota,
                "upstream quota has not recovered; check the rate limit"
            );
            self.consecutive_backoffs = 0;
        }
        Pause {
            wait: self.backoff_interval,
            backing_off: true,
            alarm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    const POLL: Duration = Duration::from_secs(5);

    #[test]
    fn at_floor_backs_off() {
        assert_eq!(next_delay(Some(2), 2, POLL), Delay::Backoff);
        assert_eq!(next_delay(Some(0), 2, POLL), Delay::Backoff);
        assert_eq!(next_delay(Some(-1), 2, POLL), Delay::Backoff);
    }

    #[test]
    fn above_floor_uses_standard_interval() {
        assert_eq!(next_delay(Some(10), 2, POLL), Delay::Standard(POLL));
        assert_eq!(next_delay(Some(3), 2, POLL), Delay::Standard(POLL));
    }

    #[test]
    fn unknown_quota_is_conservative() {
        assert_eq!(next_delay(None, 2, POLL), Delay::Backoff);
    }

    #[test]
    fn header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(remaining_quota(&headers), None);
        headers.insert(QUOTA_HEADER, HeaderValue::from_static("57"));
        assert_eq!(remaining_quota(&headers), Some(57));
        headers.insert(QUOTA_HEADER, HeaderValue::from_static("many"));
        assert_eq!(remaining_quota(&headers), None);
    }

    #[test]
    fn escalates_after_max_backoffs() {
        let backoff = Duration::from_secs(10);
        let mut gov = RateGovernor::new(2, POLL, backoff, 3);

        let p = gov.pause(Some(1));
        assert_eq!(p, Pause { wait: backoff, backing_off: true, alarm: false });
        assert!(!gov.pause(None).alarm);
        assert!(gov.pause(Some(2)).alarm);
        assert_eq!(gov.alarms(), 1);
        assert_eq!(gov.consecutive_backoffs(), 0);

        assert!(!gov.pause(Some(0)).alarm);
        let p = gov.pause(Some(50));
        assert_eq!(p, Pause { wait: POLL, backing_off: false, alarm: false });
        assert_eq!(gov.consecutive_backoffs(), 0);
    }

    #[test]
    fn refusals_back_off_only_when_quota_bound() {
        let backoff = Duration::from_secs(10);
        let mut gov = RateGovernor::new(2, POLL, backoff, 2);

        assert_eq!(gov.after_refusal(None, false), None);
        assert_eq!(gov.after_refusal(Some(40), false), None);
        assert_eq!(gov.consecutive_backoffs(), 0);

        let p = gov.after_refusal(Some(40), true).unwrap();
        assert_eq!(p, Pause { wait: backoff, backing_off: true, alarm: false });
        let p = gov.after_refusal(Some(1), false).unwrap();
        assert!(p.backing_off && p.alarm);
        assert_eq!(gov.alarms(), 1);
    }
}
