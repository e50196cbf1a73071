//! Rate-limit bookkeeping shared by every fetcher.
//!
//! Two signals combine into the pre-request delay: server-side quota
//! headers (authoritative when present) and an adaptive delay that grows
//! on 429 and decays on success. Pure state machine; callers supply the
//! wall clock as ms since epoch.

/// Upper bound on the adaptive delay.
pub const MAX_ADAPTIVE_DELAY_MS: u64 = 8_000;
const MIN_ADAPTIVE_DELAY_MS: u64 = 1_000;
/// Decayed delays below this snap to zero.
const ADAPTIVE_FLOOR_MS: u64 = 100;
/// 429s arriving within this window of the last effective one are a
/// single burst across workers, not separate signals.
const DEDUP_WINDOW_MS: i64 = 2_000;
/// Reset header values above this are epoch seconds, below delta seconds.
const RESET_EPOCH_THRESHOLD: i64 = 1_000_000_000;
/// Safety margin added when waiting out a reset deadline.
const RESET_GRACE_MS: i64 = 100;

#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    remaining: Option<i64>,
    limit: Option<i64>,
    reset_at_ms: Option<i64>,
    adaptive_delay_ms: u64,
    consecutive_429s: u32,
    last_429_at_ms: Option<i64>,
}

impl RateLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to apply before the next request: the longer of the
    /// header-derived wait and the adaptive delay.
    pub fn pre_delay_ms(&self, now_ms: i64) -> u64 {
        let header_wait = match (self.remaining, self.reset_at_ms) {
            (Some(remaining), Some(reset)) if remaining <= 1 && reset > now_ms => {
                (reset - now_ms + RESET_GRACE_MS) as u64
            }
            _ => 0,
        };
        header_wait.max(self.adaptive_delay_ms)
    }

    /// Fold server quota headers into the state.
    pub fn observe_headers(
        &mut self,
        remaining: Option<i64>,
        limit: Option<i64>,
        reset: Option<i64>,
        now_ms: i64,
    ) {
        if remaining.is_some() {
            self.remaining = remaining;
        }
        if limit.is_some() {
            self.limit = limit;
        }
        if let Some(reset) = reset {
            self.reset_at_ms = Some(if reset > RESET_EPOCH_THRESHOLD {
                reset * 1000
            } else {
                now_ms + reset * 1000
            });
        }
    }

    /// Register a 429. Bursts within the dedup window collapse to one
    /// bump: `adaptive ← clamp(adaptive · 1.3, 1000, 8000)`.
    pub fn record_429(&mut self, now_ms: i64) {
        if let Some(last) = self.last_429_at_ms {
            if now_ms - last < DEDUP_WINDOW_MS {
                return;
            }
        }
        self.last_429_at_ms = Some(now_ms);
        let bumped = (self.adaptive_delay_ms as f64 * 1.3) as u64;
        self.adaptive_delay_ms = bumped.clamp(MIN_ADAPTIVE_DELAY_MS, MAX_ADAPTIVE_DELAY_MS);
        self.consecutive_429s += 1;
    }

    /// Register a successful request: halve the adaptive delay (snapping
    /// to zero below the floor) and clear the consecutive counter.
    pub fn record_success(&mut self) {
        self.adaptive_delay_ms /= 2;
        if self.adaptive_delay_ms < ADAPTIVE_FLOOR_MS {
            self.adaptive_delay_ms = 0;
        }
        self.consecutive_429s = 0;
    }

    pub fn adaptive_delay_ms(&self) -> u64 {
        self.adaptive_delay_ms
    }

    pub fn consecutive_429s(&self) -> u32 {
        self.consecutive_429s
    }

    pub fn remaining(&self) -> Option<i64> {
        self.remaining
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn reset_at_ms(&self) -> Option<i64> {
        self.reset_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_768_500_000_000;

    #[test]
    fn fresh_state_has_no_delay() {
        let state = RateLimitState::new();
        assert_eq!(state.pre_delay_ms(NOW), 0);
    }

    #[test]
    fn exhausted_quota_waits_for_reset() {
        let mut state = RateLimitState::new();
        // Delta-seconds reset: 3 s from now.
        state.observe_headers(Some(0), Some(100), Some(3), NOW);
        let delay = state.pre_delay_ms(NOW);
        assert_eq!(delay, 3_100);
        // Past the deadline no wait remains.
        assert_eq!(state.pre_delay_ms(NOW + 4_000), 0);
    }

    #[test]
    fn epoch_seconds_reset_is_recognized() {
        let mut state = RateLimitState::new();
        let reset_epoch_secs = NOW / 1000 + 5;
        state.observe_headers(Some(1), None, Some(reset_epoch_secs), NOW);
        assert_eq!(state.pre_delay_ms(NOW), 5_100);
    }

    #[test]
    fn healthy_remaining_means_no_header_wait() {
        let mut state = RateLimitState::new();
        state.observe_headers(Some(40), Some(100), Some(30), NOW);
        assert_eq!(state.pre_delay_ms(NOW), 0);
    }

    #[test]
    fn adaptation_sequence_bumps_dedups_and_decays() {
        let mut state = RateLimitState::new();
        state.record_429(NOW);
        let after_first = state.adaptive_delay_ms();
        assert_eq!(after_first, 1_000);
        assert_eq!(state.consecutive_429s(), 1);

        // Second 429 lands inside the 2 s window: no further bump.
        state.record_429(NOW + 500);
        assert_eq!(state.adaptive_delay_ms(), after_first);

        state.record_success();
        assert!(state.adaptive_delay_ms() < after_first);
        assert_eq!(state.adaptive_delay_ms(), 500);
        assert_eq!(state.consecutive_429s(), 0);
    }

    #[test]
    fn adaptive_delay_never_exceeds_ceiling() {
        let mut state = RateLimitState::new();
        for i in 0..20 {
            state.record_429(NOW + i * 3_000);
        }
        assert_eq!(state.adaptive_delay_ms(), MAX_ADAPTIVE_DELAY_MS);
    }

    #[test]
    fn decay_snaps_to_zero_below_floor() {
        let mut state = RateLimitState::new();
        state.record_429(NOW);
        for _ in 0..5 {
            state.record_success();
        }
        assert_eq!(state.adaptive_delay_ms(), 0);
    }

    #[test]
    fn separate_bursts_compound() {
        let mut state = RateLimitState::new();
        state.record_429(NOW);
        state.record_429(NOW + 2_500);
        assert_eq!(state.adaptive_delay_ms(), 1_300);
        assert_eq!(state.consecutive_429s(), 2);
    }
}
