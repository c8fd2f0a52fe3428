//! Deadline timers and retransmission timeout estimation.
//!
//! The core is sans-IO: state machines never sleep. They arm [`Timer`]s with
//! an absolute deadline and the owning task polls them with the current time.
//! This keeps every timer cancellable from inside the state machine without
//! any shared handle, and cancelling twice (or after expiry) does nothing.
//!
//! [`RtoEstimator`] computes the retransmission timeout per RFC 6298:
//!
//! ```text
//! first sample R:   SRTT = R            RTTVAR = R/2
//! later samples:    RTTVAR = (1-beta)*RTTVAR + beta*|SRTT - R|
//!                   SRTT   = (1-alpha)*SRTT  + alpha*R
//! RTO = clamp(SRTT + max(G, K*RTTVAR), lower, upper)
//! ```

use std::time::{Duration, Instant};

/// Clock granularity used in the RTO formula
const CLOCK_GRANULARITY: Duration = Duration::from_millis(1);

/// Backoff doublings kept before the upper bound takes over
const MAX_BACKOFF_SHIFT: u32 = 16;

/// One-shot deadline timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// Create a disarmed timer
    #[must_use]
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm to fire `after` from `now`, replacing any earlier deadline
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    /// Arm only if not already armed
    pub fn arm_if_idle(&mut self, now: Instant, after: Duration) {
        if self.deadline.is_none() {
            self.arm(now, after);
        }
    }

    /// Disarm. Returns true if the timer was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// True while armed and not yet fired
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Pending deadline
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true exactly once when `now` reached the deadline, then disarms.
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of two optional deadlines
#[must_use]
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// RFC 6298 retransmission timeout estimator
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    shift: u32,
    lower: Duration,
    upper: Duration,
    alpha: f64,
    beta: f64,
    k: u32,
}

impl RtoEstimator {
    /// Estimator starting at `initial`, clamped to `[lower, upper]`, with the
    /// standard gains (alpha 1/8, beta 1/4, K 4).
    #[must_use]
    pub fn new(initial: Duration, lower: Duration, upper: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial.clamp(lower, upper),
            shift: 0,
            lower,
            upper,
            alpha: 0.125,
            beta: 0.25,
            k: 4,
        }
    }

    /// Override the smoothing gains
    #[must_use]
    pub fn with_gains(mut self, alpha: f64, beta: f64, k: u32) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self.k = k;
        self
    }

    /// Current timeout, including any backoff
    #[must_use]
    pub fn rto(&self) -> Duration {
        self.rto
            .saturating_mul(1 << self.shift)
            .min(self.upper)
    }

    /// Smoothed round-trip time, once sampled
    #[must_use]
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Feed one round-trip sample. Callers apply Karn's rule and never pass
    /// samples from retransmitted segments.
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let diff = srtt.abs_diff(rtt);
                self.rttvar = self.rttvar.mul_f64(1.0 - self.beta) + diff.mul_f64(self.beta);
                self.srtt = Some(srtt.mul_f64(1.0 - self.alpha) + rtt.mul_f64(self.alpha));
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        let variance = (self.rttvar * self.k).max(CLOCK_GRANULARITY);
        self.rto = (srtt + variance).clamp(self.lower, self.upper);
        self.shift = 0;
    }

    /// Double the timeout after an expiry, up to the upper bound
    pub fn backoff(&mut self) {
        if self.rto() < self.upper {
            self.shift = (self.shift + 1).min(MAX_BACKOFF_SHIFT);
        }
    }

    /// Drop accumulated backoff once the peer acknowledges new data
    pub fn reset_backoff(&mut self) {
        self.shift = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_once() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.arm(now, Duration::from_secs(1));

        assert!(!timer.poll_expired(now));
        assert!(timer.poll_expired(now + Duration::from_secs(1)));
        assert!(!timer.poll_expired(now + Duration::from_secs(2)));
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.arm(now, Duration::from_secs(1));

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.poll_expired(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.arm(now, Duration::from_millis(10));
        assert!(timer.poll_expired(now + Duration::from_millis(10)));
        assert!(!timer.cancel());
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_arm_if_idle_keeps_deadline() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.arm(now, Duration::from_secs(1));
        timer.arm_if_idle(now, Duration::from_secs(10));
        assert_eq!(timer.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
        assert_eq!(earliest(None, Some(now)), Some(now));
        assert_eq!(earliest(Some(later), None), Some(later));
        assert_eq!(earliest(None, None), None);
    }

    #[test]
    fn test_rto_first_sample() {
        let mut rto = RtoEstimator::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(60),
        );
        rto.sample(Duration::from_millis(100));
        // SRTT 100ms + 4 * 50ms
        assert_eq!(rto.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(rto.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_rto_clamped_to_lower_bound() {
        let mut rto = RtoEstimator::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(60),
        );
        rto.sample(Duration::from_millis(1));
        assert_eq!(rto.rto(), Duration::from_millis(200));
    }

    #[test]
    fn test_rto_converges() {
        let mut rto = RtoEstimator::new(
            Duration::from_secs(1),
            Duration::from_millis(1),
            Duration::from_secs(60),
        );
        for _ in 0..50 {
            rto.sample(Duration::from_millis(80));
        }
        let srtt = rto.srtt().unwrap();
        assert!(srtt.abs_diff(Duration::from_millis(80)) < Duration::from_millis(2));
        assert!(rto.rto() < Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_capped() {
        let mut rto = RtoEstimator::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(3),
        );
        rto.backoff();
        assert_eq!(rto.rto(), Duration::from_secs(2));
        rto.backoff();
        assert_eq!(rto.rto(), Duration::from_secs(3));
        rto.backoff();
        assert_eq!(rto.rto(), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_reset_restores_estimate() {
        let mut rto = RtoEstimator::new(
            Duration::from_secs(1),
            Duration::from_millis(200),
            Duration::from_secs(60),
        );
        rto.sample(Duration::from_millis(100));
        for _ in 0..10 {
            rto.backoff();
        }
        assert_eq!(rto.rto(), Duration::from_secs(60));
        rto.reset_backoff();
        assert_eq!(rto.rto(), Duration::from_millis(300));
    }
}
