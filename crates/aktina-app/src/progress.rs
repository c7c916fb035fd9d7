//! Blended progress reporting: the running maximum of real pipeline
//! checkpoints and a synthetic estimate that trickles forward while a long
//! archive call is in flight.
//!
//! The synthetic value is a pure function of (last real checkpoint, next
//! real checkpoint, elapsed time since the last real signal), so the whole
//! model is testable with a manual clock. Nudges fire on a schedule with
//! linearly increasing delays; each nudge closes half of the remaining gap
//! to the next checkpoint and the estimate is additionally capped just
//! below it, so resumed real progress always lands at or above the
//! reported value.

use std::time::Duration;

use tokio::time::Instant;

/// Time source seam. Production uses the monotonic system clock; tests
/// drive a manual one.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrickleConfig {
    /// Delay before the first synthetic nudge.
    pub initial_delay: Duration,
    /// Added to the gap between consecutive nudges, making the schedule
    /// linearly slower over time.
    pub delay_increment: Duration,
}

impl Default for TrickleConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            delay_increment: Duration::from_millis(250),
        }
    }
}

/// Fraction of the remaining gap each nudge closes.
const NUDGE_RATIO: f64 = 0.5;
/// The synthetic estimate stops this far short of the next checkpoint.
const CEILING_MARGIN: f64 = 1e-3;

/// Number of whole nudges that fit into `elapsed` under the linear
/// schedule: the k-th nudge fires after
/// `k * initial + increment * k * (k - 1) / 2` in total.
fn nudge_count(elapsed: Duration, cfg: &TrickleConfig) -> u32 {
    let mut fired = 0u32;
    let mut due = Duration::ZERO;
    loop {
        let next = cfg.initial_delay + cfg.delay_increment * fired;
        due = match due.checked_add(next) {
            Some(total) => total,
            None => return fired,
        };
        if due > elapsed || fired == u32::MAX {
            return fired;
        }
        fired += 1;
    }
}

/// Pure synthetic estimate after `nudges` nudges: approaches `ceiling`
/// geometrically from `real`, never reaching it.
fn synthetic_estimate(real: f64, ceiling: f64, nudges: u32) -> f64 {
    debug_assert!(ceiling >= real);
    let gap = (ceiling - real).max(0.0);
    if gap <= CEILING_MARGIN || nudges == 0 {
        return real;
    }
    let closed = gap * (1.0 - NUDGE_RATIO.powi(nudges.min(64) as i32));
    (real + closed).min(ceiling - CEILING_MARGIN)
}

/// Monotone progress gauge for a single pipeline run. `observe` feeds real
/// checkpoints; `sample` reads the blended value at the current instant.
/// The returned value never decreases and never overtakes a resumed real
/// signal.
pub struct ProgressGauge<C: Clock = SystemClock> {
    clock: C,
    cfg: TrickleConfig,
    reported: f64,
    real: f64,
    ceiling: f64,
    anchored_at: Instant,
}

impl ProgressGauge<SystemClock> {
    pub fn new(cfg: TrickleConfig) -> Self {
        Self::with_clock(cfg, SystemClock)
    }
}

impl<C: Clock> ProgressGauge<C> {
    pub fn with_clock(cfg: TrickleConfig, clock: C) -> Self {
        let anchored_at = clock.now();
        Self {
            clock,
            cfg,
            reported: 0.0,
            real: 0.0,
            ceiling: 0.0,
            anchored_at,
        }
    }

    /// Records a real checkpoint along with the fraction the next real
    /// signal will carry. Returns the new reported value when it advanced.
    pub fn observe(&mut self, fraction: f64, next_checkpoint: f64) -> Option<f64> {
        debug_assert!((0.0..=1.0).contains(&fraction));
        debug_assert!(next_checkpoint >= fraction);
        self.real = self.real.max(fraction);
        self.ceiling = next_checkpoint.clamp(self.real, 1.0);
        self.anchored_at = self.clock.now();
        self.advance_to(self.real)
    }

    /// Reads the synthetic estimate for the current instant. Returns the
    /// new reported value when the trickle moved it forward.
    pub fn sample(&mut self) -> Option<f64> {
        let elapsed = self.clock.now().saturating_duration_since(self.anchored_at);
        let nudges = nudge_count(elapsed, &self.cfg);
        let estimate = synthetic_estimate(self.real, self.ceiling, nudges);
        self.advance_to(estimate)
    }

    pub fn reported(&self) -> f64 {
        self.reported
    }

    fn advance_to(&mut self, candidate: f64) -> Option<f64> {
        if candidate > self.reported {
            self.reported = candidate;
            Some(self.reported)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().expect("clock lock");
            *now += by;
        }
    }

    impl Clock for &ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().expect("clock lock")
        }
    }

    fn config() -> TrickleConfig {
        TrickleConfig {
            initial_delay: Duration::from_millis(100),
            delay_increment: Duration::from_millis(100),
        }
    }

    #[test]
    fn nudge_schedule_slows_linearly() {
        let cfg = config();
        // Nudges land at 100ms, 300ms, 600ms, 1000ms, ...
        assert_eq!(nudge_count(Duration::from_millis(0), &cfg), 0);
        assert_eq!(nudge_count(Duration::from_millis(99), &cfg), 0);
        assert_eq!(nudge_count(Duration::from_millis(100), &cfg), 1);
        assert_eq!(nudge_count(Duration::from_millis(299), &cfg), 1);
        assert_eq!(nudge_count(Duration::from_millis(300), &cfg), 2);
        assert_eq!(nudge_count(Duration::from_millis(600), &cfg), 3);
        assert_eq!(nudge_count(Duration::from_millis(1000), &cfg), 4);
    }

    #[test]
    fn estimate_never_reaches_the_ceiling() {
        for nudges in 0..40 {
            let estimate = synthetic_estimate(0.25, 0.5, nudges);
            assert!(estimate >= 0.25);
            assert!(estimate < 0.5);
        }
    }

    #[test]
    fn sample_is_monotone_under_a_stalled_pipeline() {
        let clock = ManualClock::new();
        let mut gauge = ProgressGauge::with_clock(config(), &clock);
        gauge.observe(0.25, 0.5);

        let mut last = 0.25;
        for _ in 0..20 {
            clock.advance(Duration::from_millis(150));
            if let Some(value) = gauge.sample() {
                assert!(value > last);
                assert!(value < 0.5);
                last = value;
            }
        }
    }

    #[test]
    fn resumed_real_progress_lands_at_or_above_the_estimate() {
        let clock = ManualClock::new();
        let mut gauge = ProgressGauge::with_clock(config(), &clock);
        gauge.observe(0.25, 0.5);
        clock.advance(Duration::from_secs(30));
        let estimate = gauge.sample().expect("trickle advanced");
        assert!(estimate < 0.5);

        let resumed = gauge.observe(0.5, 0.75).expect("real signal advances");
        assert!(resumed >= estimate);
        assert_eq!(resumed, 0.5);
    }

    #[test]
    fn real_signal_resets_the_trickle_anchor() {
        let clock = ManualClock::new();
        let mut gauge = ProgressGauge::with_clock(config(), &clock);
        gauge.observe(0.1, 0.2);
        clock.advance(Duration::from_millis(250));
        assert!(gauge.sample().is_some());

        gauge.observe(0.2, 0.4);
        // No time has passed since the real signal, so no synthetic nudge.
        assert!(gauge.sample().is_none());
    }

    #[test]
    fn reported_value_never_decreases() {
        let clock = ManualClock::new();
        let mut gauge = ProgressGauge::with_clock(config(), &clock);
        assert_eq!(gauge.observe(0.5, 0.6), Some(0.5));
        assert_eq!(gauge.observe(0.3, 0.6), None);
        assert_eq!(gauge.reported(), 0.5);
    }

    #[test]
    fn zero_gap_produces_no_synthetic_motion() {
        let clock = ManualClock::new();
        let mut gauge = ProgressGauge::with_clock(config(), &clock);
        gauge.observe(1.0, 1.0);
        clock.advance(Duration::from_secs(60));
        assert!(gauge.sample().is_none());
        assert_eq!(gauge.reported(), 1.0);
    }
}
