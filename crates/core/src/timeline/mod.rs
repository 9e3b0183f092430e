use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::config::TimingConfig;

#[derive(Debug)]
struct PauseLedger {
    origin: Instant,
    paused_at: Option<Instant>,
    total_paused: Duration,
}

impl PauseLedger {
    fn starting_now() -> Self {
        Self {
            origin: Instant::now(),
            paused_at: None,
            total_paused: Duration::ZERO,
        }
    }

    fn elapsed_at(&self, now: Instant) -> Duration {
        let frozen_for = self
            .paused_at
            .map(|paused_at| now.saturating_duration_since(paused_at))
            .unwrap_or_default();
        now.saturating_duration_since(self.origin)
            .saturating_sub(self.total_paused + frozen_for)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitOutcome {
    /// The target was reached; `error_ms` is how late the wait returned.
    Reached { error_ms: f64 },
    /// The cancel predicate fired first.
    Interrupted,
}

/// Monotonic show clock that excludes paused time.
///
/// Waits sleep in slices no longer than the poll interval while the target
/// is far away and spin for the last stretch, so cancellation is observed
/// within one poll interval and dispatch lands within a few hundred
/// microseconds of the target.
#[derive(Debug)]
pub struct ExecutionClock {
    ledger: Mutex<PauseLedger>,
    spin_threshold: Duration,
    sleep_margin: Duration,
    poll_interval: Duration,
}

impl ExecutionClock {
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            ledger: Mutex::new(PauseLedger::starting_now()),
            spin_threshold: Duration::from_micros(config.spin_threshold_us),
            sleep_margin: Duration::from_micros(config.sleep_margin_us),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Moves the origin to now and forgets any pauses.
    pub fn restart(&self) {
        *self.ledger() = PauseLedger::starting_now();
    }

    pub fn elapsed(&self) -> Duration {
        self.ledger().elapsed_at(Instant::now())
    }

    /// Freezes elapsed time. Returns false if already paused.
    pub fn pause(&self) -> bool {
        let mut ledger = self.ledger();
        if ledger.paused_at.is_some() {
            return false;
        }
        ledger.paused_at = Some(Instant::now());
        true
    }

    /// Returns false if the clock was not paused.
    pub fn resume(&self) -> bool {
        let mut ledger = self.ledger();
        match ledger.paused_at.take() {
            Some(paused_at) => {
                ledger.total_paused += paused_at.elapsed();
                true
            }
            None => false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.ledger().paused_at.is_some()
    }

    pub fn total_paused(&self) -> Duration {
        let ledger = self.ledger();
        let current = ledger
            .paused_at
            .map(|paused_at| paused_at.elapsed())
            .unwrap_or_default();
        ledger.total_paused + current
    }

    /// Blocks until show time reaches `target` or `cancel` returns true.
    ///
    /// Time spent paused does not count toward the target.
    pub fn wait_until(&self, target: Duration, cancel: &dyn Fn() -> bool) -> WaitOutcome {
        loop {
            if cancel() {
                return WaitOutcome::Interrupted;
            }
            if self.is_paused() {
                thread::sleep(self.poll_interval);
                continue;
            }
            let now = self.elapsed();
            if now >= target {
                return WaitOutcome::Reached {
                    error_ms: millis(now - target),
                };
            }
            self.pace(target - now);
        }
    }

    /// Blocks until the wall deadline, ignoring pauses.
    pub fn wait_for_instant(&self, deadline: Instant, cancel: &dyn Fn() -> bool) -> WaitOutcome {
        loop {
            if cancel() {
                return WaitOutcome::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Reached {
                    error_ms: millis(now - deadline),
                };
            }
            self.pace(deadline - now);
        }
    }

    fn pace(&self, remaining: Duration) {
        if remaining > self.spin_threshold {
            let slice = remaining
                .saturating_sub(self.sleep_margin)
                .min(self.poll_interval);
            if !slice.is_zero() {
                thread::sleep(slice);
                return;
            }
        }
        std::hint::spin_loop();
    }

    fn ledger(&self) -> MutexGuard<'_, PauseLedger> {
        // The ledger holds plain values; a poisoned lock is still consistent.
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ExecutionClock {
    fn default() -> Self {
        Self::new(&TimingConfig::default())
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Dispatch lateness across a show.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub average_error_ms: f64,
    pub max_error_ms: f64,
    pub total_cues: usize,
    #[serde(skip)]
    sum_error_ms: f64,
}

impl TimingStats {
    pub fn record(&mut self, error_ms: f64) {
        self.total_cues += 1;
        self.sum_error_ms += error_ms;
        self.max_error_ms = self.max_error_ms.max(error_ms);
        self.average_error_ms = self.sum_error_ms / self.total_cues as f64;
    }
}
