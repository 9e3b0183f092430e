//! Periodic control-link probe that escalates sustained failure into an
//! emergency abort.
//!
//! A triggered watchdog stays triggered until [`WatchdogTimer::reset`]; it
//! fires the emergency stop at most once per episode.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::{
    config::WatchdogConfig, events::EventBus, execution::LinkHealth, protocol::unix_now,
    safety::EmergencyStop, Result, ShowError,
};

pub const EVENT_LOG_CAPACITY: usize = 100;

/// A single probe of the control link.
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> Result<()>;
}

impl<F> HealthCheck for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn check(&self) -> Result<()> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogStatus {
    Inactive,
    Active,
    Paused,
    Triggered,
}

impl fmt::Display for WatchdogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Triggered => "triggered",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogSignal {
    StatusChanged(WatchdogStatus),
    ConnectionLost,
    ConnectionRestored,
    TimeoutTriggered { reason: String },
    HealthCheckCompleted { success: bool, latency_ms: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogEvent {
    pub timestamp: f64,
    pub level: EventLevel,
    pub message: String,
    pub consecutive_failures: u32,
    pub total_checks: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchdogStats {
    pub status: WatchdogStatus,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub last_check: Option<f64>,
    pub last_success: Option<f64>,
    pub connection_lost_at: Option<f64>,
}

#[derive(Debug)]
struct Monitor {
    status: WatchdogStatus,
    total_checks: u64,
    successful_checks: u64,
    consecutive_failures: u32,
    first_failure: Option<Instant>,
    last_check: Option<f64>,
    last_success: Option<f64>,
    connection_lost_at: Option<f64>,
    log: VecDeque<WatchdogEvent>,
}

impl Monitor {
    fn new() -> Self {
        Self {
            status: WatchdogStatus::Inactive,
            total_checks: 0,
            successful_checks: 0,
            consecutive_failures: 0,
            first_failure: None,
            last_check: None,
            last_success: None,
            connection_lost_at: None,
            log: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 100.0;
        }
        self.successful_checks as f64 / self.total_checks as f64 * 100.0
    }

    fn log(&mut self, level: EventLevel, message: impl Into<String>) {
        if self.log.len() == EVENT_LOG_CAPACITY {
            self.log.pop_front();
        }
        let event = WatchdogEvent {
            timestamp: unix_now(),
            level,
            message: message.into(),
            consecutive_failures: self.consecutive_failures,
            total_checks: self.total_checks,
            success_rate: self.success_rate(),
        };
        self.log.push_back(event);
    }
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct WatchdogTimer {
    config: WatchdogConfig,
    probe: Arc<dyn HealthCheck>,
    stop: Arc<dyn EmergencyStop>,
    monitor: Mutex<Monitor>,
    paused: AtomicBool,
    events: EventBus<WatchdogSignal>,
    worker: Mutex<Option<Worker>>,
}

impl WatchdogTimer {
    /// Config values below their minimums are clamped.
    pub fn new(
        config: WatchdogConfig,
        probe: Arc<dyn HealthCheck>,
        stop: Arc<dyn EmergencyStop>,
    ) -> Self {
        Self {
            config: config.normalized(),
            probe,
            stop,
            monitor: Mutex::new(Monitor::new()),
            paused: AtomicBool::new(false),
            events: EventBus::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<WatchdogSignal> {
        &self.events
    }

    pub fn status(&self) -> WatchdogStatus {
        self.monitor().status
    }

    /// Spawns the probe thread. A no-op if it is already running.
    pub fn start_monitoring(self: &Arc<Self>) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| ShowError::msg("watchdog worker has been poisoned"))?;
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        // Dropping the last timer drops the stop sender, which ends the loop.
        let timer = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.check_interval_ms);
        let handle = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(timer) = timer.upgrade() else {
                            break;
                        };
                        if !timer.paused.load(Ordering::Acquire) {
                            timer.perform_check();
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
        drop(worker);

        self.paused.store(false, Ordering::Release);
        self.update_status(
            |status| status != WatchdogStatus::Triggered,
            WatchdogStatus::Active,
            "monitoring started",
        );
        tracing::info!(
            interval_ms = self.config.check_interval_ms,
            threshold_ms = self.config.timeout_threshold_ms,
            max_failures = self.config.max_consecutive_failures,
            "watchdog started"
        );
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            // A full channel or a gone receiver both mean the loop is ending.
            let _ = worker.stop.try_send(());
            if worker.handle.join().is_err() {
                tracing::error!("watchdog thread panicked");
            }
        }
        self.update_status(
            |status| status != WatchdogStatus::Triggered,
            WatchdogStatus::Inactive,
            "monitoring stopped",
        );
        tracing::info!("watchdog stopped");
    }

    pub fn pause_monitoring(&self) {
        self.paused.store(true, Ordering::Release);
        self.update_status(
            |status| status == WatchdogStatus::Active,
            WatchdogStatus::Paused,
            "monitoring paused",
        );
    }

    pub fn resume_monitoring(&self) {
        self.paused.store(false, Ordering::Release);
        self.update_status(
            |status| status == WatchdogStatus::Paused,
            WatchdogStatus::Active,
            "monitoring resumed",
        );
    }

    /// Runs the probe once and records the outcome.
    pub fn perform_check(&self) -> bool {
        let started = Instant::now();
        let outcome = self.probe.check();
        let latency = started.elapsed();
        if let Err(err) = &outcome {
            tracing::warn!(%err, "watchdog health check failed");
        }
        self.record_check(outcome.is_ok(), latency, Instant::now());
        outcome.is_ok()
    }

    /// Applies one probe result observed at `at`.
    pub fn record_check(&self, success: bool, latency: Duration, at: Instant) {
        let mut signals = vec![WatchdogSignal::HealthCheckCompleted {
            success,
            latency_ms: latency.as_secs_f64() * 1000.0,
        }];
        let mut trigger = None;

        let mut monitor = self.monitor();
        monitor.total_checks += 1;
        monitor.last_check = Some(unix_now());

        if success {
            monitor.successful_checks += 1;
            monitor.last_success = monitor.last_check;
            if monitor.consecutive_failures > 0 {
                let failures = monitor.consecutive_failures;
                monitor.consecutive_failures = 0;
                monitor.first_failure = None;
                monitor.log(
                    EventLevel::Info,
                    format!("connection restored after {failures} failed checks"),
                );
                tracing::info!(failures, "control link restored");
                signals.push(WatchdogSignal::ConnectionRestored);
            }
        } else {
            monitor.consecutive_failures += 1;
            if monitor.first_failure.is_none() {
                monitor.first_failure = Some(at);
                monitor.connection_lost_at = monitor.last_check;
                monitor.log(EventLevel::Warning, "connection lost");
                signals.push(WatchdogSignal::ConnectionLost);
            } else {
                let failures = monitor.consecutive_failures;
                monitor.log(EventLevel::Error, format!("health check failed ({failures} in a row)"));
            }

            let failing_for = monitor
                .first_failure
                .map(|first| at.saturating_duration_since(first))
                .unwrap_or_default();
            let threshold = Duration::from_millis(self.config.timeout_threshold_ms);
            if monitor.status != WatchdogStatus::Triggered
                && monitor.consecutive_failures >= self.config.max_consecutive_failures
                && failing_for >= threshold
            {
                let reason = format!(
                    "watchdog timeout: {} consecutive failed checks over {:.1}s",
                    monitor.consecutive_failures,
                    failing_for.as_secs_f64()
                );
                monitor.status = WatchdogStatus::Triggered;
                monitor.log(EventLevel::Critical, reason.clone());
                signals.push(WatchdogSignal::StatusChanged(WatchdogStatus::Triggered));
                signals.push(WatchdogSignal::TimeoutTriggered {
                    reason: reason.clone(),
                });
                trigger = Some(reason);
            }
        }
        drop(monitor);

        if let Some(reason) = trigger {
            tracing::error!(%reason, "WATCHDOG TRIGGERED: forcing emergency abort");
            self.stop.emergency_stop(&reason);
        }
        for signal in signals {
            self.events.publish(signal);
        }
    }

    /// Clears counters and re-arms the trigger.
    pub fn reset(&self) {
        let running = self
            .worker
            .lock()
            .map(|worker| worker.is_some())
            .unwrap_or(false);
        let status = match (running, self.paused.load(Ordering::Acquire)) {
            (false, _) => WatchdogStatus::Inactive,
            (true, true) => WatchdogStatus::Paused,
            (true, false) => WatchdogStatus::Active,
        };

        let mut monitor = self.monitor();
        let log = std::mem::take(&mut monitor.log);
        *monitor = Monitor::new();
        monitor.log = log;
        monitor.status = status;
        monitor.log(EventLevel::Info, "watchdog reset");
        drop(monitor);

        tracing::info!(%status, "watchdog reset");
        self.events.publish(WatchdogSignal::StatusChanged(status));
    }

    pub fn stats(&self) -> WatchdogStats {
        let monitor = self.monitor();
        WatchdogStats {
            status: monitor.status,
            total_checks: monitor.total_checks,
            successful_checks: monitor.successful_checks,
            failed_checks: monitor.total_checks - monitor.successful_checks,
            consecutive_failures: monitor.consecutive_failures,
            success_rate: monitor.success_rate(),
            last_check: monitor.last_check,
            last_success: monitor.last_success,
            connection_lost_at: monitor.connection_lost_at,
        }
    }

    pub fn event_log(&self) -> Vec<WatchdogEvent> {
        self.monitor().log.iter().cloned().collect()
    }

    fn update_status(
        &self,
        allowed: impl Fn(WatchdogStatus) -> bool,
        to: WatchdogStatus,
        message: &str,
    ) {
        let mut monitor = self.monitor();
        if !allowed(monitor.status) || monitor.status == to {
            return;
        }
        monitor.status = to;
        monitor.log(EventLevel::Info, message);
        drop(monitor);
        self.events.publish(WatchdogSignal::StatusChanged(to));
    }

    fn monitor(&self) -> MutexGuard<'_, Monitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LinkHealth for WatchdogTimer {
    /// Unhealthy once triggered or once the failure count reaches the limit.
    fn is_healthy(&self) -> bool {
        let monitor = self.monitor();
        monitor.status != WatchdogStatus::Triggered
            && monitor.consecutive_failures < self.config.max_consecutive_failures
    }
}
