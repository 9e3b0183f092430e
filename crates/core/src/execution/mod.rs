//! Timed show execution on top of the safety interlock.
//!
//! `execute()` blocks the calling thread for the length of the show. Other
//! threads steer it through a [`ShowHandle`]. Only one cue is ever in flight
//! and the clock wait is the only suspension point inside the loop.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::{
    config::{AppConfig, SafetyConfig, TimingConfig},
    cue::CueValidator,
    events::EventBus,
    protocol::Metadata,
    timeline::{ExecutionClock, TimingStats, WaitOutcome},
    AddressMapper, ChainState, Cue, CuePlan, OutputAddress, PacketCodec, Result,
    SafetyInterlock, SafetyState, ShiftRegisterEncoder, ShowError, Transport, ValidationError,
};

/// Health of the control link as seen by the execution loop.
pub trait LinkHealth: Send + Sync {
    fn is_healthy(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowState {
    Idle,
    Running,
    Paused,
    Completed,
    Aborted,
    Error,
}

impl ShowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Error)
    }
}

impl fmt::Display for ShowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CueResult {
    pub cue_id: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: f64,
    pub timing_error_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShowProgress {
    pub total_cues: usize,
    pub completed_cues: usize,
    pub current_cue_id: Option<String>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
    pub state: ShowState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShowEvent {
    StateChanged(ShowState),
    CueExecuted(CueResult),
    Progress(ShowProgress),
    Aborted { reason: String },
}

/// Outcome of one `execute()` call. Produced for aborted shows too.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub state: ShowState,
    pub total_cues: usize,
    pub executed_cues: usize,
    pub successful_cues: usize,
    pub failed_cues: usize,
    /// Show time, pauses excluded.
    pub duration_ms: f64,
    pub paused_ms: f64,
    pub timing: TimingStats,
    pub abort_reason: Option<String>,
    pub results: Vec<CueResult>,
}

impl ExecutionSummary {
    fn new(total_cues: usize) -> Self {
        Self {
            state: ShowState::Running,
            total_cues,
            executed_cues: 0,
            successful_cues: 0,
            failed_cues: 0,
            duration_ms: 0.0,
            paused_ms: 0.0,
            timing: TimingStats::default(),
            abort_reason: None,
            results: Vec::new(),
        }
    }

    fn record(&mut self, result: CueResult) {
        self.executed_cues += 1;
        if result.success {
            self.successful_cues += 1;
        } else {
            self.failed_cues += 1;
        }
        self.results.push(result);
    }
}

#[derive(Debug, Default)]
struct ProgressCounters {
    total: usize,
    completed: usize,
    current_cue_id: Option<String>,
}

struct Shared {
    state: Mutex<ShowState>,
    gate: Condvar,
    abort: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    progress: Mutex<ProgressCounters>,
    clock: ExecutionClock,
    interlock: Arc<SafetyInterlock>,
    events: EventBus<ShowEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ShowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, to: ShowState) {
        let mut state = self.state();
        if *state == to {
            return;
        }
        *state = to;
        drop(state);
        self.gate.notify_all();
        tracing::debug!(%to, "show state changed");
        self.events.publish(ShowEvent::StateChanged(to));
    }

    fn cancelled(&self) -> bool {
        self.abort.load(Ordering::Acquire) || self.interlock.is_aborted()
    }

    fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .or_else(|| self.interlock.abort_reason())
    }

    fn abort(&self, reason: &str) {
        self.stop(reason, ShowState::Aborted);
    }

    /// Forces the rig safe and ends the show in `terminal`.
    fn stop(&self, reason: &str, terminal: ShowState) {
        {
            let mut stored = self
                .abort_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if stored.is_none() {
                *stored = Some(reason.to_string());
            }
        }
        self.abort.store(true, Ordering::Release);
        self.interlock.emergency_abort(reason);
        self.set_state(terminal);
        self.events.publish(ShowEvent::Aborted {
            reason: reason.to_string(),
        });
    }

    /// Blocks while paused. Returns false once the show is cancelled.
    fn pass_gate(&self) -> bool {
        let mut state = self.state();
        while *state == ShowState::Paused && !self.cancelled() {
            state = self
                .gate
                .wait_timeout(state, self.clock.poll_interval())
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        !self.cancelled()
    }

    fn progress(&self) -> ShowProgress {
        let counters = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = self.clock.elapsed();
        let estimated_remaining_ms = (counters.completed > 0).then(|| {
            let per_cue = elapsed.as_secs_f64() * 1000.0 / counters.completed as f64;
            (per_cue * (counters.total - counters.completed) as f64) as u64
        });
        ShowProgress {
            total_cues: counters.total,
            completed_cues: counters.completed,
            current_cue_id: counters.current_cue_id.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
            estimated_remaining_ms,
            state: *self.state(),
        }
    }

    fn update_progress(&self, update: impl FnOnce(&mut ProgressCounters)) {
        update(&mut self.progress.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Cloneable control surface for a running show.
#[derive(Clone)]
pub struct ShowHandle {
    shared: Arc<Shared>,
}

impl ShowHandle {
    pub fn state(&self) -> ShowState {
        *self.shared.state()
    }

    pub fn progress(&self) -> ShowProgress {
        self.shared.progress()
    }

    pub fn events(&self) -> &EventBus<ShowEvent> {
        &self.shared.events
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.shared.state();
        if *state != ShowState::Running {
            return Err(ShowError::invalid_state("pause", *state));
        }
        self.shared.interlock.pause()?;
        *state = ShowState::Paused;
        self.shared.clock.pause();
        drop(state);

        tracing::info!("show paused");
        self.shared
            .events
            .publish(ShowEvent::StateChanged(ShowState::Paused));
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.shared.state();
        if *state != ShowState::Paused {
            return Err(ShowError::invalid_state("resume", *state));
        }
        self.shared.interlock.resume()?;
        *state = ShowState::Running;
        self.shared.clock.resume();
        drop(state);

        self.shared.gate.notify_all();
        tracing::info!("show resumed");
        self.shared
            .events
            .publish(ShowEvent::StateChanged(ShowState::Running));
        Ok(())
    }

    /// Stops the show and forces the interlock into its safe state.
    pub fn abort(&self, reason: &str) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ShowError::invalid_state("abort", state));
        }
        tracing::warn!(reason, "show abort requested");
        self.shared.abort(reason);
        Ok(())
    }
}

impl fmt::Debug for ShowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShowHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// One step of a test-fire pulse schedule.
#[derive(Debug)]
struct PulseStep {
    at: Duration,
    outputs: Vec<u32>,
    energize: bool,
}

pub struct ShowExecutionManager {
    timing: TimingConfig,
    safety: SafetyConfig,
    mapper: AddressMapper,
    encoder: ShiftRegisterEncoder,
    codec: Arc<PacketCodec>,
    validator: CueValidator,
    interlock: Arc<SafetyInterlock>,
    link: Option<Arc<dyn LinkHealth>>,
    plan: Option<CuePlan>,
    active_pulses: Mutex<HashMap<u32, Instant>>,
    shared: Arc<Shared>,
}

impl ShowExecutionManager {
    pub fn new(config: &AppConfig, transport: Arc<dyn Transport>) -> Self {
        let mapper = AddressMapper::from_config(&config.hardware);
        let registers = config.hardware.registers_per_chain;
        let codec = Arc::new(PacketCodec::with_limits(
            registers,
            config.safety.max_packet_age_secs,
            config.safety.max_packet_future_secs,
        ));
        let interlock = Arc::new(SafetyInterlock::new(mapper, Arc::clone(&codec), transport));

        Self {
            timing: config.timing.clone(),
            safety: config.safety.clone(),
            mapper,
            encoder: ShiftRegisterEncoder::new(registers),
            codec,
            validator: CueValidator::new(mapper, config.safety.max_simultaneous_outputs),
            link: None,
            plan: None,
            active_pulses: Mutex::new(HashMap::new()),
            shared: Arc::new(Shared {
                state: Mutex::new(ShowState::Idle),
                gate: Condvar::new(),
                abort: AtomicBool::new(false),
                abort_reason: Mutex::new(None),
                progress: Mutex::new(ProgressCounters::default()),
                clock: ExecutionClock::new(&config.timing),
                interlock: Arc::clone(&interlock),
                events: EventBus::new(),
            }),
            interlock,
        }
    }

    /// Consults `link` before every cue; an unhealthy link aborts the show.
    pub fn with_link_health(mut self, link: Arc<dyn LinkHealth>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn interlock(&self) -> &Arc<SafetyInterlock> {
        &self.interlock
    }

    pub fn codec(&self) -> &Arc<PacketCodec> {
        &self.codec
    }

    pub fn validator(&self) -> &CueValidator {
        &self.validator
    }

    pub fn handle(&self) -> ShowHandle {
        ShowHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> ShowState {
        *self.shared.state()
    }

    pub fn plan(&self) -> Option<&CuePlan> {
        self.plan.as_ref()
    }

    /// Validates and stores a show. The whole list is rejected on any bad cue.
    pub fn load(&mut self, cues: Vec<Cue>) -> Result<()> {
        let plan = CuePlan::new(cues, &self.validator, self.safety.max_cues)?;
        self.install(plan)
    }

    /// Loads a show document, sorting it by time first.
    pub fn load_show(&mut self, json: &str) -> Result<()> {
        let plan = CuePlan::parse_show(
            json,
            &self.validator,
            self.safety.max_cues,
            self.safety.default_pulse_duration_ms,
        )?;
        self.install(plan)
    }

    pub fn load_show_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let plan = CuePlan::from_file(
            path,
            &self.validator,
            self.safety.max_cues,
            self.safety.default_pulse_duration_ms,
        )?;
        self.install(plan)
    }

    fn install(&mut self, plan: CuePlan) -> Result<()> {
        let state = self.state();
        if matches!(state, ShowState::Running | ShowState::Paused) {
            return Err(ShowError::invalid_state("load a show", state));
        }
        tracing::info!(
            cues = plan.len(),
            duration_ms = plan.duration_ms(),
            "show loaded"
        );
        self.plan = Some(plan);
        self.shared.set_state(ShowState::Idle);
        Ok(())
    }

    /// Runs the loaded show to completion or abort on the calling thread.
    ///
    /// Returns `Err` only when the show could not start. A show that aborts
    /// part way still yields a summary.
    pub fn execute(&self) -> Result<ExecutionSummary> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| ShowError::NotReady("no show loaded".to_string()))?;
        let state = self.state();
        if state != ShowState::Idle {
            return Err(ShowError::invalid_state("execute", state));
        }
        self.interlock.begin_execution()?;

        self.shared.abort.store(false, Ordering::Release);
        *self
            .shared
            .abort_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.update_progress(|progress| {
            *progress = ProgressCounters {
                total: plan.len(),
                ..ProgressCounters::default()
            }
        });
        let mut summary = ExecutionSummary::new(plan.len());

        tracing::info!(cues = plan.len(), "show execution started");
        let outcome = self.send_clear_frames();
        self.shared.clock.restart();
        self.shared.set_state(ShowState::Running);
        let reporter = self.spawn_progress_reporter();

        let outcome = outcome.and_then(|()| self.run_cues(plan.cues(), &mut summary));
        if let Err(err) = outcome {
            tracing::error!(%err, "show execution failed");
            // protocol and link faults are expected escalations, anything
            // else is an engine error
            let terminal = if err.is_fatal() || matches!(err, ShowError::Protocol(_)) {
                ShowState::Aborted
            } else {
                ShowState::Error
            };
            self.shared.stop(&err.to_string(), terminal);
        }

        if let Some((stop, handle)) = reporter {
            drop(stop);
            if handle.join().is_err() {
                tracing::error!("progress reporter panicked");
            }
        }
        self.finish(summary)
    }

    fn finish(&self, mut summary: ExecutionSummary) -> Result<ExecutionSummary> {
        if !self.shared.cancelled() && self.interlock.complete().is_ok() {
            self.shared.set_state(ShowState::Completed);
        } else {
            if !self.state().is_terminal() {
                // aborted from outside the manager, e.g. the watchdog
                self.shared.set_state(ShowState::Aborted);
            }
            summary.abort_reason = self.shared.abort_reason();
        }

        summary.state = self.state();
        summary.duration_ms = self.shared.clock.elapsed().as_secs_f64() * 1000.0;
        summary.paused_ms = self.shared.clock.total_paused().as_secs_f64() * 1000.0;
        self.shared
            .events
            .publish(ShowEvent::Progress(self.shared.progress()));

        tracing::info!(
            state = %summary.state,
            executed = summary.executed_cues,
            successful = summary.successful_cues,
            failed = summary.failed_cues,
            average_error_ms = summary.timing.average_error_ms,
            max_error_ms = summary.timing.max_error_ms,
            "show execution finished"
        );
        Ok(summary)
    }

    fn run_cues(&self, cues: &[Cue], summary: &mut ExecutionSummary) -> Result<()> {
        for cue in cues {
            if !self.shared.pass_gate() {
                return Ok(());
            }
            if let Some(link) = &self.link {
                if !link.is_healthy() {
                    tracing::error!(cue = cue.id(), "control link unhealthy, aborting show");
                    self.shared.abort("connection lost");
                    return Ok(());
                }
            }

            self.shared
                .update_progress(|progress| progress.current_cue_id = Some(cue.id().to_string()));
            let result = match self.run_cue(cue) {
                Ok(Some(result)) => result,
                Ok(None) => return Ok(()),
                Err(err) => {
                    let result = CueResult {
                        cue_id: cue.id().to_string(),
                        success: false,
                        message: err.to_string(),
                        duration_ms: 0.0,
                        timing_error_ms: 0.0,
                    };
                    self.shared.events.publish(ShowEvent::CueExecuted(result.clone()));
                    summary.record(result);
                    return Err(err);
                }
            };

            summary.timing.record(result.timing_error_ms);
            if result.timing_error_ms > self.timing.late_threshold_ms as f64 {
                tracing::warn!(
                    cue = cue.id(),
                    error_ms = result.timing_error_ms,
                    "cue dispatched late"
                );
            }
            self.shared.update_progress(|progress| progress.completed += 1);
            self.shared.events.publish(ShowEvent::CueExecuted(result.clone()));
            summary.record(result);
        }
        Ok(())
    }

    /// Fires every tick of `cue`. `None` means the show was cancelled.
    fn run_cue(&self, cue: &Cue) -> Result<Option<CueResult>> {
        let mut first_error_ms = None;
        let mut started = None;
        for tick in cue.ticks() {
            let target = Duration::from_millis(cue.target_time_ms() + tick.offset_ms);
            let Some(error_ms) = self.wait_and_fire(cue, target, &tick.outputs)? else {
                return Ok(None);
            };
            first_error_ms.get_or_insert(error_ms);
            started.get_or_insert_with(Instant::now);
        }

        let duration_ms = started
            .map(|started| started.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or_default();
        tracing::debug!(cue = cue.id(), kind = %cue.kind(), "cue executed");
        Ok(Some(CueResult {
            cue_id: cue.id().to_string(),
            success: true,
            message: format!("{} executed", cue.kind()),
            duration_ms,
            timing_error_ms: first_error_ms.unwrap_or_default(),
        }))
    }

    fn wait_and_fire(&self, cue: &Cue, target: Duration, outputs: &[u32]) -> Result<Option<f64>> {
        let cancelled = || self.shared.cancelled();
        loop {
            if !self.shared.pass_gate() {
                return Ok(None);
            }
            let error_ms = match self.shared.clock.wait_until(target, &cancelled) {
                WaitOutcome::Interrupted => return Ok(None),
                WaitOutcome::Reached { error_ms } => error_ms,
            };
            match self.apply(cue, outputs, true) {
                Err(ShowError::InvalidState { .. })
                    if self.interlock.state() == SafetyState::Paused =>
                {
                    continue
                }
                Err(_) if self.shared.cancelled() => return Ok(None),
                Err(err) => return Err(err),
                Ok(()) => return Ok(Some(error_ms)),
            }
        }
    }

    /// Sets (or clears) `outputs`, then encodes, verifies and dispatches a
    /// frame for every chain touched. The chain state is only updated once
    /// every packet passed validation.
    fn apply(&self, cue: &Cue, outputs: &[u32], energize: bool) -> Result<()> {
        let addresses = outputs
            .iter()
            .map(|output| self.mapper.to_address(*output))
            .collect::<Result<Vec<OutputAddress>>>()?;
        let chains: BTreeSet<usize> = addresses.iter().map(|address| address.chain).collect();

        self.interlock.with_chains(|state, transport| {
            let mut next: ChainState = state.clone();
            for address in &addresses {
                if energize {
                    next.set(*address)?;
                } else {
                    next.clear(*address)?;
                }
            }

            let mut packets = Vec::with_capacity(chains.len());
            for &chain in &chains {
                let payload = self.encoder.encode(&next, chain)?;
                let packet = self
                    .codec
                    .build("cue", payload, cue_metadata(cue, chain, outputs.len()));
                self.codec.validate(&packet)?;
                packets.push((chain, packet));
            }
            for (chain, packet) in &packets {
                transport.dispatch(*chain, packet)?;
            }
            *state = next;
            Ok(())
        })
    }

    fn send_clear_frames(&self) -> Result<()> {
        self.interlock.with_chains(|state, transport| {
            for chain in 0..state.num_chains() {
                transport.dispatch(chain, &self.codec.emergency_stop())?;
            }
            Ok(())
        })
    }

    fn spawn_progress_reporter(
        &self,
    ) -> Option<(channel::Sender<()>, thread::JoinHandle<()>)> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let shared = Arc::clone(&self.shared);
        let interval = Duration::from_millis(self.timing.progress_interval_ms.max(1));
        let spawned = thread::Builder::new()
            .name("show-progress".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let progress = shared.progress();
                        tracing::info!(
                            completed = progress.completed_cues,
                            total = progress.total_cues,
                            elapsed_ms = progress.elapsed_ms,
                            "show progress"
                        );
                        shared.events.publish(ShowEvent::Progress(progress));
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        match spawned {
            Ok(handle) => Some((stop_tx, handle)),
            Err(err) => {
                tracing::warn!(%err, "could not start progress reporter");
                None
            }
        }
    }

    /// Test-fires one cue: each tick's outputs are held for the cue's pulse
    /// duration and then cleared. Requires an armed, idle system.
    pub fn execute_single_cue(&self, cue: &Cue) -> Result<CueResult> {
        self.validator.validate(cue)?;
        let state = self.state();
        if matches!(state, ShowState::Running | ShowState::Paused) {
            return Err(ShowError::invalid_state("test fire", state));
        }

        let pulse = Duration::from_millis(u64::from(cue.pulse_duration_ms()));
        let busy_until = Instant::now() + Duration::from_millis(cue.span_ms()) + pulse;
        self.reserve_outputs(cue, busy_until)?;

        let outcome = self.interlock.begin_execution().and_then(|()| {
            let outcome = self.run_pulses(cue, pulse);
            if !self.interlock.is_aborted() {
                self.interlock.release_to_armed()?;
            }
            outcome
        });
        self.release_reservation(cue);

        match outcome {
            Ok(result) => {
                tracing::info!(cue = cue.id(), kind = %cue.kind(), "test fire complete");
                Ok(result)
            }
            Err(err) => {
                if err.is_fatal() || matches!(err, ShowError::Protocol(_)) {
                    self.interlock.emergency_abort(&err.to_string());
                }
                Err(err)
            }
        }
    }

    fn run_pulses(&self, cue: &Cue, pulse: Duration) -> Result<CueResult> {
        let mut steps = Vec::new();
        for tick in cue.ticks() {
            let at = Duration::from_millis(tick.offset_ms);
            steps.push(PulseStep {
                at: at + pulse,
                outputs: tick.outputs.clone(),
                energize: false,
            });
            steps.push(PulseStep {
                at,
                outputs: tick.outputs,
                energize: true,
            });
        }
        // clears sort ahead of sets due at the same instant
        steps.sort_by_key(|step| (step.at, step.energize));

        let started = Instant::now();
        let cancelled = || self.interlock.is_aborted();
        for step in &steps {
            if let WaitOutcome::Interrupted =
                self.shared.clock.wait_for_instant(started + step.at, &cancelled)
            {
                return Err(ShowError::msg("test fire interrupted by abort"));
            }
            self.apply(cue, &step.outputs, step.energize)?;
        }

        Ok(CueResult {
            cue_id: cue.id().to_string(),
            success: true,
            message: format!("{} test fire complete", cue.kind()),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            timing_error_ms: 0.0,
        })
    }

    fn reserve_outputs(&self, cue: &Cue, busy_until: Instant) -> Result<()> {
        let mut pulses = self
            .active_pulses
            .lock()
            .map_err(|_| ShowError::msg("active pulse table has been poisoned"))?;
        let now = Instant::now();
        pulses.retain(|_, until| *until > now);

        let outputs = cue.outputs();
        if let Some(output) = outputs.iter().find(|output| pulses.contains_key(output)) {
            return Err(ValidationError::OutputActive {
                cue: cue.id().to_string(),
                output: *output,
            }
            .into());
        }
        for output in outputs {
            pulses.insert(output, busy_until);
        }
        Ok(())
    }

    fn release_reservation(&self, cue: &Cue) {
        if let Ok(mut pulses) = self.active_pulses.lock() {
            for output in cue.outputs() {
                pulses.remove(&output);
            }
        }
    }

    /// Turns every output off after a show has finished.
    pub fn release_outputs(&self) -> Result<()> {
        let state = self.state();
        if matches!(state, ShowState::Running | ShowState::Paused) {
            return Err(ShowError::invalid_state("release outputs", state));
        }
        self.interlock.clear_all_outputs()?;
        if let Ok(mut pulses) = self.active_pulses.lock() {
            pulses.clear();
        }
        Ok(())
    }
}

fn cue_metadata(cue: &Cue, chain: usize, output_count: usize) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("command_type".into(), "CUE_EXECUTION".into());
    metadata.insert("cue_id".into(), cue.id().into());
    metadata.insert("cue_type".into(), cue.kind().label().into());
    metadata.insert("chain".into(), chain.into());
    metadata.insert("output_count".into(), output_count.into());
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WatchdogConfig,
        watchdog::{HealthCheck, WatchdogTimer},
        SimulatedTransport,
    };

    fn manager_with(config: AppConfig) -> (ShowExecutionManager, SimulatedTransport) {
        let transport = SimulatedTransport::new();
        let manager = ShowExecutionManager::new(&config, Arc::new(transport.clone()));
        (manager, transport)
    }

    fn armed_manager() -> (ShowExecutionManager, SimulatedTransport) {
        let (manager, transport) = manager_with(AppConfig::default());
        manager.interlock().set_outputs_enabled(true).unwrap();
        manager.interlock().arm().unwrap();
        (manager, transport)
    }

    fn cue_frames(transport: &SimulatedTransport) -> usize {
        transport
            .frames()
            .iter()
            .filter(|frame| frame.packet.metadata["command_type"] == "CUE_EXECUTION")
            .count()
    }

    #[test]
    fn runs_a_show_end_to_end() {
        let (mut manager, transport) = armed_manager();
        manager
            .load(vec![
                Cue::single_shot("1", 0, 1),
                Cue::single_shot("2", 500, 2),
                Cue::single_shot("3", 1_000, 3),
            ])
            .unwrap();

        let summary = manager.execute().unwrap();

        assert_eq!(summary.state, ShowState::Completed);
        assert_eq!(summary.successful_cues, 3);
        assert_eq!(summary.failed_cues, 0);
        assert_eq!(summary.timing.total_cues, 3);
        assert!(summary.duration_ms >= 1_000.0);
        assert_eq!(manager.interlock().state(), SafetyState::Completed);

        let chains = manager.interlock().chain_snapshot().unwrap();
        assert_eq!(chains.active_bits(0), vec![0, 1, 2]);

        // chains are cleared before the first cue
        let frames = transport.frames();
        assert!(frames[..5]
            .iter()
            .all(|frame| frame.packet.payload.iter().all(|byte| *byte == 0)));
        assert_eq!(transport.last_payload(0).unwrap()[24], 0b1110_0000);
    }

    #[test]
    fn refuses_to_start_unless_armed() {
        let (mut manager, _) = manager_with(AppConfig::default());
        manager.load(vec![Cue::single_shot("1", 0, 1)]).unwrap();

        let err = manager.execute().unwrap_err();
        assert!(matches!(err, ShowError::NotReady(_)));
        assert_eq!(manager.state(), ShowState::Idle);
    }

    #[test]
    fn rejects_an_invalid_show_as_a_whole() {
        let (mut manager, _) = armed_manager();
        let err = manager
            .load(vec![Cue::single_shot("1", 0, 1), Cue::single_shot("2", 10, 1001)])
            .unwrap_err();
        assert!(matches!(err, ShowError::Validation(ValidationError::InShow { index: 1, .. })));
        assert!(manager.plan().is_none());
        assert!(matches!(
            manager.load(Vec::new()),
            Err(ShowError::Validation(ValidationError::EmptyShow))
        ));
    }

    #[test]
    fn double_shot_across_chains_dispatches_both() {
        let (mut manager, transport) = armed_manager();
        manager
            .load(vec![Cue::double_shot("1", 0, 1, 201)])
            .unwrap();
        manager.execute().unwrap();

        let frames: Vec<_> = transport
            .frames()
            .into_iter()
            .filter(|frame| frame.packet.metadata["command_type"] == "CUE_EXECUTION")
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].chain, 0);
        assert_eq!(frames[1].chain, 1);
        assert_eq!(transport.last_payload(0).unwrap()[24], 0x80);
        assert_eq!(transport.last_payload(1).unwrap()[24], 0x80);
    }

    #[test]
    fn pause_holds_cues_until_resumed() {
        let (mut manager, transport) = armed_manager();
        manager
            .load(vec![Cue::single_shot("1", 0, 1), Cue::single_shot("2", 300, 2)])
            .unwrap();
        let handle = manager.handle();
        let observer = transport.clone();

        let controller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.pause().unwrap();
            let at_pause = cue_frames(&observer);
            thread::sleep(Duration::from_millis(400));
            let before_resume = cue_frames(&observer);
            handle.resume().unwrap();
            (at_pause, before_resume)
        });

        let started = Instant::now();
        let summary = manager.execute().unwrap();
        let wall_ms = started.elapsed().as_secs_f64() * 1000.0;
        let (at_pause, before_resume) = controller.join().unwrap();

        assert_eq!(at_pause, 1);
        assert_eq!(before_resume, 1);
        assert_eq!(summary.state, ShowState::Completed);
        assert_eq!(summary.successful_cues, 2);
        assert!(summary.paused_ms >= 350.0);
        assert!(summary.duration_ms < wall_ms - 300.0);
    }

    #[test]
    fn abort_interrupts_a_long_wait() {
        let (mut manager, _) = armed_manager();
        manager.load(vec![Cue::single_shot("1", 5_000, 1)]).unwrap();
        let handle = manager.handle();

        let aborter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.abort("operator abort").unwrap();
        });

        let started = Instant::now();
        let summary = manager.execute().unwrap();
        aborter.join().unwrap();

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(summary.state, ShowState::Aborted);
        assert_eq!(summary.executed_cues, 0);
        assert_eq!(summary.abort_reason.as_deref(), Some("operator abort"));
        assert_eq!(manager.interlock().state(), SafetyState::Aborted);
        assert!(manager.handle().abort("again").is_err());
    }

    #[test]
    fn watchdog_trigger_aborts_the_show() {
        let (mut manager, _) = armed_manager();
        manager
            .load(vec![Cue::single_shot("1", 0, 1), Cue::single_shot("2", 2_000, 2)])
            .unwrap();
        let probe: Arc<dyn HealthCheck> = Arc::new(|| -> Result<()> { Ok(()) });
        let watchdog = Arc::new(WatchdogTimer::new(
            WatchdogConfig::default(),
            probe,
            manager.interlock().clone(),
        ));
        let manager = manager.with_link_health(watchdog.clone());

        let failing = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let start = Instant::now();
            for seconds in [0, 5, 10] {
                watchdog.record_check(false, Duration::ZERO, start + Duration::from_secs(seconds));
            }
        });

        let started = Instant::now();
        let summary = manager.execute().unwrap();
        failing.join().unwrap();

        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(summary.state, ShowState::Aborted);
        assert_eq!(summary.successful_cues, 1);
        assert!(summary
            .abort_reason
            .unwrap()
            .starts_with("watchdog timeout"));
        assert!(manager.interlock().chain_snapshot().unwrap().is_clear());
    }

    #[test]
    fn unhealthy_link_aborts_before_firing() {
        struct Down;
        impl LinkHealth for Down {
            fn is_healthy(&self) -> bool {
                false
            }
        }

        let (manager, transport) = armed_manager();
        let mut manager = manager.with_link_health(Arc::new(Down));
        manager.load(vec![Cue::single_shot("1", 0, 1)]).unwrap();

        let summary = manager.execute().unwrap();
        assert_eq!(summary.state, ShowState::Aborted);
        assert_eq!(summary.abort_reason.as_deref(), Some("connection lost"));
        assert_eq!(cue_frames(&transport), 0);
    }

    #[test]
    fn hardware_fault_aborts_the_show() {
        let (mut manager, transport) = armed_manager();
        manager.load(vec![Cue::single_shot("1", 0, 1)]).unwrap();
        transport.fail_dispatches("continuity check failed");

        let summary = manager.execute().unwrap();
        assert_eq!(summary.state, ShowState::Aborted);
        assert_eq!(
            summary.abort_reason.as_deref(),
            Some("hardware fault: continuity check failed")
        );
        assert_eq!(manager.interlock().state(), SafetyState::Aborted);
        assert_eq!(summary.executed_cues, 1);
        assert_eq!(summary.successful_cues, 0);
        assert_eq!(summary.failed_cues, 1);
        assert!(!summary.results[0].success);
        assert_eq!(summary.results[0].message, "hardware fault: continuity check failed");
    }

    #[test]
    fn invalid_packet_is_never_dispatched() {
        let mut config = AppConfig::default();
        // every freshly built packet is already too old
        config.safety.max_packet_age_secs = -1.0;
        let (mut manager, transport) = manager_with(config);
        manager.interlock().set_outputs_enabled(true).unwrap();
        manager.interlock().arm().unwrap();
        manager
            .load(vec![Cue::single_shot("1", 0, 1), Cue::single_shot("2", 50, 2)])
            .unwrap();
        let events = manager.handle().events().subscribe();

        let summary = manager.execute().unwrap();

        assert_eq!(summary.state, ShowState::Aborted);
        assert!(summary.abort_reason.unwrap().starts_with("packet is"));
        assert_eq!(summary.failed_cues, 1);
        assert_eq!(summary.successful_cues, 0);
        assert_eq!(cue_frames(&transport), 0);
        assert!(transport
            .frames()
            .iter()
            .all(|frame| frame.packet.payload.iter().all(|byte| *byte == 0)));
        assert!(events.try_iter().any(|event| matches!(
            event,
            ShowEvent::CueExecuted(CueResult { success: false, .. })
        )));
    }

    #[test]
    fn unexpected_engine_failure_ends_in_error() {
        struct ClosedBus;
        impl Transport for ClosedBus {
            fn dispatch(&self, _chain: usize, packet: &crate::ShiftRegisterPacket) -> Result<()> {
                if packet.metadata["command_type"] == "CUE_EXECUTION" {
                    Err(ShowError::msg("spi bus closed"))
                } else {
                    Ok(())
                }
            }

            fn apply_pins(&self, _pins: &crate::GpioState) -> Result<()> {
                Ok(())
            }
        }

        let mut manager = ShowExecutionManager::new(&AppConfig::default(), Arc::new(ClosedBus));
        manager.interlock().set_outputs_enabled(true).unwrap();
        manager.interlock().arm().unwrap();
        manager.load(vec![Cue::single_shot("1", 0, 1)]).unwrap();

        let summary = manager.execute().unwrap();

        assert_eq!(summary.state, ShowState::Error);
        assert_eq!(summary.abort_reason.as_deref(), Some("spi bus closed"));
        assert_eq!(summary.failed_cues, 1);
        assert_eq!(manager.interlock().state(), SafetyState::Aborted);
        assert!(manager.handle().abort("late").is_err());
    }

    #[test]
    fn run_cue_fires_outputs_in_sequence() {
        let (mut manager, transport) = armed_manager();
        manager
            .load(vec![Cue::single_run("run", 0, 9, 11, 20).unwrap()])
            .unwrap();
        let summary = manager.execute().unwrap();

        assert_eq!(summary.successful_cues, 1);
        assert_eq!(cue_frames(&transport), 3);
        let chains = manager.interlock().chain_snapshot().unwrap();
        assert_eq!(chains.active_bits(0), vec![8, 9, 10]);
        assert!(summary.results[0].duration_ms >= 35.0);
    }

    #[test]
    fn publishes_progress_on_a_cadence() {
        let mut config = AppConfig::default();
        config.timing.progress_interval_ms = 50;
        let (mut manager, _) = manager_with(config);
        manager.interlock().set_outputs_enabled(true).unwrap();
        manager.interlock().arm().unwrap();
        manager
            .load(vec![Cue::single_shot("a", 0, 1), Cue::single_shot("b", 250, 2)])
            .unwrap();
        let events = manager.handle().events().subscribe();

        manager.execute().unwrap();

        let progress: Vec<ShowProgress> = events
            .try_iter()
            .filter_map(|event| match event {
                ShowEvent::Progress(progress) => Some(progress),
                _ => None,
            })
            .collect();
        assert!(progress.len() >= 3);
        let last = progress.last().unwrap();
        assert_eq!(last.completed_cues, 2);
        assert_eq!(last.estimated_remaining_ms, Some(0));
        assert_eq!(last.state, ShowState::Completed);
    }

    #[test]
    fn test_fire_pulses_and_returns_to_armed() {
        let (manager, transport) = armed_manager();
        let cue = Cue::single_shot("t", 0, 5).with_pulse(30);

        let result = manager.execute_single_cue(&cue).unwrap();

        assert!(result.success);
        assert!(result.duration_ms >= 30.0);
        assert_eq!(manager.interlock().state(), SafetyState::Armed);
        assert!(manager.interlock().chain_snapshot().unwrap().is_clear());
        let payloads: Vec<u8> = transport
            .frames()
            .iter()
            .map(|frame| frame.packet.payload[24])
            .collect();
        assert_eq!(payloads, vec![0b0000_1000, 0]);
    }

    #[test]
    fn test_fire_rejects_outputs_still_pulsing() {
        let (manager, _) = armed_manager();
        let manager = Arc::new(manager);
        let firing = Arc::clone(&manager);
        let long = thread::spawn(move || {
            firing.execute_single_cue(&Cue::single_shot("long", 0, 7).with_pulse(300))
        });

        thread::sleep(Duration::from_millis(50));
        let err = manager
            .execute_single_cue(&Cue::single_shot("again", 0, 7).with_pulse(10))
            .unwrap_err();
        assert!(matches!(
            err,
            ShowError::Validation(ValidationError::OutputActive { output: 7, .. })
        ));
        assert!(long.join().unwrap().is_ok());
    }

    #[test]
    fn release_outputs_clears_after_the_show() {
        let (mut manager, transport) = armed_manager();
        manager.load(vec![Cue::single_shot("1", 0, 1)]).unwrap();
        manager.execute().unwrap();

        manager.release_outputs().unwrap();
        assert!(manager.interlock().chain_snapshot().unwrap().is_clear());
        assert_eq!(transport.last_payload(0), Some(vec![0; 25]));
    }
}
