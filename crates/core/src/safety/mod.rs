//! Arm/disarm state machine and the single gate every firing passes through.
//!
//! The interlock owns the [`ChainState`] for the active session. Firing,
//! pausing, completing and the emergency abort all take the same mutex, so a
//! watchdog abort that lands mid-cue waits for the in-flight dispatch to
//! finish and then clears everything.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use serde::{Deserialize, Serialize};

use crate::{
    events::EventBus, AddressMapper, ChainState, GpioState, PacketCodec, PinLevel, Result,
    ShowError, Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyState {
    Disarmed,
    Armed,
    Executing,
    Paused,
    Completed,
    Aborted,
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disarmed => "disarmed",
            Self::Armed => "armed",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterlockEvent {
    StateChanged { from: SafetyState, to: SafetyState },
    PinsChanged(GpioState),
    EmergencyAbort { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterlockStatus {
    pub state: SafetyState,
    pub outputs_enabled: bool,
    pub armed: bool,
    pub pins: BTreeMap<String, PinLevel>,
    pub abort_reason: Option<String>,
    pub active_outputs: usize,
}

/// Anything that can force the rig into its safe state.
pub trait EmergencyStop: Send + Sync {
    fn emergency_stop(&self, reason: &str);
}

struct Inner {
    state: SafetyState,
    outputs_enabled: bool,
    armed: bool,
    chains: ChainState,
    abort_reason: Option<String>,
}

impl Inner {
    fn pins(&self) -> GpioState {
        GpioState::for_state(self.chains.num_chains(), self.outputs_enabled, self.armed)
    }
}

pub struct SafetyInterlock {
    inner: Mutex<Inner>,
    aborted: AtomicBool,
    codec: Arc<PacketCodec>,
    transport: Arc<dyn Transport>,
    events: EventBus<InterlockEvent>,
}

impl SafetyInterlock {
    pub fn new(mapper: AddressMapper, codec: Arc<PacketCodec>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SafetyState::Disarmed,
                outputs_enabled: false,
                armed: false,
                chains: ChainState::for_mapper(&mapper),
                abort_reason: None,
            }),
            aborted: AtomicBool::new(false),
            codec,
            transport,
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<InterlockEvent> {
        &self.events
    }

    pub fn state(&self) -> SafetyState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(SafetyState::Aborted)
    }

    /// Lock-free check usable from spin loops.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.abort_reason.clone())
    }

    pub fn status(&self) -> Result<InterlockStatus> {
        let inner = self.lock()?;
        Ok(InterlockStatus {
            state: inner.state,
            outputs_enabled: inner.outputs_enabled,
            armed: inner.armed,
            pins: inner.pins().named_levels(),
            abort_reason: inner.abort_reason.clone(),
            active_outputs: inner.chains.active_count(),
        })
    }

    /// Copy of the current chain bits.
    pub fn chain_snapshot(&self) -> Result<ChainState> {
        Ok(self.lock()?.chains.clone())
    }

    /// Enables or disables the output drivers on every chain.
    ///
    /// Disabling while armed disarms; disabling while executing is an
    /// emergency abort.
    pub fn set_outputs_enabled(&self, enabled: bool) -> Result<SafetyState> {
        let mut inner = self.lock()?;
        match (enabled, inner.state) {
            (true, SafetyState::Aborted) => {
                return Err(ShowError::invalid_state("enable outputs", SafetyState::Aborted))
            }
            (false, SafetyState::Executing | SafetyState::Paused) => {
                drop(inner);
                self.emergency_abort("outputs disabled during execution");
                return Ok(SafetyState::Aborted);
            }
            _ => {}
        }

        let mut events = Vec::new();
        inner.outputs_enabled = enabled;
        if !enabled && inner.armed {
            inner.armed = false;
            if inner.state == SafetyState::Armed {
                events.push(Self::transition(&mut inner, SafetyState::Disarmed));
            }
        }
        let pins = inner.pins();
        self.transport.apply_pins(&pins)?;
        let state = inner.state;
        drop(inner);

        tracing::info!(enabled, %state, "output drivers updated");
        events.push(InterlockEvent::PinsChanged(pins));
        self.publish(events);
        Ok(state)
    }

    pub fn arm(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.outputs_enabled {
            return Err(ShowError::NotReady(
                "outputs must be enabled before arming".to_string(),
            ));
        }
        match inner.state {
            SafetyState::Armed => return Ok(()),
            SafetyState::Disarmed | SafetyState::Completed => {}
            other => return Err(ShowError::invalid_state("arm", other)),
        }

        inner.armed = true;
        let pins = inner.pins();
        self.transport.apply_pins(&pins)?;
        let event = Self::transition(&mut inner, SafetyState::Armed);
        drop(inner);

        tracing::info!("system armed");
        self.publish(vec![event, InterlockEvent::PinsChanged(pins)]);
        Ok(())
    }

    /// Disarming mid-show is treated as an emergency abort.
    pub fn disarm(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            SafetyState::Executing | SafetyState::Paused => {
                drop(inner);
                self.emergency_abort("disarmed during execution");
                return Ok(());
            }
            SafetyState::Aborted => return Ok(()),
            _ => {}
        }

        inner.armed = false;
        let pins = inner.pins();
        self.transport.apply_pins(&pins)?;
        let mut events = vec![InterlockEvent::PinsChanged(pins)];
        if inner.state != SafetyState::Disarmed {
            events.insert(0, Self::transition(&mut inner, SafetyState::Disarmed));
        }
        drop(inner);

        tracing::info!("system disarmed");
        self.publish(events);
        Ok(())
    }

    /// Hardware readiness checklist for starting an execution.
    pub fn readiness(&self) -> Result<()> {
        let inner = self.lock()?;
        Self::check_ready(&inner)
    }

    fn check_ready(inner: &Inner) -> Result<()> {
        if !inner.outputs_enabled {
            return Err(ShowError::NotReady("outputs not enabled".to_string()));
        }
        if !inner.armed {
            return Err(ShowError::NotReady("system not armed".to_string()));
        }
        match inner.state {
            SafetyState::Aborted => Err(ShowError::NotReady("system in aborted state".to_string())),
            SafetyState::Executing | SafetyState::Paused => {
                Err(ShowError::NotReady("system already executing".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Armed -> Executing, with a cleared chain state.
    pub fn begin_execution(&self) -> Result<()> {
        let mut inner = self.lock()?;
        Self::check_ready(&inner)?;
        if inner.state != SafetyState::Armed {
            return Err(ShowError::invalid_state("start execution", inner.state));
        }
        inner.chains.clear_all();
        let event = Self::transition(&mut inner, SafetyState::Executing);
        drop(inner);
        self.publish(vec![event]);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.move_between(SafetyState::Executing, SafetyState::Paused, "pause")
    }

    pub fn resume(&self) -> Result<()> {
        self.move_between(SafetyState::Paused, SafetyState::Executing, "resume")
    }

    /// Executing/Paused -> Completed. Chain bits are left as they are.
    pub fn complete(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            SafetyState::Executing | SafetyState::Paused => {}
            other => return Err(ShowError::invalid_state("complete", other)),
        }
        let event = Self::transition(&mut inner, SafetyState::Completed);
        drop(inner);
        self.publish(vec![event]);
        Ok(())
    }

    /// Executing -> Armed, used after a single test fire.
    pub fn release_to_armed(&self) -> Result<()> {
        self.move_between(SafetyState::Executing, SafetyState::Armed, "return to armed")
    }

    /// Runs `fire` against the chain state while holding the interlock.
    ///
    /// Only permitted while executing. Whatever `fire` dispatches is atomic
    /// with respect to an emergency abort.
    pub fn with_chains<R>(
        &self,
        fire: impl FnOnce(&mut ChainState, &dyn Transport) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.lock()?;
        if inner.state != SafetyState::Executing {
            return Err(ShowError::invalid_state("fire outputs", inner.state));
        }
        fire(&mut inner.chains, self.transport.as_ref())
    }

    /// Clears every chain and sends all-zero frames. Allowed in any state.
    pub fn clear_all_outputs(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.chains.clear_all();
        for chain in 0..inner.chains.num_chains() {
            self.transport.dispatch(chain, &self.codec.emergency_stop())?;
        }
        tracing::info!("all outputs cleared");
        Ok(())
    }

    /// Clears the listed chains (serial-clear equivalent).
    pub fn clear_chains(&self, chains: &[usize]) -> Result<()> {
        let mut inner = self.lock()?;
        for &chain in chains {
            if chain >= inner.chains.num_chains() {
                return Err(ShowError::msg(format!("chain {chain} does not exist")));
            }
            inner.chains.clear_chain(chain);
            self.transport.dispatch(chain, &self.codec.emergency_stop())?;
        }
        tracing::info!(?chains, "chains cleared");
        Ok(())
    }

    /// Forces the safe state from anywhere. Never blocks on a precondition
    /// and never fails; transport errors are logged.
    pub fn emergency_abort(&self, reason: &str) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.aborted.store(true, Ordering::Release);

        let from = inner.state;
        inner.state = SafetyState::Aborted;
        inner.outputs_enabled = false;
        inner.armed = false;
        inner.chains.clear_all();
        if inner.abort_reason.is_none() {
            inner.abort_reason = Some(reason.to_string());
        }

        let pins = inner.pins();
        if let Err(err) = self.transport.apply_pins(&pins) {
            tracing::error!(%err, "failed to drive safe pin levels during abort");
        }
        for chain in 0..inner.chains.num_chains() {
            if let Err(err) = self.transport.dispatch(chain, &self.codec.emergency_stop()) {
                tracing::error!(chain, %err, "failed to send clear frame during abort");
            }
        }
        drop(inner);

        tracing::error!(reason, %from, "EMERGENCY ABORT: outputs disabled and disarmed");
        let mut events = vec![
            InterlockEvent::EmergencyAbort {
                reason: reason.to_string(),
            },
            InterlockEvent::PinsChanged(pins),
        ];
        if from != SafetyState::Aborted {
            events.insert(
                0,
                InterlockEvent::StateChanged {
                    from,
                    to: SafetyState::Aborted,
                },
            );
        }
        self.publish(events);
    }

    /// Aborted/Completed -> Disarmed. Outputs stay disabled after an abort.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.state {
            SafetyState::Aborted | SafetyState::Completed => {}
            SafetyState::Disarmed | SafetyState::Armed => return Ok(()),
            other => return Err(ShowError::invalid_state("reset", other)),
        }
        inner.armed = false;
        inner.abort_reason = None;
        inner.chains.clear_all();
        self.aborted.store(false, Ordering::Release);
        let event = Self::transition(&mut inner, SafetyState::Disarmed);
        drop(inner);

        tracing::info!("interlock reset");
        self.publish(vec![event]);
        Ok(())
    }

    fn move_between(&self, from: SafetyState, to: SafetyState, operation: &'static str) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state != from {
            return Err(ShowError::invalid_state(operation, inner.state));
        }
        let event = Self::transition(&mut inner, to);
        drop(inner);
        self.publish(vec![event]);
        Ok(())
    }

    fn transition(inner: &mut Inner, to: SafetyState) -> InterlockEvent {
        let from = inner.state;
        inner.state = to;
        tracing::debug!(%from, %to, "safety state transition");
        InterlockEvent::StateChanged { from, to }
    }

    fn publish(&self, events: Vec<InterlockEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ShowError::msg("safety interlock has been poisoned"))
    }
}

impl EmergencyStop for SafetyInterlock {
    fn emergency_stop(&self, reason: &str) {
        self.emergency_abort(reason);
    }
}

impl fmt::Debug for SafetyInterlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyInterlock")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedTransport;

    fn interlock() -> (SafetyInterlock, SimulatedTransport) {
        let transport = SimulatedTransport::new();
        let interlock = SafetyInterlock::new(
            AddressMapper::default(),
            Arc::new(PacketCodec::new(25)),
            Arc::new(transport.clone()),
        );
        (interlock, transport)
    }

    fn armed() -> (SafetyInterlock, SimulatedTransport) {
        let (interlock, transport) = interlock();
        interlock.set_outputs_enabled(true).unwrap();
        interlock.arm().unwrap();
        (interlock, transport)
    }

    #[test]
    fn cannot_arm_with_outputs_disabled() {
        let (interlock, _) = interlock();
        assert!(matches!(interlock.arm(), Err(ShowError::NotReady(_))));
        assert_eq!(interlock.state(), SafetyState::Disarmed);
    }

    #[test]
    fn arming_drives_the_arm_pin() {
        let (interlock, transport) = armed();
        assert_eq!(interlock.state(), SafetyState::Armed);
        let pins = transport.pins().unwrap();
        assert!(pins.armed());
        assert!(pins.outputs_enabled());
    }

    #[test]
    fn disabling_outputs_while_armed_disarms() {
        let (interlock, transport) = armed();
        interlock.set_outputs_enabled(false).unwrap();

        assert_eq!(interlock.state(), SafetyState::Disarmed);
        assert_eq!(transport.pins(), Some(GpioState::safe(5)));
    }

    #[test]
    fn disabling_outputs_while_executing_aborts() {
        let (interlock, _) = armed();
        interlock.begin_execution().unwrap();

        assert_eq!(
            interlock.set_outputs_enabled(false).unwrap(),
            SafetyState::Aborted
        );
        assert!(interlock.is_aborted());
        assert_eq!(
            interlock.abort_reason().as_deref(),
            Some("outputs disabled during execution")
        );
    }

    #[test]
    fn readiness_reports_the_first_missing_condition() {
        let (interlock, _) = interlock();
        let err = interlock.readiness().unwrap_err();
        assert_eq!(err.to_string(), "system not ready: outputs not enabled");

        interlock.set_outputs_enabled(true).unwrap();
        let err = interlock.readiness().unwrap_err();
        assert_eq!(err.to_string(), "system not ready: system not armed");

        interlock.arm().unwrap();
        interlock.begin_execution().unwrap();
        let err = interlock.begin_execution().unwrap_err();
        assert_eq!(err.to_string(), "system not ready: system already executing");
    }

    #[test]
    fn abort_clears_bits_and_drives_safe_pins_from_any_state() {
        let (interlock, transport) = armed();
        interlock.begin_execution().unwrap();
        interlock
            .with_chains(|chains, _| {
                chains.set(crate::OutputAddress { chain: 3, bit: 7 })?;
                Ok(())
            })
            .unwrap();
        let events = interlock.events().subscribe();

        interlock.emergency_abort("test");

        assert_eq!(interlock.state(), SafetyState::Aborted);
        assert!(interlock.chain_snapshot().unwrap().is_clear());
        assert_eq!(transport.pins(), Some(GpioState::safe(5)));
        for chain in 0..5 {
            assert_eq!(transport.last_payload(chain), Some(vec![0; 25]));
        }
        assert_eq!(
            events.try_recv().unwrap(),
            InterlockEvent::StateChanged {
                from: SafetyState::Executing,
                to: SafetyState::Aborted
            }
        );

        // aborting again from a terminal state is still accepted
        interlock.emergency_abort("second");
        assert_eq!(interlock.abort_reason().as_deref(), Some("test"));
    }

    #[test]
    fn aborted_is_terminal_until_reset() {
        let (interlock, _) = armed();
        interlock.emergency_abort("stop");

        assert!(interlock.set_outputs_enabled(true).is_err());
        assert!(interlock.arm().is_err());
        assert!(interlock.with_chains(|_, _| Ok(())).is_err());

        interlock.reset().unwrap();
        assert_eq!(interlock.state(), SafetyState::Disarmed);
        assert!(!interlock.is_aborted());
        interlock.set_outputs_enabled(true).unwrap();
        interlock.arm().unwrap();
        assert!(interlock.readiness().is_ok());
    }

    #[test]
    fn firing_requires_executing() {
        let (interlock, _) = armed();
        assert!(interlock.with_chains(|_, _| Ok(())).is_err());

        interlock.begin_execution().unwrap();
        interlock.pause().unwrap();
        assert!(interlock.with_chains(|_, _| Ok(())).is_err());

        interlock.resume().unwrap();
        assert!(interlock.with_chains(|_, _| Ok(())).is_ok());

        interlock.complete().unwrap();
        assert_eq!(interlock.state(), SafetyState::Completed);
        interlock.arm().unwrap();
        assert_eq!(interlock.state(), SafetyState::Armed);
    }

    #[test]
    fn clear_chains_only_touches_the_listed_chains() {
        let (interlock, transport) = armed();
        interlock.begin_execution().unwrap();
        interlock
            .with_chains(|chains, _| {
                chains.set(crate::OutputAddress { chain: 1, bit: 4 })?;
                chains.set(crate::OutputAddress { chain: 2, bit: 9 })
            })
            .unwrap();

        interlock.clear_chains(&[1]).unwrap();

        let chains = interlock.chain_snapshot().unwrap();
        assert!(chains.active_bits(1).is_empty());
        assert_eq!(chains.active_bits(2), vec![9]);
        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].chain, 1);
        assert_eq!(frames[0].packet.payload, vec![0; 25]);

        assert!(interlock.clear_chains(&[5]).is_err());
    }

    #[test]
    fn status_reports_pins_and_active_outputs() {
        let (interlock, _) = armed();
        interlock.begin_execution().unwrap();
        interlock
            .with_chains(|chains, _| chains.set(crate::OutputAddress { chain: 0, bit: 0 }))
            .unwrap();

        let status = interlock.status().unwrap();
        assert_eq!(status.state, SafetyState::Executing);
        assert_eq!(status.active_outputs, 1);
        assert_eq!(status.pins["arm"], PinLevel::High);
    }
}
