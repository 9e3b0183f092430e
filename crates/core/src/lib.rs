//! Core library for the pyrotechnic show controller.
//!
//! Turns a list of timed cues into shift-register frames, dispatches them at
//! their offsets through a [`Transport`], and keeps every firing behind the
//! arm/disarm interlock. A watchdog watches the control link and forces an
//! emergency abort when it stays down.

pub mod address;
pub mod chain;
pub mod config;
pub mod cue;
pub mod encoder;
pub mod error;
pub mod events;
pub mod execution;
pub mod gpio;
pub mod plan;
pub mod protocol;
pub mod safety;
pub mod timeline;
pub mod transport;
pub mod watchdog;

pub use address::{AddressMapper, OutputAddress};
pub use chain::ChainState;
pub use config::{AppConfig, HardwareConfig, SafetyConfig, TimingConfig, WatchdogConfig};
pub use cue::{Cue, CueAction, CueKind, CueValidator, OutputRange};
pub use encoder::{ShiftRegisterEncoder, TestPattern};
pub use error::{ProtocolError, Result, ShowError, ValidationError};
pub use events::EventBus;
pub use execution::{
    CueResult, ExecutionSummary, LinkHealth, ShowEvent, ShowExecutionManager, ShowHandle,
    ShowProgress, ShowState,
};
pub use gpio::{GpioState, PinLevel};
pub use plan::CuePlan;
pub use protocol::{PacketCodec, ShiftRegisterPacket};
pub use safety::{EmergencyStop, InterlockEvent, SafetyInterlock, SafetyState};
pub use timeline::{ExecutionClock, TimingStats, WaitOutcome};
pub use transport::{PacketLogTransport, SimulatedTransport, Transport};
pub use watchdog::{HealthCheck, WatchdogStatus, WatchdogTimer};
