//! The seam between the engine and whatever moves bytes to the hardware.

use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use crate::{GpioState, Result, ShiftRegisterPacket, ShowError};

/// Delivers validated packets and control-pin levels to the hardware.
///
/// A dispatch is all-or-nothing: either the whole chain payload is shifted
/// out and latched or the call fails.
pub trait Transport: Send + Sync {
    fn dispatch(&self, chain: usize, packet: &ShiftRegisterPacket) -> Result<()>;

    fn apply_pins(&self, pins: &GpioState) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedFrame {
    pub chain: usize,
    pub packet: ShiftRegisterPacket,
}

#[derive(Debug, Default)]
struct SimulatedState {
    frames: Vec<DispatchedFrame>,
    pins: Vec<GpioState>,
    fail_dispatch: Option<String>,
}

/// In-memory transport that records everything it is asked to do.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following dispatch fail with a hardware fault.
    pub fn fail_dispatches(&self, reason: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_dispatch = Some(reason.into());
        }
    }

    pub fn frames(&self) -> Vec<DispatchedFrame> {
        self.state
            .lock()
            .map(|state| state.frames.clone())
            .unwrap_or_default()
    }

    /// Most recent payload sent to `chain`.
    pub fn last_payload(&self, chain: usize) -> Option<Vec<u8>> {
        self.state.lock().ok().and_then(|state| {
            state
                .frames
                .iter()
                .rev()
                .find(|frame| frame.chain == chain)
                .map(|frame| frame.packet.payload.clone())
        })
    }

    pub fn pins(&self) -> Option<GpioState> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.pins.last().cloned())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimulatedState>> {
        self.state
            .lock()
            .map_err(|_| ShowError::msg("simulated transport has been poisoned"))
    }
}

impl Transport for SimulatedTransport {
    fn dispatch(&self, chain: usize, packet: &ShiftRegisterPacket) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(reason) = &state.fail_dispatch {
            return Err(ShowError::HardwareFault(reason.clone()));
        }
        tracing::debug!(
            chain,
            packet_id = %packet.packet_id,
            payload = %hex::encode(&packet.payload),
            "simulated dispatch"
        );
        state.frames.push(DispatchedFrame {
            chain,
            packet: packet.clone(),
        });
        Ok(())
    }

    fn apply_pins(&self, pins: &GpioState) -> Result<()> {
        self.lock()?.pins.push(pins.clone());
        Ok(())
    }
}

/// Writes each packet as one JSON line for an external transport to replay.
pub struct PacketLogTransport<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> PacketLogTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn write_line(&self, line: &serde_json::Value) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ShowError::msg("packet log writer has been poisoned"))?;
        serde_json::to_writer(&mut *writer, line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> Transport for PacketLogTransport<W> {
    fn dispatch(&self, chain: usize, packet: &ShiftRegisterPacket) -> Result<()> {
        self.write_line(&serde_json::json!({
            "type": "packet",
            "chain": chain,
            "packet": packet,
        }))
    }

    fn apply_pins(&self, pins: &GpioState) -> Result<()> {
        self.write_line(&serde_json::json!({
            "type": "pins",
            "pins": pins.named_levels(),
        }))
    }
}
