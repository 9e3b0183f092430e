use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, ShowError};

/// Top-level configuration structure for the firing controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub hardware: HardwareConfig,
    pub safety: SafetyConfig,
    pub timing: TimingConfig,
    pub watchdog: WatchdogConfig,
    pub gpio: GpioConfig,
}

impl AppConfig {
    /// Loads a JSON config file. Missing sections fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config: AppConfig = serde_json::from_str(&text)?;
        config.watchdog = config.watchdog.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot drive safely.
    pub fn validate(&self) -> Result<()> {
        let hw = &self.hardware;
        if hw.num_chains == 0 || hw.registers_per_chain == 0 || hw.outputs_per_register == 0 {
            return Err(ShowError::msg(
                "hardware config requires at least one chain, register and output",
            ));
        }
        if hw.outputs_per_register != 8 {
            return Err(ShowError::msg(format!(
                "shift registers carry 8 outputs each, config says {}",
                hw.outputs_per_register
            )));
        }
        if self.gpio.chains.len() != hw.num_chains {
            return Err(ShowError::msg(format!(
                "gpio config lists {} chains but hardware has {}",
                self.gpio.chains.len(),
                hw.num_chains
            )));
        }
        if self.safety.max_simultaneous_outputs == 0 {
            return Err(ShowError::msg("max_simultaneous_outputs must be > 0"));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ShowError::msg("poll_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Physical layout of the shift-register banks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub num_chains: usize,
    pub registers_per_chain: usize,
    pub outputs_per_register: usize,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            num_chains: 5,
            registers_per_chain: 25,
            outputs_per_register: 8,
        }
    }
}

impl HardwareConfig {
    pub fn outputs_per_chain(&self) -> usize {
        self.registers_per_chain * self.outputs_per_register
    }

    pub fn total_outputs(&self) -> u32 {
        (self.num_chains * self.outputs_per_chain()) as u32
    }
}

/// Limits enforced before anything reaches the hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Maximum outputs a single cue may energize in the same tick.
    pub max_simultaneous_outputs: usize,
    pub max_cues: usize,
    pub default_pulse_duration_ms: u32,
    pub max_packet_age_secs: f64,
    pub max_packet_future_secs: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_outputs: 4,
            max_cues: 1000,
            default_pulse_duration_ms: 1000,
            max_packet_age_secs: 300.0,
            max_packet_future_secs: 60.0,
        }
    }
}

/// Tuning for the hybrid sleep/spin wait and the reporting cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Remaining time below which the clock stops sleeping.
    pub spin_threshold_us: u64,
    /// How far ahead of the deadline a sleep is cut short.
    pub sleep_margin_us: u64,
    /// Longest uninterrupted sleep; bounds abort latency.
    pub poll_interval_ms: u64,
    pub progress_interval_ms: u64,
    /// Lag above which a dispatch is logged as late.
    pub late_threshold_ms: u64,
    pub hold_after_show_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            spin_threshold_us: 1_000,
            sleep_margin_us: 500,
            poll_interval_ms: 10,
            progress_interval_ms: 1_000,
            late_threshold_ms: 5,
            hold_after_show_ms: 1_000,
        }
    }
}

/// Health monitor settings for the control link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_ms: u64,
    pub timeout_threshold_ms: u64,
    pub max_consecutive_failures: u32,
}

impl WatchdogConfig {
    pub const MIN_CHECK_INTERVAL_MS: u64 = 1_000;
    pub const MIN_TIMEOUT_THRESHOLD_MS: u64 = 5_000;

    /// Clamps every field to its minimum.
    pub fn normalized(self) -> Self {
        Self {
            check_interval_ms: self.check_interval_ms.max(Self::MIN_CHECK_INTERVAL_MS),
            timeout_threshold_ms: self
                .timeout_threshold_ms
                .max(Self::MIN_TIMEOUT_THRESHOLD_MS),
            max_consecutive_failures: self.max_consecutive_failures.max(1),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 3_000,
            timeout_threshold_ms: 10_000,
            max_consecutive_failures: 3,
        }
    }
}

/// Pin assignment for one shift-register chain (BCM numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPins {
    pub output_enable_pin: u8,
    pub serial_clear_pin: u8,
    pub data_pin: u8,
    pub clock_pin: u8,
    pub latch_pin: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub chains: Vec<ChainPins>,
    pub arm_pin: u8,
}

impl Default for GpioConfig {
    fn default() -> Self {
        const OE: [u8; 5] = [5, 6, 7, 8, 12];
        const SRCLR: [u8; 5] = [13, 16, 19, 20, 26];
        const DATA: [u8; 5] = [2, 3, 4, 14, 15];
        const CLOCK: [u8; 5] = [17, 18, 22, 23, 27];
        const LATCH: [u8; 5] = [9, 10, 11, 24, 25];

        let chains = (0..5)
            .map(|i| ChainPins {
                output_enable_pin: OE[i],
                serial_clear_pin: SRCLR[i],
                data_pin: DATA[i],
                clock_pin: CLOCK[i],
                latch_pin: LATCH[i],
            })
            .collect();

        Self {
            chains,
            arm_pin: 21,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_describe_a_thousand_output_rig() {
        let config = AppConfig::default();
        assert_eq!(config.hardware.outputs_per_chain(), 200);
        assert_eq!(config.hardware.total_outputs(), 1000);
        assert_eq!(config.gpio.chains.len(), 5);
        assert_eq!(config.gpio.chains[2].output_enable_pin, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_partial_file_and_clamps_watchdog() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"safety": {{"max_simultaneous_outputs": 2}}, "watchdog": {{"check_interval_ms": 10, "timeout_threshold_ms": 100, "max_consecutive_failures": 0}}}}"#
        )
        .unwrap();

        let config = AppConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.safety.max_simultaneous_outputs, 2);
        assert_eq!(config.safety.max_cues, 1000);
        assert_eq!(config.watchdog.check_interval_ms, 1_000);
        assert_eq!(config.watchdog.timeout_threshold_ms, 5_000);
        assert_eq!(config.watchdog.max_consecutive_failures, 1);
    }

    #[test]
    fn rejects_mismatched_pin_table() {
        let mut config = AppConfig::default();
        config.hardware.num_chains = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gpio config lists 5 chains"));
    }
}
