//! Control-line levels for the output-enable, serial-clear and arm pins.
//!
//! OE is active-LOW (HIGH disables a chain). SRCLR is active-HIGH for normal
//! operation (LOW holds the chain cleared). ARM is active-HIGH.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::GpioConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn is_high(&self) -> bool {
        matches!(self, Self::High)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLevels {
    pub output_enable: PinLevel,
    pub serial_clear: PinLevel,
}

/// Levels of every control pin for a given enable/arm combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpioState {
    pub chains: Vec<ChainLevels>,
    pub arm: PinLevel,
}

impl GpioState {
    pub fn for_state(num_chains: usize, outputs_enabled: bool, armed: bool) -> Self {
        let levels = if outputs_enabled {
            ChainLevels {
                output_enable: PinLevel::Low,
                serial_clear: PinLevel::High,
            }
        } else {
            ChainLevels {
                output_enable: PinLevel::High,
                serial_clear: PinLevel::Low,
            }
        };
        Self {
            chains: vec![levels; num_chains],
            arm: if armed { PinLevel::High } else { PinLevel::Low },
        }
    }

    /// Outputs disabled, chains held clear, disarmed.
    pub fn safe(num_chains: usize) -> Self {
        Self::for_state(num_chains, false, false)
    }

    pub fn outputs_enabled(&self) -> bool {
        self.chains.iter().all(|chain| {
            chain.output_enable == PinLevel::Low && chain.serial_clear == PinLevel::High
        })
    }

    pub fn armed(&self) -> bool {
        self.arm.is_high()
    }

    /// Levels keyed by pin name (`oe_chain_1`, `srclr_chain_1`, ..., `arm`).
    pub fn named_levels(&self) -> BTreeMap<String, PinLevel> {
        let mut levels = BTreeMap::new();
        for (index, chain) in self.chains.iter().enumerate() {
            levels.insert(format!("oe_chain_{}", index + 1), chain.output_enable);
            levels.insert(format!("srclr_chain_{}", index + 1), chain.serial_clear);
        }
        levels.insert("arm".to_string(), self.arm);
        levels
    }

    /// Levels keyed by BCM pin number.
    pub fn pin_levels(&self, config: &GpioConfig) -> BTreeMap<u8, PinLevel> {
        let mut levels = BTreeMap::new();
        for (pins, chain) in config.chains.iter().zip(&self.chains) {
            levels.insert(pins.output_enable_pin, chain.output_enable);
            levels.insert(pins.serial_clear_pin, chain.serial_clear);
        }
        levels.insert(config.arm_pin, self.arm);
        levels
    }
}
