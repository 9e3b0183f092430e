//! Global output numbering.
//!
//! Outputs are numbered `1..=total_outputs` across every chain. Output `n`
//! lives on chain `(n - 1) / outputs_per_chain` at bit `(n - 1) %
//! outputs_per_chain`. Nothing else in the crate repeats this arithmetic.

use serde::{Deserialize, Serialize};

use crate::{config::HardwareConfig, Result, ShowError};

/// Physical location of one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputAddress {
    pub chain: usize,
    pub bit: usize,
}

impl OutputAddress {
    /// Index of the shift register within the chain that holds this output.
    pub fn register(&self) -> usize {
        self.bit / 8
    }

    /// Position of this output inside its register, 0 being the lowest
    /// numbered output.
    pub fn bit_in_register(&self) -> usize {
        self.bit % 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMapper {
    num_chains: usize,
    outputs_per_chain: usize,
}

impl AddressMapper {
    pub fn new(num_chains: usize, outputs_per_chain: usize) -> Self {
        Self {
            num_chains,
            outputs_per_chain,
        }
    }

    pub fn from_config(config: &HardwareConfig) -> Self {
        Self::new(config.num_chains, config.outputs_per_chain())
    }

    pub fn num_chains(&self) -> usize {
        self.num_chains
    }

    pub fn outputs_per_chain(&self) -> usize {
        self.outputs_per_chain
    }

    pub fn total_outputs(&self) -> u32 {
        (self.num_chains * self.outputs_per_chain) as u32
    }

    pub fn contains(&self, output: u32) -> bool {
        output >= 1 && output <= self.total_outputs()
    }

    pub fn to_address(&self, output: u32) -> Result<OutputAddress> {
        if !self.contains(output) {
            return Err(ShowError::OutOfRange {
                output,
                total: self.total_outputs(),
            });
        }

        let index = (output - 1) as usize;
        Ok(OutputAddress {
            chain: index / self.outputs_per_chain,
            bit: index % self.outputs_per_chain,
        })
    }

    pub fn to_output(&self, chain: usize, bit: usize) -> Result<u32> {
        if chain >= self.num_chains || bit >= self.outputs_per_chain {
            return Err(ShowError::msg(format!(
                "address chain {chain} bit {bit} is outside {} chains of {} outputs",
                self.num_chains, self.outputs_per_chain
            )));
        }
        Ok((chain * self.outputs_per_chain + bit + 1) as u32)
    }
}

impl Default for AddressMapper {
    fn default() -> Self {
        Self::from_config(&HardwareConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn maps_chain_boundaries() {
        let mapper = AddressMapper::default();

        assert_eq!(
            mapper.to_address(1).unwrap(),
            OutputAddress { chain: 0, bit: 0 }
        );
        assert_eq!(
            mapper.to_address(200).unwrap(),
            OutputAddress { chain: 0, bit: 199 }
        );
        assert_eq!(
            mapper.to_address(201).unwrap(),
            OutputAddress { chain: 1, bit: 0 }
        );
        assert_eq!(
            mapper.to_address(1000).unwrap(),
            OutputAddress { chain: 4, bit: 199 }
        );
    }

    #[test]
    fn rejects_out_of_range_outputs() {
        let mapper = AddressMapper::default();
        assert!(matches!(
            mapper.to_address(0),
            Err(ShowError::OutOfRange { output: 0, total: 1000 })
        ));
        assert!(mapper.to_address(1001).is_err());
        assert!(mapper.to_output(5, 0).is_err());
        assert!(mapper.to_output(0, 200).is_err());
    }

    #[test]
    fn register_and_bit_within_register() {
        let address = AddressMapper::default().to_address(18).unwrap();
        assert_eq!(address.register(), 2);
        assert_eq!(address.bit_in_register(), 1);
    }

    #[test]
    fn every_output_round_trips() {
        let mapper = AddressMapper::default();
        for output in 1..=1000 {
            let address = mapper.to_address(output).unwrap();
            assert_eq!(mapper.to_output(address.chain, address.bit).unwrap(), output);
        }
    }

    proptest! {
        #[test]
        fn mapping_is_a_bijection_for_any_layout(
            chains in 1usize..8,
            registers in 1usize..32,
            seed in any::<u32>(),
        ) {
            let mapper = AddressMapper::new(chains, registers * 8);
            let output = seed % mapper.total_outputs() + 1;
            let address = mapper.to_address(output).unwrap();
            prop_assert!(address.chain < chains);
            prop_assert!(address.bit < registers * 8);
            prop_assert_eq!(mapper.to_output(address.chain, address.bit).unwrap(), output);
        }
    }
}
