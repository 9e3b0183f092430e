use serde::{Deserialize, Serialize};

use crate::{AddressMapper, OutputAddress, Result, ShowError};

/// Energized/idle bit for every output, one bank per chain.
///
/// Owned by the safety interlock for the duration of a session so that
/// firing and emergency clears are serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    banks: Vec<Vec<bool>>,
}

impl ChainState {
    pub fn new(num_chains: usize, outputs_per_chain: usize) -> Self {
        Self {
            banks: vec![vec![false; outputs_per_chain]; num_chains],
        }
    }

    pub fn for_mapper(mapper: &AddressMapper) -> Self {
        Self::new(mapper.num_chains(), mapper.outputs_per_chain())
    }

    pub fn num_chains(&self) -> usize {
        self.banks.len()
    }

    pub fn outputs_per_chain(&self) -> usize {
        self.banks.first().map(Vec::len).unwrap_or(0)
    }

    pub fn bank(&self, chain: usize) -> Option<&[bool]> {
        self.banks.get(chain).map(Vec::as_slice)
    }

    pub fn set(&mut self, address: OutputAddress) -> Result<()> {
        *self.slot(address)? = true;
        Ok(())
    }

    pub fn clear(&mut self, address: OutputAddress) -> Result<()> {
        *self.slot(address)? = false;
        Ok(())
    }

    pub fn is_set(&self, address: OutputAddress) -> bool {
        self.banks
            .get(address.chain)
            .and_then(|bank| bank.get(address.bit))
            .copied()
            .unwrap_or(false)
    }

    pub fn clear_chain(&mut self, chain: usize) {
        if let Some(bank) = self.banks.get_mut(chain) {
            bank.fill(false);
        }
    }

    pub fn clear_all(&mut self) {
        for bank in &mut self.banks {
            bank.fill(false);
        }
    }

    /// Bit positions currently set on `chain`, ascending.
    pub fn active_bits(&self, chain: usize) -> Vec<usize> {
        self.banks
            .get(chain)
            .map(|bank| {
                bank.iter()
                    .enumerate()
                    .filter_map(|(bit, on)| on.then_some(bit))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.banks
            .iter()
            .map(|bank| bank.iter().filter(|on| **on).count())
            .sum()
    }

    pub fn is_clear(&self) -> bool {
        self.active_count() == 0
    }

    fn slot(&mut self, address: OutputAddress) -> Result<&mut bool> {
        let chains = self.banks.len();
        self.banks
            .get_mut(address.chain)
            .and_then(|bank| bank.get_mut(address.bit))
            .ok_or_else(|| {
                ShowError::msg(format!(
                    "chain {} bit {} does not exist in a {chains}-chain state",
                    address.chain, address.bit
                ))
            })
    }
}
