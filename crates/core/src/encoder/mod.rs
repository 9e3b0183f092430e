//! Shift-register byte encoding.
//!
//! Each register packs its eight outputs MSB-first: the lowest numbered
//! output of a register sits in bit 7. The chain is daisy-chained, so the
//! first register's byte has to be clocked out last and the payload is the
//! register bytes in reverse order.

use serde::{Deserialize, Serialize};

use crate::{ChainState, Result, ShowError};

/// Fixed patterns used to verify wiring before a show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPattern {
    /// Only the first output of the first register.
    Sequential,
    /// 0xAA / 0x55 on alternating registers.
    Alternating,
    AllOn,
    AllOff,
}

impl TestPattern {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Alternating => "alternating",
            Self::AllOn => "all_on",
            Self::AllOff => "all_off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftRegisterEncoder {
    registers_per_chain: usize,
}

impl ShiftRegisterEncoder {
    pub fn new(registers_per_chain: usize) -> Self {
        Self {
            registers_per_chain,
        }
    }

    pub fn registers_per_chain(&self) -> usize {
        self.registers_per_chain
    }

    /// Wire-ready payload for `chain`, first register last.
    pub fn encode(&self, state: &ChainState, chain: usize) -> Result<Vec<u8>> {
        let bank = state
            .bank(chain)
            .ok_or_else(|| ShowError::msg(format!("chain {chain} does not exist")))?;
        if bank.len() != self.registers_per_chain * 8 {
            return Err(ShowError::msg(format!(
                "chain {chain} holds {} outputs but the encoder expects {}",
                bank.len(),
                self.registers_per_chain * 8
            )));
        }

        let registers = bank
            .chunks(8)
            .map(|outputs| {
                outputs
                    .iter()
                    .enumerate()
                    .filter(|(_, on)| **on)
                    .fold(0u8, |byte, (position, _)| byte | (0x80 >> position))
            })
            .collect();
        Ok(self.wire_order(registers))
    }

    /// Every chain's payload, indexed by chain.
    pub fn encode_all(&self, state: &ChainState) -> Result<Vec<Vec<u8>>> {
        (0..state.num_chains())
            .map(|chain| self.encode(state, chain))
            .collect()
    }

    /// All outputs off.
    pub fn clear_frame(&self) -> Vec<u8> {
        vec![0; self.registers_per_chain]
    }

    pub fn pattern(&self, pattern: TestPattern) -> Vec<u8> {
        let registers = match pattern {
            TestPattern::Sequential => {
                let mut registers = vec![0u8; self.registers_per_chain];
                if let Some(first) = registers.first_mut() {
                    *first = 0x80;
                }
                registers
            }
            TestPattern::Alternating => (0..self.registers_per_chain)
                .map(|i| if i % 2 == 0 { 0xAA } else { 0x55 })
                .collect(),
            TestPattern::AllOn => vec![0xFF; self.registers_per_chain],
            TestPattern::AllOff => vec![0; self.registers_per_chain],
        };
        self.wire_order(registers)
    }

    fn wire_order(&self, mut registers: Vec<u8>) -> Vec<u8> {
        registers.reverse();
        registers
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::AddressMapper;

    fn rig() -> (AddressMapper, ShiftRegisterEncoder, ChainState) {
        let mapper = AddressMapper::default();
        let state = ChainState::for_mapper(&mapper);
        (mapper, ShiftRegisterEncoder::new(25), state)
    }

    #[test]
    fn output_one_lands_in_high_bit_of_last_byte() {
        let (mapper, encoder, mut state) = rig();
        state.set(mapper.to_address(1).unwrap()).unwrap();

        let payload = encoder.encode(&state, 0).unwrap();
        assert_eq!(payload.len(), 25);
        assert_eq!(payload[24], 0x80);
        assert!(payload[..24].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn combines_bits_in_the_same_register() {
        let (mapper, encoder, mut state) = rig();
        for output in [9, 16, 17] {
            state.set(mapper.to_address(output).unwrap()).unwrap();
        }

        let payload = encoder.encode(&state, 0).unwrap();
        // register 1 holds outputs 9..=16, register 2 holds 17..=24
        assert_eq!(payload[23], 0x81);
        assert_eq!(payload[22], 0x80);
    }

    #[test]
    fn other_chains_stay_clear() {
        let (mapper, encoder, mut state) = rig();
        state.set(mapper.to_address(401).unwrap()).unwrap();

        let frames = encoder.encode_all(&state).unwrap();
        assert_eq!(frames[2][24], 0x80);
        for chain in [0, 1, 3, 4] {
            assert_eq!(frames[chain], encoder.clear_frame());
        }
    }

    #[test]
    fn patterns_follow_wire_order() {
        let encoder = ShiftRegisterEncoder::new(4);
        assert_eq!(encoder.pattern(TestPattern::Sequential), vec![0, 0, 0, 0x80]);
        assert_eq!(
            encoder.pattern(TestPattern::Alternating),
            vec![0x55, 0xAA, 0x55, 0xAA]
        );
        assert_eq!(encoder.pattern(TestPattern::AllOn), vec![0xFF; 4]);
        assert_eq!(encoder.pattern(TestPattern::AllOff), vec![0; 4]);
    }

    proptest! {
        #[test]
        fn a_single_output_sets_exactly_one_bit(output in 1u32..=1000) {
            let (mapper, encoder, mut state) = rig();
            let address = mapper.to_address(output).unwrap();
            state.set(address).unwrap();

            let payload = encoder.encode(&state, address.chain).unwrap();
            let byte_index = payload.len() - 1 - address.register();
            let mask = 0x80u8 >> address.bit_in_register();

            prop_assert_eq!(payload[byte_index], mask);
            let total_bits: u32 = payload.iter().map(|byte| byte.count_ones()).sum();
            prop_assert_eq!(total_bits, 1);
        }
    }
}
