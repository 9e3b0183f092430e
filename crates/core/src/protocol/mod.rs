//! Versioned, checksummed frames exchanged with the firing hardware.
//!
//! The checksum is the first 16 hex characters of SHA-256 over the payload
//! followed by the little-endian bytes of the `f64` timestamp. A packet that
//! fails verification, or whose timestamp is outside the accepted window,
//! must never actuate hardware.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::SafetyConfig, ProtocolError, TestPattern};

pub const PROTOCOL_VERSION: u32 = 1;

pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftRegisterPacket {
    pub packet_id: String,
    /// Unix seconds at build time.
    pub timestamp: f64,
    #[serde(rename = "register_data", with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub checksum: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ShiftRegisterPacket {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

pub fn compute_checksum(payload: &[u8], timestamp: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(timestamp.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Builds and verifies packets for chains of a fixed register count.
#[derive(Debug)]
pub struct PacketCodec {
    num_registers: usize,
    max_age_secs: f64,
    max_future_secs: f64,
    sequence: AtomicU64,
}

impl PacketCodec {
    pub fn new(num_registers: usize) -> Self {
        let safety = SafetyConfig::default();
        Self::with_limits(num_registers, safety.max_packet_age_secs, safety.max_packet_future_secs)
    }

    pub fn with_limits(num_registers: usize, max_age_secs: f64, max_future_secs: f64) -> Self {
        Self {
            num_registers,
            max_age_secs,
            max_future_secs,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn num_registers(&self) -> usize {
        self.num_registers
    }

    /// Stamps `payload` with the current wall-clock time.
    pub fn build(&self, kind: &str, payload: Vec<u8>, metadata: Metadata) -> ShiftRegisterPacket {
        self.build_at(kind, payload, metadata, unix_now())
    }

    pub fn build_at(
        &self,
        kind: &str,
        payload: Vec<u8>,
        mut metadata: Metadata,
        timestamp: f64,
    ) -> ShiftRegisterPacket {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        metadata
            .entry("protocol_version".to_string())
            .or_insert_with(|| PROTOCOL_VERSION.into());
        ShiftRegisterPacket {
            packet_id: format!("{kind}_{}_{sequence}", (timestamp * 1000.0) as u64),
            timestamp,
            checksum: compute_checksum(&payload, timestamp),
            payload,
            metadata,
        }
    }

    /// All outputs off.
    pub fn emergency_stop(&self) -> ShiftRegisterPacket {
        let mut metadata = Metadata::new();
        metadata.insert("command_type".into(), "EMERGENCY_STOP".into());
        metadata.insert(
            "description".into(),
            "Turn off all outputs immediately".into(),
        );
        self.build("emergency_stop", vec![0; self.num_registers], metadata)
    }

    pub fn test_pattern(&self, pattern: TestPattern, payload: Vec<u8>) -> ShiftRegisterPacket {
        let mut metadata = Metadata::new();
        metadata.insert("command_type".into(), "TEST_PATTERN".into());
        metadata.insert("pattern_type".into(), pattern.name().into());
        self.build(&format!("test_{}", pattern.name()), payload, metadata)
    }

    pub fn validate(&self, packet: &ShiftRegisterPacket) -> Result<(), ProtocolError> {
        self.validate_at(packet, unix_now())
    }

    /// Validates against an explicit `now` (unix seconds).
    pub fn validate_at(&self, packet: &ShiftRegisterPacket, now: f64) -> Result<(), ProtocolError> {
        let expected = compute_checksum(&packet.payload, packet.timestamp);
        if packet.checksum != expected {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: packet.checksum.clone(),
            });
        }
        if packet.payload.len() != self.num_registers {
            return Err(ProtocolError::LengthMismatch {
                expected: self.num_registers,
                actual: packet.payload.len(),
            });
        }
        if !packet.timestamp.is_finite() {
            return Err(ProtocolError::Malformed("timestamp is not finite".into()));
        }

        let age = now - packet.timestamp;
        if age > self.max_age_secs {
            return Err(ProtocolError::Stale { age_secs: age });
        }
        if age < -self.max_future_secs {
            return Err(ProtocolError::FromFuture { ahead_secs: -age });
        }
        Ok(())
    }

    /// Parses a wire packet and validates it in one step.
    pub fn decode(&self, text: &str) -> Result<ShiftRegisterPacket, ProtocolError> {
        let packet = ShiftRegisterPacket::from_json(text)?;
        self.validate(&packet)?;
        Ok(packet)
    }
}
