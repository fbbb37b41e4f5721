//! Minimal views over gossiped blocks and fetched states
//!
//! Only the fields the crawler indexes by are decoded; everything else stays
//! opaque and is stored as received.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{CrawlerError, Result};

/// Bytes before the message in an SSZ `SignedBeaconBlock`: the message offset
/// followed by the 96 byte signature
const SIGNED_BLOCK_FIXED_LEN: usize = 4 + 96;

/// slot, proposer_index, parent_root, state_root, body offset
const BLOCK_MESSAGE_FIXED_LEN: usize = 8 + 8 + 32 + 32 + 4;

/// Header fields of a signed beacon block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeaderView {
    pub slot: u64,
    pub proposer_index: u64,
    pub parent_root: [u8; 32],
    pub state_root: [u8; 32],
    /// SHA-256 of the raw block bytes, the key blocks are stored under
    pub block_key: [u8; 32],
}

impl BlockHeaderView {
    pub fn from_ssz(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SIGNED_BLOCK_FIXED_LEN + BLOCK_MESSAGE_FIXED_LEN {
            return Err(CrawlerError::Decode(format!(
                "signed block of {} bytes is too short",
                bytes.len()
            )));
        }
        let offset = u32::from_le_bytes(read_array(bytes, 0)?) as usize;
        if offset < SIGNED_BLOCK_FIXED_LEN || offset + BLOCK_MESSAGE_FIXED_LEN > bytes.len() {
            return Err(CrawlerError::Decode(format!(
                "invalid block message offset {}",
                offset
            )));
        }

        Ok(Self {
            slot: u64::from_le_bytes(read_array(bytes, offset)?),
            proposer_index: u64::from_le_bytes(read_array(bytes, offset + 8)?),
            parent_root: read_array(bytes, offset + 16)?,
            state_root: read_array(bytes, offset + 48)?,
            block_key: Sha256::digest(bytes).into(),
        })
    }
}

fn read_array<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N]> {
    bytes
        .get(at..at + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(|| CrawlerError::Decode(format!("need {} bytes at offset {}", N, at)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkInfo {
    pub previous_version: [u8; 4],
    pub current_version: [u8; 4],
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFormat {
    Json,
    Ssz,
}

/// Decoded summary of a full beacon state; the raw bytes are kept for storage
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub format: StateFormat,
    pub genesis_time: u64,
    pub genesis_validators_root: [u8; 32],
    pub slot: u64,
    pub fork: Option<ForkInfo>,
    pub finalized_epoch: u64,
    pub finalized_root: [u8; 32],
    pub raw: Vec<u8>,
}

// Fixed-size prefix of an SSZ BeaconState (phase0 through bellatrix share it)
const SSZ_GENESIS_TIME: usize = 0;
const SSZ_GENESIS_VALIDATORS_ROOT: usize = 8;
const SSZ_SLOT: usize = 40;
const SSZ_FORK: usize = 48;
const SLOTS_PER_HISTORICAL_ROOT: usize = 8192;
const EPOCHS_PER_HISTORICAL_VECTOR: usize = 65536;
const EPOCHS_PER_SLASHINGS_VECTOR: usize = 8192;
const SSZ_FINALIZED_CHECKPOINT: usize = SSZ_FORK
    + 16 // fork
    + 112 // latest_block_header
    + 2 * SLOTS_PER_HISTORICAL_ROOT * 32 // block_roots, state_roots
    + 4 // historical_roots offset
    + 72 // eth1_data
    + 4 // eth1_data_votes offset
    + 8 // eth1_deposit_index
    + 4 + 4 // validators, balances offsets
    + EPOCHS_PER_HISTORICAL_VECTOR * 32 // randao_mixes
    + EPOCHS_PER_SLASHINGS_VECTOR * 8 // slashings
    + 4 + 4 // epoch participation offsets
    + 1 // justification_bits
    + 2 * 40; // previous and current justified checkpoints

#[derive(Deserialize)]
struct ApiEnvelope {
    data: JsonState,
}

#[derive(Deserialize)]
struct JsonState {
    genesis_time: Quantity,
    genesis_validators_root: String,
    slot: Quantity,
    #[serde(default)]
    fork: Option<JsonFork>,
    #[serde(default)]
    finalized_checkpoint: Option<JsonCheckpoint>,
}

#[derive(Deserialize)]
struct JsonFork {
    previous_version: String,
    current_version: String,
    epoch: Quantity,
}

#[derive(Deserialize)]
struct JsonCheckpoint {
    epoch: Quantity,
    root: String,
}

/// Beacon API numbers arrive as decimal strings, other tools emit plain numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum Quantity {
    Number(u64),
    Text(String),
}

impl Quantity {
    fn value(&self) -> Result<u64> {
        match self {
            Quantity::Number(n) => Ok(*n),
            Quantity::Text(s) => s
                .parse()
                .map_err(|_| CrawlerError::Decode(format!("invalid quantity '{}'", s))),
        }
    }
}

fn hex_array<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(s.trim_start_matches("0x"))
        .map_err(|e| CrawlerError::Decode(format!("invalid hex '{}': {}", s, e)))?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| CrawlerError::Decode(format!("expected {} bytes, got {}", N, bytes.len())))
}

impl StateSnapshot {
    /// Decode either beacon API JSON (with or without the `data` envelope) or
    /// raw SSZ bytes
    pub fn decode(raw: Vec<u8>) -> Result<Self> {
        let first = raw.iter().find(|b| !b.is_ascii_whitespace()).copied();
        match first {
            None => Err(CrawlerError::Decode("empty state".to_string())),
            Some(b'{') => Self::from_json(raw),
            Some(_) => Self::from_ssz(raw),
        }
    }

    fn from_json(raw: Vec<u8>) -> Result<Self> {
        let state = match serde_json::from_slice::<ApiEnvelope>(&raw) {
            Ok(envelope) => envelope.data,
            Err(_) => serde_json::from_slice::<JsonState>(&raw)?,
        };

        let fork = match &state.fork {
            Some(f) => Some(ForkInfo {
                previous_version: hex_array(&f.previous_version)?,
                current_version: hex_array(&f.current_version)?,
                epoch: f.epoch.value()?,
            }),
            None => None,
        };
        let (finalized_epoch, finalized_root) = match &state.finalized_checkpoint {
            Some(cp) => (cp.epoch.value()?, hex_array(&cp.root)?),
            None => (0, [0u8; 32]),
        };

        Ok(Self {
            format: StateFormat::Json,
            genesis_time: state.genesis_time.value()?,
            genesis_validators_root: hex_array(&state.genesis_validators_root)?,
            slot: state.slot.value()?,
            fork,
            finalized_epoch,
            finalized_root,
            raw,
        })
    }

    fn from_ssz(raw: Vec<u8>) -> Result<Self> {
        let genesis_time = u64::from_le_bytes(read_array(&raw, SSZ_GENESIS_TIME)?);
        let genesis_validators_root = read_array(&raw, SSZ_GENESIS_VALIDATORS_ROOT)?;
        let slot = u64::from_le_bytes(read_array(&raw, SSZ_SLOT)?);
        let fork = ForkInfo {
            previous_version: read_array(&raw, SSZ_FORK)?,
            current_version: read_array(&raw, SSZ_FORK + 4)?,
            epoch: u64::from_le_bytes(read_array(&raw, SSZ_FORK + 8)?),
        };
        // Truncated states still carry their header; the checkpoint is optional
        let (finalized_epoch, finalized_root) = match (
            read_array::<8>(&raw, SSZ_FINALIZED_CHECKPOINT),
            read_array::<32>(&raw, SSZ_FINALIZED_CHECKPOINT + 8),
        ) {
            (Ok(epoch), Ok(root)) => (u64::from_le_bytes(epoch), root),
            _ => (0, [0u8; 32]),
        };

        Ok(Self {
            format: StateFormat::Ssz,
            genesis_time,
            genesis_validators_root,
            slot,
            fork: Some(fork),
            finalized_epoch,
            finalized_root,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_block(slot: u64, state_root: [u8; 32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(SIGNED_BLOCK_FIXED_LEN as u32).to_le_bytes());
        bytes.extend_from_slice(&[0xAB; 96]);
        bytes.extend_from_slice(&slot.to_le_bytes());
        bytes.extend_from_slice(&42u64.to_le_bytes());
        bytes.extend_from_slice(&[0x11; 32]);
        bytes.extend_from_slice(&state_root);
        bytes.extend_from_slice(&84u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        bytes
    }

    #[test]
    fn test_block_header_fields() {
        let bytes = signed_block(3_205_120, [0x22; 32]);
        let view = BlockHeaderView::from_ssz(&bytes).unwrap();
        assert_eq!(view.slot, 3_205_120);
        assert_eq!(view.proposer_index, 42);
        assert_eq!(view.parent_root, [0x11; 32]);
        assert_eq!(view.state_root, [0x22; 32]);
        let expected: [u8; 32] = Sha256::digest(&bytes).into();
        assert_eq!(view.block_key, expected);
    }

    #[test]
    fn test_short_or_bad_offset_block_rejected() {
        assert!(BlockHeaderView::from_ssz(&[0u8; 50]).is_err());

        let mut bytes = signed_block(1, [0; 32]);
        bytes[0..4].copy_from_slice(&10_000u32.to_le_bytes());
        assert!(matches!(
            BlockHeaderView::from_ssz(&bytes),
            Err(CrawlerError::Decode(_))
        ));
    }

    #[test]
    fn test_state_from_beacon_api_json() {
        let body = br#"{"data": {
            "genesis_time": "1606824023",
            "genesis_validators_root": "0x4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95",
            "slot": "3205120",
            "fork": {"previous_version": "0x00000000", "current_version": "0x01000000", "epoch": "74240"},
            "finalized_checkpoint": {"epoch": "100158", "root": "0x0101010101010101010101010101010101010101010101010101010101010101"}
        }}"#;
        let state = StateSnapshot::decode(body.to_vec()).unwrap();
        assert_eq!(state.format, StateFormat::Json);
        assert_eq!(state.slot, 3_205_120);
        assert_eq!(state.genesis_time, 1_606_824_023);
        assert_eq!(state.fork.unwrap().current_version, [1, 0, 0, 0]);
        assert_eq!(state.finalized_epoch, 100_158);
        assert_eq!(state.finalized_root, [1; 32]);
    }

    #[test]
    fn test_state_from_bare_json_numbers() {
        let body = br#"{"genesis_time": 5, "genesis_validators_root": "0x0000000000000000000000000000000000000000000000000000000000000000", "slot": 7}"#;
        let state = StateSnapshot::decode(body.to_vec()).unwrap();
        assert_eq!(state.slot, 7);
        assert!(state.fork.is_none());
    }

    #[test]
    fn test_state_from_ssz_prefix() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&9u64.to_le_bytes());
        raw.extend_from_slice(&[3u8; 32]);
        raw.extend_from_slice(&640u64.to_le_bytes());
        raw.extend_from_slice(&[0, 0, 0, 0, 1, 0, 0, 0]);
        raw.extend_from_slice(&20u64.to_le_bytes());

        let state = StateSnapshot::decode(raw).unwrap();
        assert_eq!(state.format, StateFormat::Ssz);
        assert_eq!(state.slot, 640);
        assert_eq!(state.genesis_validators_root, [3; 32]);
        assert_eq!(state.fork.unwrap().epoch, 20);
        assert_eq!(state.finalized_epoch, 0);
    }

    #[test]
    fn test_garbage_state_is_decode_error() {
        assert!(matches!(
            StateSnapshot::decode(b"{not json".to_vec()),
            Err(CrawlerError::Decode(_))
        ));
        assert!(StateSnapshot::decode(vec![1, 2, 3]).is_err());
        assert!(StateSnapshot::decode(Vec::new()).is_err());
    }
}
