use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Serialize to deterministic bincode bytes.
///
/// Everything that is hashed or signed goes through this function so that
/// every node derives identical bytes for identical values.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    bincode::serialize(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Deserialize from bincode bytes
pub fn from_bytes<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CoreError> {
    bincode::deserialize(bytes).map_err(|e| CoreError::Deserialization(e.to_string()))
}

/// Size of the bincode encoding without allocating it
pub fn encoded_len<T: Serialize>(value: &T) -> Result<u64, CoreError> {
    bincode::serialized_size(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Serialize to JSON string (for the HTTP API and config files)
pub fn to_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Serialize to pretty JSON string
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string_pretty(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Deserialize from JSON string
pub fn from_json<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, CoreError> {
    serde_json::from_str(json).map_err(|e| CoreError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Block, BlockHeader, Step};
    use crate::crypto::{Address, Hash};

    fn sample_block() -> Block {
        Block::new(
            BlockHeader {
                height: 7,
                proposer_address: Address::new([3u8; 20]),
                prev_state_hash: Hash::ZERO,
                state_hash: Hash::new([9u8; 32]),
                num_txs: 1,
                tx_root: Hash::ZERO,
            },
            vec![b"tx".to_vec()],
        )
    }

    #[test]
    fn test_block_bincode_roundtrip() {
        let block = sample_block();
        let bytes = to_bytes(&block).unwrap();
        let recovered: Block = from_bytes(&bytes).unwrap();
        assert_eq!(block, recovered);
        assert_eq!(encoded_len(&block).unwrap(), bytes.len() as u64);
    }

    #[test]
    fn test_step_json_is_readable() {
        let json = to_json(&Step::PreCommit).unwrap();
        assert_eq!(json, "\"PreCommit\"");
        let step: Step = from_json(&json).unwrap();
        assert_eq!(step, Step::PreCommit);
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let bytes = to_bytes(&sample_block()).unwrap();
        let result: Result<Block, _> = from_bytes(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(CoreError::Deserialization(_))));
    }
}
