use serde::{Deserialize, Serialize};

use crate::pacemaker::PacemakerConfig;

/// Consensus engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Maximum encoded block size a leader proposes or a replica accepts
    pub max_block_bytes: u64,
    /// Messages for a later height kept until the node catches up
    pub max_future_messages: usize,
    /// Capacity of the worker's inbound event queue
    pub event_queue_capacity: usize,
    pub pacemaker: PacemakerConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            max_block_bytes: 4 * 1024 * 1024,
            max_future_messages: 256,
            event_queue_capacity: 1024,
            pacemaker: PacemakerConfig::default(),
        }
    }
}
