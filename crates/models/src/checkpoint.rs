use serde::{Deserialize, Serialize};

use crate::QuorumSnapshot;

/// Durable record of a document's processing progress, persisted to the
/// document repository. Replaying the op stream from `log_offset + 1`
/// against a worker reconstructed from this record reproduces its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScribeCheckpoint {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    pub protocol_state: QuorumSnapshot,
    /// Stream offset covered by this checkpoint; -1 before any batch.
    pub log_offset: i64,
    pub last_summary_sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_client_summary_head: Option<String>,
    /// Service-summary handles usable as parents until the next client
    /// summary resets the lineage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_parent_summaries: Option<Vec<String>>,
    pub protocol_head: u64,
    #[serde(default)]
    pub is_corrupt: bool,
    /// Unix milliseconds at which the checkpoint was generated.
    #[serde(default)]
    pub checkpoint_timestamp: i64,
}

impl ScribeCheckpoint {
    /// The checkpoint seeding a document that has never been processed.
    pub fn initial() -> Self {
        Self {
            sequence_number: 0,
            minimum_sequence_number: 0,
            protocol_state: QuorumSnapshot::default(),
            log_offset: -1,
            last_summary_sequence_number: 0,
            last_client_summary_head: None,
            valid_parent_summaries: None,
            protocol_head: 0,
            is_corrupt: false,
            checkpoint_timestamp: 0,
        }
    }
}
