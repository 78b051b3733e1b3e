use serde::{Deserialize, Serialize};

use crate::{QuorumSnapshot, SequencedOp};

/// Identifies the summarize op a response refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryProposal {
    pub summary_sequence_number: u64,
}

/// Payload of a client Summarize op: the client's uploaded content handle
/// and its claim of the summary lineage it builds upon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeContents {
    pub handle: String,
    pub head: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

/// Payload of a SummaryAck op, carrying the handle of the stored summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryAckContents {
    pub handle: String,
    pub summary_proposal: SummaryProposal,
}

/// Payload of a SummaryNack op, with a human-readable rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryNackContents {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_proposal: Option<SummaryProposal>,
}

/// Payload of a Control op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "contents")]
pub enum ControlContents {
    /// Tells interested services that ops at or below the durable sequence
    /// number are covered by a stored summary.
    #[serde(rename = "updateDSN", rename_all = "camelCase")]
    UpdateDurableSequenceNumber {
        durable_sequence_number: u64,
        is_client_summary: bool,
        clear_cache: bool,
    },
}

/// The versioned snapshot written to the content store.
///
/// `app_summary_handle` references client content (or the previous summary's
/// content for service summaries); the logtail lets readers catch up without
/// re-fetching the op stream; the quorum snapshot replays protocol state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryTree {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_summary_handle: Option<String>,
    pub logtail: Vec<SequencedOp>,
    pub quorum: QuorumSnapshot,
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
