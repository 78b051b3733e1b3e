mod checkpoint;
mod ops;
mod quorum;
mod summary;

pub use checkpoint::ScribeCheckpoint;
pub use ops::{
    Contents, DecodeError, OpBatch, OpType, OutboundOp, SequencedOp, ServerMetadata, Trace,
};
pub use quorum::{
    ClientDetail, ClientJoinContents, CommittedValue, ProposeContents, QuorumProposal,
    QuorumSnapshot, QuorumUser, SequencedClient, SCRUBBED_USER_PREFIX,
};
pub use summary::{
    ControlContents, SummarizeContents, SummaryAckContents, SummaryNackContents, SummaryProposal,
    SummaryTree,
};

/// Milliseconds since the unix epoch, as carried by checkpoint and op timestamps.
pub fn unix_millis(ts: time::OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}
