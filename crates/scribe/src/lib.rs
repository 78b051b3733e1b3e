mod checkpoint;
mod config;
mod context;
mod lambda;
mod metrics;
mod pending;
mod protocol;
mod store;
mod summary;

pub use checkpoint::{CheckpointManager, CheckpointReason, CheckpointRequest};
pub use config::{CheckpointHeuristics, ScribeConfig};
pub use context::{CheckpointMarker, CloseReason, LambdaContext, OpProducer, PartitionLambda};
pub use lambda::{Collaborators, Document, ScribeLambda};
pub use metrics::SessionTracker;
pub use pending::{PendingCheckpointMessages, PendingOpBuffer};
pub use protocol::{ProtocolError, ProtocolHandler, QuorumObserver};
pub use store::{
    CheckpointTarget, CheckpointWriteOptions, DocumentRepository, PendingMessageReader,
    SummaryStore,
};
pub use summary::{StoreSummaryWriter, SummaryWriteOutcome, SummaryWriter};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An op arrived out of sequence and no pending message reader is
    /// available (or the op store could not cover the range).
    #[error("op sequence gap: expected {expected}, got {got}")]
    InvalidSequenceGap { expected: u64, got: u64 },

    #[error("protocol violation")]
    Protocol(#[from] ProtocolError),

    /// A NoClient op must carry its own sequence number as both the
    /// reference sequence number and the MSN.
    #[error(
        "noClient op {sequence_number} carries refSeq {reference_sequence_number} \
         and msn {minimum_sequence_number}"
    )]
    WatermarkViolation {
        sequence_number: u64,
        reference_sequence_number: u64,
        minimum_sequence_number: u64,
    },

    /// A collaborator write failed for reasons that may succeed on retry.
    #[error("{during} failed")]
    Storage {
        during: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to emit {op_type} op")]
    Emission {
        op_type: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed {op_type} contents at sequence number {sequence_number}")]
    MalformedOp {
        op_type: String,
        sequence_number: u64,
        #[source]
        source: models::DecodeError,
    },

    #[error("lambda is closed")]
    Closed,
}
