use models::{ScribeCheckpoint, SequencedOp, SummaryTree};

/// Which document record a checkpoint write lands in: the canonical record
/// visible to other partitions, or the faster partition-local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTarget {
    Global,
    Local,
}

impl CheckpointTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointTarget::Global => "global",
            CheckpointTarget::Local => "local",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, CheckpointTarget::Local)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckpointWriteOptions {
    pub target: CheckpointTarget,
    pub mark_corrupt: bool,
    pub no_active_clients: bool,
}

/// Store of per-document checkpoint records and their backing ops.
#[async_trait::async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Atomically persist the checkpoint to the document record and insert
    /// `ops_to_insert` into the op store. Op insertion is idempotent per
    /// sequence number.
    async fn update_checkpoint(
        &self,
        tenant_id: &str,
        document_id: &str,
        checkpoint: &ScribeCheckpoint,
        ops_to_insert: &[SequencedOp],
        options: CheckpointWriteOptions,
    ) -> anyhow::Result<()>;

    /// Invalidate cached checkpoint state below `protocol_head`, after a
    /// service summary that demands cache clearing.
    async fn delete_checkpoint(
        &self,
        tenant_id: &str,
        document_id: &str,
        protocol_head: u64,
    ) -> anyhow::Result<()>;
}

/// Reads back ops the stream skipped over, for gap recovery after a
/// partial-checkpoint redelivery.
#[async_trait::async_trait]
pub trait PendingMessageReader: Send + Sync {
    /// Ordered ops with sequence numbers strictly inside
    /// `(from_exclusive, to_exclusive)`.
    async fn read_ops(
        &self,
        tenant_id: &str,
        document_id: &str,
        from_exclusive: u64,
        to_exclusive: u64,
    ) -> anyhow::Result<Vec<SequencedOp>>;
}

/// Git-like content store holding versioned document snapshots.
#[async_trait::async_trait]
pub trait SummaryStore: Send + Sync {
    /// Write a snapshot referencing `parents`, returning its handle.
    async fn write_summary(
        &self,
        tenant_id: &str,
        document_id: &str,
        tree: SummaryTree,
        parents: Vec<String>,
    ) -> anyhow::Result<String>;
}
