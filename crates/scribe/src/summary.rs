use std::sync::Arc;

use models::{
    ScribeCheckpoint, SequencedOp, SummarizeContents, SummaryAckContents, SummaryNackContents,
    SummaryProposal, SummaryTree,
};

use crate::store::SummaryStore;

/// Outcome of a client summary attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryWriteOutcome {
    Ack(SummaryAckContents),
    Nack(SummaryNackContents),
}

/// Writes client and service summaries to the content store.
///
/// With `is_external`, a separate service is authoritative for uploading
/// client summaries: the lambda must not emit SummaryAck/SummaryNack itself
/// and only advances its protocol head upon seeing a SummaryAck op.
#[async_trait::async_trait]
pub trait SummaryWriter: Send + Sync {
    fn is_external(&self) -> bool;

    /// Assemble and store a snapshot for a client's Summarize proposal.
    /// Validation failures are Nacks; storage failures are errors so the
    /// caller's retry policy applies.
    async fn write_client_summary(
        &self,
        op: &SequencedOp,
        last_client_summary_head: Option<&str>,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedOp],
        is_ephemeral: bool,
    ) -> anyhow::Result<SummaryWriteOutcome>;

    /// Produce a server-initiated snapshot when the document has no active
    /// clients. Returns None when there is nothing new to summarize.
    async fn write_service_summary(
        &self,
        op: &SequencedOp,
        protocol_head: u64,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedOp],
    ) -> anyhow::Result<Option<String>>;
}

/// Summary writer backed by a git-like content store.
pub struct StoreSummaryWriter {
    store: Arc<dyn SummaryStore>,
    tenant_id: String,
    document_id: String,
    scrub_user_data: bool,
}

impl StoreSummaryWriter {
    pub fn new(
        store: Arc<dyn SummaryStore>,
        tenant_id: impl Into<String>,
        document_id: impl Into<String>,
        scrub_user_data: bool,
    ) -> Self {
        Self {
            store,
            tenant_id: tenant_id.into(),
            document_id: document_id.into(),
            scrub_user_data,
        }
    }

    pub fn from_config(
        store: Arc<dyn SummaryStore>,
        tenant_id: impl Into<String>,
        document_id: impl Into<String>,
        config: &crate::config::ScribeConfig,
    ) -> Self {
        Self::new(
            store,
            tenant_id,
            document_id,
            config.scrub_user_data_in_summaries,
        )
    }

    /// Ops in `(protocol_head, through]`, which a summary appends so readers
    /// can catch up without re-fetching the op stream.
    fn logtail(
        pending_ops: &[SequencedOp],
        protocol_head: u64,
        through: u64,
    ) -> Vec<SequencedOp> {
        pending_ops
            .iter()
            .filter(|op| op.sequence_number > protocol_head && op.sequence_number <= through)
            .cloned()
            .collect()
    }

    fn parents(checkpoint: &ScribeCheckpoint) -> Vec<String> {
        let mut parents = Vec::new();
        if let Some(head) = &checkpoint.last_client_summary_head {
            parents.push(head.clone());
        }
        if let Some(service_parents) = &checkpoint.valid_parent_summaries {
            parents.extend(service_parents.iter().cloned());
        }
        parents
    }

    fn nack(message: String, sequence_number: u64) -> SummaryWriteOutcome {
        SummaryWriteOutcome::Nack(SummaryNackContents {
            message,
            summary_proposal: Some(SummaryProposal {
                summary_sequence_number: sequence_number,
            }),
        })
    }
}

#[async_trait::async_trait]
impl SummaryWriter for StoreSummaryWriter {
    fn is_external(&self) -> bool {
        false
    }

    async fn write_client_summary(
        &self,
        op: &SequencedOp,
        last_client_summary_head: Option<&str>,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedOp],
        is_ephemeral: bool,
    ) -> anyhow::Result<SummaryWriteOutcome> {
        if is_ephemeral {
            return Ok(Self::nack(
                "Ephemeral containers do not persist summaries.".to_string(),
                op.sequence_number,
            ));
        }
        let contents: SummarizeContents = match op.decode_contents() {
            Ok(contents) => contents,
            Err(err) => {
                return Ok(Self::nack(
                    format!("Invalid summarize op contents: {err}."),
                    op.sequence_number,
                ));
            }
        };

        // The client must build on the summary lineage this service knows:
        // either the current head, or a tracked service summary above it.
        let known_parent = match last_client_summary_head {
            None => true,
            Some(head) if head == contents.head => true,
            Some(_) => checkpoint
                .valid_parent_summaries
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|parent| parent == &contents.head),
        };
        if !known_parent {
            return Ok(Self::nack(
                format!(
                    "Proposed parent summary '{}' does not match the current head '{}'.",
                    contents.head,
                    last_client_summary_head.unwrap_or_default(),
                ),
                op.sequence_number,
            ));
        }

        let quorum = if self.scrub_user_data {
            checkpoint.protocol_state.scrubbed()
        } else {
            checkpoint.protocol_state.clone()
        };
        let tree = SummaryTree {
            app_summary_handle: Some(contents.handle.clone()),
            logtail: Self::logtail(pending_ops, checkpoint.protocol_head, op.sequence_number),
            quorum,
            sequence_number: op.sequence_number,
            message: Some(contents.message.clone()),
        };

        let handle = self
            .store
            .write_summary(&self.tenant_id, &self.document_id, tree, Self::parents(checkpoint))
            .await?;

        tracing::debug!(
            document_id = %self.document_id,
            sequence_number = op.sequence_number,
            handle = %handle,
            "wrote client summary"
        );
        Ok(SummaryWriteOutcome::Ack(SummaryAckContents {
            handle,
            summary_proposal: SummaryProposal {
                summary_sequence_number: op.sequence_number,
            },
        }))
    }

    async fn write_service_summary(
        &self,
        op: &SequencedOp,
        protocol_head: u64,
        checkpoint: &ScribeCheckpoint,
        pending_ops: &[SequencedOp],
    ) -> anyhow::Result<Option<String>> {
        if checkpoint.sequence_number <= checkpoint.last_summary_sequence_number {
            // Everything is already covered by a summary.
            return Ok(None);
        }

        let quorum = if self.scrub_user_data {
            checkpoint.protocol_state.scrubbed()
        } else {
            checkpoint.protocol_state.clone()
        };
        // The app tree is inherited from the last client summary.
        let tree = SummaryTree {
            app_summary_handle: checkpoint.last_client_summary_head.clone(),
            logtail: Self::logtail(pending_ops, protocol_head, checkpoint.sequence_number),
            quorum,
            sequence_number: checkpoint.sequence_number,
            message: None,
        };

        let handle = self
            .store
            .write_summary(&self.tenant_id, &self.document_id, tree, Self::parents(checkpoint))
            .await?;

        tracing::debug!(
            document_id = %self.document_id,
            sequence_number = op.sequence_number,
            handle = %handle,
            "wrote service summary"
        );
        Ok(Some(handle))
    }
}
