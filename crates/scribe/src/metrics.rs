use std::time::Duration;

use crate::checkpoint::CheckpointReason;
use crate::context::CloseReason;
use crate::store::CheckpointTarget;

/// Per-document instrumentation. Output-only: nothing observable depends on
/// it. Counter series are labelled by tenant so per-tenant dashboards come
/// for free; high-cardinality document ids stay in tracing fields only.
#[derive(Clone)]
pub struct SessionTracker {
    tenant_id: String,
    document_id: String,
}

impl SessionTracker {
    pub fn new(tenant_id: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            document_id: document_id.into(),
        }
    }

    pub fn session_started(&self, sequence_number: u64, log_offset: i64) {
        tracing::info!(
            tenant_id = %self.tenant_id,
            document_id = %self.document_id,
            sequence_number,
            log_offset,
            "scribe session started"
        );
        metrics::counter!("scribe_sessions_started", "tenant" => self.tenant_id.clone())
            .increment(1);
    }

    pub fn session_closed(&self, reason: CloseReason, sequence_number: u64, protocol_head: u64) {
        tracing::info!(
            tenant_id = %self.tenant_id,
            document_id = %self.document_id,
            reason = reason.as_str(),
            sequence_number,
            protocol_head,
            "scribe session closed"
        );
        metrics::counter!(
            "scribe_sessions_closed",
            "tenant" => self.tenant_id.clone(),
            "reason" => reason.as_str(),
        )
        .increment(1);
    }

    pub fn batch_reprocessed(&self, offset: i64) {
        tracing::info!(
            document_id = %self.document_id,
            offset,
            "skipping batch at an already-processed offset"
        );
        metrics::counter!("scribe_batches_reprocessed", "tenant" => self.tenant_id.clone())
            .increment(1);
    }

    pub fn ops_processed(&self, count: u64) {
        metrics::counter!("scribe_ops_processed", "tenant" => self.tenant_id.clone())
            .increment(count);
    }

    pub fn gap_ops_fetched(&self, count: usize) {
        metrics::counter!("scribe_gap_ops_fetched", "tenant" => self.tenant_id.clone())
            .increment(count as u64);
    }

    pub fn checkpoint_written(
        &self,
        reason: CheckpointReason,
        target: CheckpointTarget,
        elapsed: Duration,
    ) {
        metrics::counter!(
            "scribe_checkpoints_written",
            "tenant" => self.tenant_id.clone(),
            "reason" => reason.as_str(),
            "target" => target.as_str(),
        )
        .increment(1);
        metrics::histogram!("scribe_checkpoint_write_seconds", "tenant" => self.tenant_id.clone())
            .record(elapsed.as_secs_f64());
    }

    pub fn checkpoint_failed(&self, reason: CheckpointReason) {
        metrics::counter!(
            "scribe_checkpoint_failures",
            "tenant" => self.tenant_id.clone(),
            "reason" => reason.as_str(),
        )
        .increment(1);
    }

    pub fn summary_written(&self, kind: &'static str, outcome: &'static str) {
        metrics::counter!(
            "scribe_summaries",
            "tenant" => self.tenant_id.clone(),
            "kind" => kind,
            "outcome" => outcome,
        )
        .increment(1);
    }
}
