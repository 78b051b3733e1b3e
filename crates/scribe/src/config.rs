use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Tuning of when the lambda persists a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointHeuristics {
    /// When false, a checkpoint is requested after every processed batch.
    pub enable: bool,
    /// Checkpoint once this many raw messages arrived since the last one.
    pub max_messages: u64,
    /// Checkpoint once this much time elapsed since the last one.
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,
    /// With no other condition met, checkpoint after this much time without
    /// a new batch. Cancelled by the next batch.
    #[serde(with = "humantime_serde")]
    pub idle_time: Duration,
}

impl Default for CheckpointHeuristics {
    fn default() -> Self {
        Self {
            enable: false,
            max_messages: 500,
            max_time: Duration::from_secs(60),
            idle_time: Duration::from_secs(10),
        }
    }
}

/// Per-deployment configuration of the scribe worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScribeConfig {
    /// Buffer processed ops for attachment to the next summary's logtail
    /// and for insertion alongside checkpoints.
    pub enable_pending_checkpoint_messages: bool,
    /// Write service summaries when a document loses its last client.
    pub generate_service_summary: bool,
    pub scrub_user_data_in_summaries: bool,
    pub scrub_user_data_in_global_checkpoints: bool,
    pub scrub_user_data_in_local_checkpoints: bool,
    /// Invalidate cached checkpoint state after each service summary.
    pub clear_cache_after_service_summary: bool,
    /// Treat summary storage failures as retryable: nack client summaries
    /// and carry on, rather than surfacing the error to the driver.
    pub ignore_storage_exception: bool,
    pub max_tracked_service_summary_versions_since_last_client_summary: usize,
    pub max_pending_checkpoint_messages_length: usize,
    pub checkpoint_heuristics: CheckpointHeuristics,
    /// Re-acknowledge the offset of an already-processed batch without a new
    /// checkpoint write. Disable for drivers that require strictly
    /// increasing acknowledged offsets.
    pub kafka_checkpoint_on_reprocessing_op: bool,
    /// Ask the driver to restart the lambda when a checkpoint write fails.
    pub restart_on_checkpoint_failure: bool,
    /// Permit partition-local checkpoints between global ones.
    pub local_checkpoint_enabled: bool,
    pub disable_transient_tenant_filtering: bool,
    /// Tenants whose documents are short-lived; service summaries for them
    /// are skipped unless filtering is disabled.
    pub transient_tenants: BTreeSet<String>,
}

impl Default for ScribeConfig {
    fn default() -> Self {
        Self {
            enable_pending_checkpoint_messages: true,
            generate_service_summary: true,
            scrub_user_data_in_summaries: false,
            scrub_user_data_in_global_checkpoints: false,
            scrub_user_data_in_local_checkpoints: true,
            clear_cache_after_service_summary: false,
            ignore_storage_exception: false,
            max_tracked_service_summary_versions_since_last_client_summary: 10,
            max_pending_checkpoint_messages_length: 2000,
            checkpoint_heuristics: CheckpointHeuristics::default(),
            kafka_checkpoint_on_reprocessing_op: true,
            restart_on_checkpoint_failure: true,
            local_checkpoint_enabled: false,
            disable_transient_tenant_filtering: false,
            transient_tenants: BTreeSet::new(),
        }
    }
}

impl ScribeConfig {
    /// Whether service summaries are filtered out for this tenant.
    pub fn is_transient_tenant(&self, tenant_id: &str) -> bool {
        !self.disable_transient_tenant_filtering && self.transient_tenants.contains(tenant_id)
    }
}
