use std::sync::Arc;
use std::time::Instant;

use models::{
    ControlContents, OpBatch, OpType, OutboundOp, QuorumSnapshot, ScribeCheckpoint, SequencedOp,
    SummaryAckContents, SummaryNackContents, SummaryProposal,
};
use tokio_util::task::AbortOnDropHandle;

use crate::checkpoint::{CheckpointManager, CheckpointReason, CheckpointRequest};
use crate::config::ScribeConfig;
use crate::context::{CheckpointMarker, CloseReason, LambdaContext, OpProducer, PartitionLambda};
use crate::metrics::SessionTracker;
use crate::pending::{PendingCheckpointMessages, PendingOpBuffer};
use crate::protocol::ProtocolHandler;
use crate::store::{CheckpointTarget, DocumentRepository, PendingMessageReader};
use crate::summary::{SummaryWriteOutcome, SummaryWriter};
use crate::Error;

/// Identity of the document a lambda instance processes.
#[derive(Debug, Clone)]
pub struct Document {
    pub tenant_id: String,
    pub document_id: String,
    /// Ephemeral containers never receive service summaries and nack client
    /// summary proposals.
    pub is_ephemeral: bool,
}

/// External collaborators injected at construction.
pub struct Collaborators {
    pub context: Arc<dyn LambdaContext>,
    pub producer: Arc<dyn OpProducer>,
    pub repository: Arc<dyn DocumentRepository>,
    /// Gap recovery. Without one, a sequence gap is fatal for the document.
    pub message_reader: Option<Arc<dyn PendingMessageReader>>,
    pub summary_writer: Arc<dyn SummaryWriter>,
}

/// The per-document stream processor. Consumes ordered op batches, advances
/// the protocol state machine to the MSN watermark, drives client and
/// service summaries, and checkpoints durable progress so a crash resumes
/// exactly where it left off.
///
/// One instance exists per claimed document; the driver serializes `handle`
/// calls. Close is terminal.
pub struct ScribeLambda {
    config: Arc<ScribeConfig>,
    tenant_id: String,
    document_id: String,
    is_ephemeral: bool,

    protocol: ProtocolHandler,
    pending: PendingOpBuffer,
    pending_checkpoint_messages: PendingCheckpointMessages,
    checkpoints: CheckpointManager,
    summary_writer: Arc<dyn SummaryWriter>,
    producer: Arc<dyn OpProducer>,
    message_reader: Option<Arc<dyn PendingMessageReader>>,
    context: Arc<dyn LambdaContext>,
    tracker: SessionTracker,

    sequence_number: u64,
    min_sequence_number: u64,
    last_offset: i64,
    protocol_head: u64,
    last_summary_sequence_number: u64,
    last_client_summary_head: Option<String>,
    valid_parent_summaries: Option<Vec<String>>,
    no_active_clients: bool,
    global_checkpoint_only: bool,
    is_corrupt: bool,

    raw_ops_since_checkpoint: u64,
    last_checkpoint_time: Instant,
    idle_checkpoint: Option<AbortOnDropHandle<()>>,
    closed: bool,
}

impl ScribeLambda {
    /// Build an instance from a persisted checkpoint plus the tail of ops
    /// fetched from storage. Tail ops already covered by the checkpoint's
    /// protocol state are dropped; ops beyond its sequence number will be
    /// re-delivered by the stream and are dropped as well.
    pub fn new(
        config: Arc<ScribeConfig>,
        document: Document,
        checkpoint: ScribeCheckpoint,
        tail: Vec<SequencedOp>,
        collaborators: Collaborators,
    ) -> Self {
        let Document {
            tenant_id,
            document_id,
            is_ephemeral,
        } = document;
        let Collaborators {
            context,
            producer,
            repository,
            message_reader,
            summary_writer,
        } = collaborators;

        let tracker = SessionTracker::new(tenant_id.as_str(), document_id.as_str());
        tracker.session_started(checkpoint.sequence_number, checkpoint.log_offset);

        let protocol = ProtocolHandler::from_snapshot(&checkpoint.protocol_state);
        let protocol_sequence_number = checkpoint.protocol_state.sequence_number;

        let mut pending = PendingOpBuffer::default();
        let mut pending_checkpoint_messages =
            PendingCheckpointMessages::new(config.max_pending_checkpoint_messages_length);
        for op in tail {
            if op.sequence_number > checkpoint.sequence_number {
                continue;
            }
            if config.enable_pending_checkpoint_messages
                && op.sequence_number > checkpoint.protocol_head
                && pending_checkpoint_messages
                    .back_sequence_number()
                    .map(|back| back < op.sequence_number)
                    .unwrap_or(true)
            {
                pending_checkpoint_messages.push(op.clone(), checkpoint.protocol_head);
            }
            if op.sequence_number > protocol_sequence_number
                && pending
                    .back_sequence_number()
                    .map(|back| back < op.sequence_number)
                    .unwrap_or(true)
            {
                pending.push_back(op);
            }
        }

        let checkpoints = CheckpointManager::new(
            tenant_id.as_str(),
            document_id.as_str(),
            repository,
            context.clone(),
            tracker.clone(),
            config.local_checkpoint_enabled,
            config.restart_on_checkpoint_failure,
        );

        Self {
            global_checkpoint_only: !config.local_checkpoint_enabled,
            config,
            tenant_id,
            document_id,
            is_ephemeral,
            protocol,
            pending,
            pending_checkpoint_messages,
            checkpoints,
            summary_writer,
            producer,
            message_reader,
            context,
            tracker,
            sequence_number: checkpoint.sequence_number,
            min_sequence_number: checkpoint.minimum_sequence_number,
            last_offset: checkpoint.log_offset,
            protocol_head: checkpoint.protocol_head,
            last_summary_sequence_number: checkpoint.last_summary_sequence_number,
            last_client_summary_head: checkpoint.last_client_summary_head,
            valid_parent_summaries: checkpoint.valid_parent_summaries,
            no_active_clients: false,
            is_corrupt: checkpoint.is_corrupt,
            raw_ops_since_checkpoint: 0,
            last_checkpoint_time: Instant::now(),
            idle_checkpoint: None,
            closed: false,
        }
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.min_sequence_number
    }

    pub fn protocol_head(&self) -> u64 {
        self.protocol_head
    }

    pub fn quorum_sequence_number(&self) -> u64 {
        self.protocol.sequence_number()
    }

    pub fn protocol_snapshot(&self) -> QuorumSnapshot {
        self.protocol.snapshot(false)
    }

    pub fn pending_ops(&self) -> Vec<SequencedOp> {
        self.pending.to_vec()
    }

    pub fn last_client_summary_head(&self) -> Option<&str> {
        self.last_client_summary_head.as_deref()
    }

    pub fn valid_parent_summaries(&self) -> Option<&[String]> {
        self.valid_parent_summaries.as_deref()
    }

    pub fn is_corrupt(&self) -> bool {
        self.is_corrupt
    }

    /// Wait for in-flight and queued checkpoint writes to settle.
    pub async fn settled(&self) {
        self.checkpoints.settled().await;
    }

    #[tracing::instrument(skip_all, fields(
        tenant_id = %self.tenant_id,
        document_id = %self.document_id,
        offset = batch.offset,
    ))]
    pub async fn handle(&mut self, batch: OpBatch) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Closed);
        }
        let marker = CheckpointMarker {
            offset: batch.offset,
            partition: batch.partition,
        };

        // Re-delivery of an already-processed offset: book-keep and
        // optionally re-acknowledge, but touch no other state.
        if batch.offset <= self.last_offset {
            self.tracker.batch_reprocessed(batch.offset);
            self.checkpoints.update_offset(marker);
            if self.config.kafka_checkpoint_on_reprocessing_op {
                self.context
                    .checkpoint(marker, self.config.restart_on_checkpoint_failure);
            }
            return Ok(());
        }
        self.last_offset = batch.offset;

        // A new batch cancels any armed idle-time checkpoint.
        self.idle_checkpoint = None;

        let mut processed = 0u64;
        for op in &batch.ops {
            // Tolerate partial-checkpoint re-delivery: ops at or below what
            // we've already seen are skipped.
            if op.sequence_number <= self.sequence_number
                || op.sequence_number <= self.last_known_sequence_number()
            {
                continue;
            }
            self.ingest(op).await?;
            processed += 1;

            if self.is_corrupt {
                // No further summary side effects for a corrupt document.
                continue;
            }
            match &op.op_type {
                OpType::Summarize if !op.is_deli_acked() => self.handle_summarize(op).await?,
                OpType::NoClient => self.handle_no_client(op).await?,
                OpType::SummaryAck => self.handle_summary_ack(op)?,
                OpType::ClientJoin => {
                    self.no_active_clients = false;
                    if self.config.local_checkpoint_enabled {
                        self.global_checkpoint_only = false;
                    }
                }
                _ => {}
            }
        }

        self.tracker.ops_processed(processed);
        self.raw_ops_since_checkpoint += batch.ops.len() as u64;
        self.checkpoints.update_offset(marker);
        self.schedule_checkpoint();
        Ok(())
    }

    /// Close the instance. In-flight checkpoint writes settle, but no new
    /// work is scheduled.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.idle_checkpoint = None;
        self.checkpoints.close();
        self.checkpoints.settled().await;
        self.tracker
            .session_closed(reason, self.sequence_number, self.protocol_head);
        self.protocol.close();
    }

    /// The highest sequence number buffered or applied.
    fn last_known_sequence_number(&self) -> u64 {
        self.pending
            .back_sequence_number()
            .unwrap_or(0)
            .max(self.protocol.sequence_number())
    }

    /// Buffer the op, healing any sequence gap first, then advance counters
    /// and drain the protocol handler to the MSN watermark.
    async fn ingest(&mut self, op: &SequencedOp) -> Result<(), Error> {
        let last_known = self.last_known_sequence_number();
        if op.sequence_number != last_known + 1 {
            self.heal_gap(last_known, op).await?;
        }

        self.pending.push_back(op.clone());
        if self.config.enable_pending_checkpoint_messages {
            self.pending_checkpoint_messages
                .push(op.clone(), self.protocol_head);
        }

        self.sequence_number = op.sequence_number;
        if op.minimum_sequence_number > self.min_sequence_number {
            self.min_sequence_number = op.minimum_sequence_number;
            if let Err(err) = self.drain_to(self.min_sequence_number) {
                return Err(self.mark_corrupt(err.into()));
            }
        }
        Ok(())
    }

    /// Fetch the missing range from the op store and append it to the
    /// pending buffer. Without a reader, or if the store cannot cover the
    /// range, the gap is fatal.
    async fn heal_gap(&mut self, last_known: u64, op: &SequencedOp) -> Result<(), Error> {
        let Some(reader) = self.message_reader.clone() else {
            return Err(Error::InvalidSequenceGap {
                expected: last_known + 1,
                got: op.sequence_number,
            });
        };
        tracing::info!(
            from = last_known,
            to = op.sequence_number,
            "fetching ops to heal a sequence gap"
        );
        let fetched = reader
            .read_ops(
                &self.tenant_id,
                &self.document_id,
                last_known,
                op.sequence_number,
            )
            .await
            .map_err(|source| Error::Storage {
                during: "gap recovery read",
                source,
            })?;
        self.tracker.gap_ops_fetched(fetched.len());

        for filled in fetched {
            let last_known = self.last_known_sequence_number();
            if filled.sequence_number <= last_known
                || filled.sequence_number >= op.sequence_number
            {
                continue;
            }
            if filled.sequence_number != last_known + 1 {
                return Err(Error::InvalidSequenceGap {
                    expected: last_known + 1,
                    got: filled.sequence_number,
                });
            }
            self.pending.push_back(filled);
        }

        let last_known = self.last_known_sequence_number();
        if op.sequence_number != last_known + 1 {
            return Err(Error::InvalidSequenceGap {
                expected: last_known + 1,
                got: op.sequence_number,
            });
        }
        Ok(())
    }

    /// Apply buffered ops through `target` to the protocol handler.
    fn drain_to(&mut self, target: u64) -> Result<(), crate::protocol::ProtocolError> {
        while self
            .pending
            .front()
            .map(|op| op.sequence_number <= target)
            .unwrap_or(false)
        {
            let op = self.pending.pop_front().expect("front was just observed");
            self.protocol.process_message(&op, false)?;
        }
        Ok(())
    }

    async fn handle_summarize(&mut self, op: &SequencedOp) -> Result<(), Error> {
        let external = self.summary_writer.is_external();
        if external && op.reference_sequence_number < self.protocol.sequence_number() {
            // The proposing client is behind the protocol state the external
            // writer will upload against; its proposal is already doomed.
            tracing::info!(
                sequence_number = op.sequence_number,
                reference_sequence_number = op.reference_sequence_number,
                "ignoring summarize op from a client behind the protocol state"
            );
            return Ok(());
        }

        // Snapshot for rollback, then advance the protocol handler to the
        // state the summary describes.
        let saved_protocol = self.protocol.snapshot(false);
        let saved_pending = self.pending.to_vec();
        if let Err(err) = self.drain_to(op.reference_sequence_number) {
            return Err(self.mark_corrupt(err.into()));
        }

        if self.protocol_head >= self.protocol.sequence_number() {
            return Ok(());
        }

        let checkpoint = self.generate_checkpoint(false);
        let pending_ops = self.pending_checkpoint_messages.to_vec();
        let writer = self.summary_writer.clone();
        let result = writer
            .write_client_summary(
                op,
                self.last_client_summary_head.as_deref(),
                &checkpoint,
                &pending_ops,
                self.is_ephemeral,
            )
            .await;

        match result {
            Ok(SummaryWriteOutcome::Ack(ack)) => {
                if !external {
                    self.send_op(OutboundOp::summary_ack(&ack), "summaryAck").await?;
                    self.send_op(
                        OutboundOp::control(&ControlContents::UpdateDurableSequenceNumber {
                            durable_sequence_number: ack.summary_proposal.summary_sequence_number,
                            is_client_summary: true,
                            clear_cache: false,
                        }),
                        "control",
                    )
                    .await?;
                    // The summary head itself advances on the SummaryAck op
                    // once it comes back through the stream.
                    self.protocol_head = ack.summary_proposal.summary_sequence_number;
                    self.last_summary_sequence_number = op.sequence_number;
                    self.pending_checkpoint_messages
                        .truncate_to_head(self.protocol_head);
                    self.tracker.summary_written("client", "ack");
                }
            }
            Ok(SummaryWriteOutcome::Nack(nack)) => {
                self.protocol.reset_to(&saved_protocol);
                self.pending.replace(saved_pending);
                if !external {
                    self.send_op(OutboundOp::summary_nack(&nack), "summaryNack").await?;
                    self.tracker.summary_written("client", "nack");
                }
            }
            Err(err) => {
                tracing::warn!(
                    sequence_number = op.sequence_number,
                    error = ?err,
                    "client summary write failed"
                );
                self.protocol.reset_to(&saved_protocol);
                self.pending.replace(saved_pending);
                if !self.config.ignore_storage_exception {
                    return Err(Error::Storage {
                        during: "client summary write",
                        source: err,
                    });
                }
                if !external {
                    let nack = SummaryNackContents {
                        message: "Summary upload failed; please retry.".to_string(),
                        summary_proposal: Some(SummaryProposal {
                            summary_sequence_number: op.sequence_number,
                        }),
                    };
                    self.send_op(OutboundOp::summary_nack(&nack), "summaryNack").await?;
                    self.tracker.summary_written("client", "nack");
                }
            }
        }
        Ok(())
    }

    async fn handle_no_client(&mut self, op: &SequencedOp) -> Result<(), Error> {
        if op.reference_sequence_number != op.sequence_number
            || op.minimum_sequence_number != op.sequence_number
        {
            return Err(self.mark_corrupt(Error::WatermarkViolation {
                sequence_number: op.sequence_number,
                reference_sequence_number: op.reference_sequence_number,
                minimum_sequence_number: op.minimum_sequence_number,
            }));
        }
        self.no_active_clients = true;
        self.global_checkpoint_only = true;

        if !self.config.generate_service_summary
            || self.is_ephemeral
            || self.config.is_transient_tenant(&self.tenant_id)
        {
            return Ok(());
        }

        let checkpoint = self.generate_checkpoint(false);
        let pending_ops = self.pending_checkpoint_messages.to_vec();
        let writer = self.summary_writer.clone();
        let result = writer
            .write_service_summary(op, self.protocol_head, &checkpoint, &pending_ops)
            .await;

        match result {
            Ok(Some(handle)) => {
                let clear_cache = self.config.clear_cache_after_service_summary;
                self.send_op(
                    OutboundOp::control(&ControlContents::UpdateDurableSequenceNumber {
                        durable_sequence_number: op.sequence_number,
                        is_client_summary: false,
                        clear_cache,
                    }),
                    "control",
                )
                .await?;
                self.last_summary_sequence_number = op.sequence_number;
                let parents = self.valid_parent_summaries.get_or_insert_with(Vec::new);
                parents.push(handle);
                let cap = self
                    .config
                    .max_tracked_service_summary_versions_since_last_client_summary;
                while parents.len() > cap {
                    parents.remove(0);
                }
                if clear_cache {
                    self.checkpoints
                        .delete(self.protocol_head, true)
                        .await
                        .map_err(|source| Error::Storage {
                            during: "checkpoint cache delete",
                            source,
                        })?;
                }
                self.tracker.summary_written("service", "ack");
            }
            Ok(None) => {
                tracing::debug!(
                    sequence_number = op.sequence_number,
                    "service summary skipped"
                );
            }
            Err(err) => {
                if self.config.ignore_storage_exception {
                    tracing::warn!(
                        sequence_number = op.sequence_number,
                        error = ?err,
                        "ignoring service summary write failure"
                    );
                } else {
                    return Err(self.mark_corrupt(Error::Storage {
                        during: "service summary write",
                        source: err,
                    }));
                }
            }
        }
        Ok(())
    }

    fn handle_summary_ack(&mut self, op: &SequencedOp) -> Result<(), Error> {
        let ack: SummaryAckContents =
            op.decode_data_or_contents()
                .map_err(|source| Error::MalformedOp {
                    op_type: op.op_type.as_str().to_string(),
                    sequence_number: op.sequence_number,
                    source,
                })?;
        self.last_client_summary_head = Some(ack.handle);
        self.valid_parent_summaries = None;
        if self.summary_writer.is_external() {
            // An external writer is authoritative: the head only advances on
            // its acks observed in the stream.
            self.protocol_head = ack.summary_proposal.summary_sequence_number;
            self.last_summary_sequence_number = ack.summary_proposal.summary_sequence_number;
            self.pending_checkpoint_messages
                .truncate_to_head(self.protocol_head);
        }
        Ok(())
    }

    async fn send_op(&self, op: OutboundOp, op_type: &'static str) -> Result<(), Error> {
        self.producer
            .send(&self.tenant_id, &self.document_id, op)
            .await
            .map_err(|source| Error::Emission { op_type, source })
    }

    fn generate_checkpoint(&self, scrub_user_data: bool) -> ScribeCheckpoint {
        ScribeCheckpoint {
            sequence_number: self.sequence_number,
            minimum_sequence_number: self.min_sequence_number,
            protocol_state: self.protocol.snapshot(scrub_user_data),
            log_offset: self.last_offset,
            last_summary_sequence_number: self.last_summary_sequence_number,
            last_client_summary_head: self.last_client_summary_head.clone(),
            valid_parent_summaries: self.valid_parent_summaries.clone(),
            protocol_head: self.protocol_head,
            is_corrupt: self.is_corrupt,
            checkpoint_timestamp: models::unix_millis(time::OffsetDateTime::now_utc()),
        }
    }

    /// Mark the document corrupt and force a checkpoint that records it,
    /// skipping the upstream acknowledgement so the batch is re-delivered.
    fn mark_corrupt(&mut self, err: Error) -> Error {
        tracing::error!(
            document_id = %self.document_id,
            sequence_number = self.sequence_number,
            error = ?err,
            "marking document as corrupt"
        );
        self.is_corrupt = true;
        self.request_checkpoint(CheckpointReason::MarkAsCorrupt, true);
        err
    }

    fn build_checkpoint_request(
        &self,
        reason: CheckpointReason,
        skip_ack: bool,
    ) -> CheckpointRequest {
        let target = self
            .checkpoints
            .target_for(self.no_active_clients, self.global_checkpoint_only);
        let scrub = match target {
            CheckpointTarget::Global => self.config.scrub_user_data_in_global_checkpoints,
            CheckpointTarget::Local => self.config.scrub_user_data_in_local_checkpoints,
        };
        CheckpointRequest {
            checkpoint: self.generate_checkpoint(scrub),
            protocol_head: self.protocol_head,
            ops_to_insert: self.pending_checkpoint_messages.to_vec(),
            no_active_clients: self.no_active_clients,
            global_only: self.global_checkpoint_only,
            mark_corrupt: self.is_corrupt,
            skip_ack,
            reason,
        }
    }

    fn request_checkpoint(&mut self, reason: CheckpointReason, skip_ack: bool) {
        let request = self.build_checkpoint_request(reason, skip_ack);
        self.checkpoints.write(request);
        self.raw_ops_since_checkpoint = 0;
        self.last_checkpoint_time = Instant::now();
    }

    /// End-of-batch checkpoint decision, in priority order.
    fn schedule_checkpoint(&mut self) {
        let heuristics = self.config.checkpoint_heuristics.clone();
        if self.no_active_clients {
            self.request_checkpoint(CheckpointReason::NoClients, false);
        } else if !heuristics.enable {
            self.request_checkpoint(CheckpointReason::EveryMessage, false);
        } else if self.raw_ops_since_checkpoint >= heuristics.max_messages {
            self.request_checkpoint(CheckpointReason::MaxMessages, false);
        } else if self.last_checkpoint_time.elapsed() >= heuristics.max_time {
            self.request_checkpoint(CheckpointReason::MaxTime, false);
        } else {
            self.arm_idle_checkpoint();
        }
    }

    /// Defer a checkpoint until the document goes idle. The armed request
    /// captures current state; a new batch aborts it before it fires.
    fn arm_idle_checkpoint(&mut self) {
        let request = self.build_checkpoint_request(CheckpointReason::IdleTime, false);
        let manager = self.checkpoints.clone();
        let idle_time = self.config.checkpoint_heuristics.idle_time;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle_time).await;
            manager.write(request);
        });
        self.idle_checkpoint = Some(AbortOnDropHandle::new(handle));
    }
}

#[async_trait::async_trait]
impl PartitionLambda for ScribeLambda {
    async fn handle(&mut self, batch: OpBatch) -> Result<(), Error> {
        ScribeLambda::handle(self, batch).await
    }

    async fn close(&mut self, reason: CloseReason) {
        ScribeLambda::close(self, reason).await
    }
}
