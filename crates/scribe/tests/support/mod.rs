#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use models::{
    Contents, OpBatch, OpType, OutboundOp, QuorumSnapshot, ScribeCheckpoint, SequencedOp,
    ServerMetadata, SummaryAckContents, SummaryProposal,
};
use scribe::{
    CheckpointMarker, CheckpointWriteOptions, Collaborators, Document, DocumentRepository,
    LambdaContext, OpProducer, PendingMessageReader, ScribeConfig, ScribeLambda,
    SummaryWriteOutcome, SummaryWriter,
};
use serde_json::json;

pub const TENANT: &str = "contoso";
pub const DOCUMENT: &str = "doc-1";

/// Everything observable the lambda did, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CheckpointWrite {
        log_offset: i64,
        is_local: bool,
        mark_corrupt: bool,
    },
    Ack {
        offset: i64,
    },
    Sent(OutboundOp),
    CheckpointDeleted {
        protocol_head: u64,
    },
}

pub type Events = Arc<Mutex<Vec<Event>>>;

pub struct MockContext {
    pub events: Events,
}

impl LambdaContext for MockContext {
    fn checkpoint(&self, marker: CheckpointMarker, _restart_on_failure: bool) {
        self.events.lock().unwrap().push(Event::Ack {
            offset: marker.offset,
        });
    }

    fn report_error(&self, _error: anyhow::Error, _restart: bool) {}
}

pub struct MockProducer {
    pub events: Events,
}

#[async_trait::async_trait]
impl OpProducer for MockProducer {
    async fn send(
        &self,
        _tenant_id: &str,
        _document_id: &str,
        op: OutboundOp,
    ) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(Event::Sent(op));
        Ok(())
    }
}

pub struct MockRepository {
    pub events: Events,
    pub written: Mutex<Vec<(ScribeCheckpoint, Vec<SequencedOp>)>>,
}

impl MockRepository {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn checkpoints(&self) -> Vec<ScribeCheckpoint> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|(checkpoint, _)| checkpoint.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl DocumentRepository for MockRepository {
    async fn update_checkpoint(
        &self,
        _tenant_id: &str,
        _document_id: &str,
        checkpoint: &ScribeCheckpoint,
        ops_to_insert: &[SequencedOp],
        options: CheckpointWriteOptions,
    ) -> anyhow::Result<()> {
        self.written
            .lock()
            .unwrap()
            .push((checkpoint.clone(), ops_to_insert.to_vec()));
        self.events.lock().unwrap().push(Event::CheckpointWrite {
            log_offset: checkpoint.log_offset,
            is_local: options.target.is_local(),
            mark_corrupt: options.mark_corrupt,
        });
        Ok(())
    }

    async fn delete_checkpoint(
        &self,
        _tenant_id: &str,
        _document_id: &str,
        protocol_head: u64,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::CheckpointDeleted { protocol_head });
        Ok(())
    }
}

/// Serves gap-recovery reads from a fixed op log.
pub struct MockReader {
    pub log: Vec<SequencedOp>,
}

#[async_trait::async_trait]
impl PendingMessageReader for MockReader {
    async fn read_ops(
        &self,
        _tenant_id: &str,
        _document_id: &str,
        from_exclusive: u64,
        to_exclusive: u64,
    ) -> anyhow::Result<Vec<SequencedOp>> {
        Ok(self
            .log
            .iter()
            .filter(|op| {
                op.sequence_number > from_exclusive && op.sequence_number < to_exclusive
            })
            .cloned()
            .collect())
    }
}

type ClientResult = anyhow::Result<SummaryWriteOutcome>;
type ServiceResult = anyhow::Result<Option<String>>;

/// Summary writer returning scripted results, acking by default.
pub struct ScriptedSummaryWriter {
    pub external: bool,
    pub client_results: Mutex<VecDeque<ClientResult>>,
    pub service_results: Mutex<VecDeque<ServiceResult>>,
    pub client_calls: Mutex<Vec<u64>>,
    pub service_calls: Mutex<Vec<u64>>,
}

impl ScriptedSummaryWriter {
    pub fn new() -> Self {
        Self {
            external: false,
            client_results: Mutex::new(VecDeque::new()),
            service_results: Mutex::new(VecDeque::new()),
            client_calls: Mutex::new(Vec::new()),
            service_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn external() -> Self {
        Self {
            external: true,
            ..Self::new()
        }
    }

    pub fn push_client_result(&self, result: ClientResult) {
        self.client_results.lock().unwrap().push_back(result);
    }

    pub fn push_service_result(&self, result: ServiceResult) {
        self.service_results.lock().unwrap().push_back(result);
    }
}

#[async_trait::async_trait]
impl SummaryWriter for ScriptedSummaryWriter {
    fn is_external(&self) -> bool {
        self.external
    }

    async fn write_client_summary(
        &self,
        op: &SequencedOp,
        _last_client_summary_head: Option<&str>,
        _checkpoint: &ScribeCheckpoint,
        _pending_ops: &[SequencedOp],
        _is_ephemeral: bool,
    ) -> anyhow::Result<SummaryWriteOutcome> {
        self.client_calls.lock().unwrap().push(op.sequence_number);
        match self.client_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(SummaryWriteOutcome::Ack(SummaryAckContents {
                handle: format!("sha-{}", op.sequence_number),
                summary_proposal: SummaryProposal {
                    summary_sequence_number: op.sequence_number,
                },
            })),
        }
    }

    async fn write_service_summary(
        &self,
        op: &SequencedOp,
        _protocol_head: u64,
        _checkpoint: &ScribeCheckpoint,
        _pending_ops: &[SequencedOp],
    ) -> anyhow::Result<Option<String>> {
        self.service_calls.lock().unwrap().push(op.sequence_number);
        match self.service_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(Some(format!("svc-{}", op.sequence_number))),
        }
    }
}

pub struct Harness {
    pub lambda: ScribeLambda,
    pub events: Events,
    pub repository: Arc<MockRepository>,
    pub writer: Arc<ScriptedSummaryWriter>,
}

impl Harness {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn sent_ops(&self) -> Vec<OutboundOp> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Sent(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn acks(&self) -> Vec<i64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                Event::Ack { offset } => Some(*offset),
                _ => None,
            })
            .collect()
    }
}

pub struct HarnessBuilder {
    config: ScribeConfig,
    checkpoint: ScribeCheckpoint,
    tail: Vec<SequencedOp>,
    writer: ScriptedSummaryWriter,
    reader_log: Option<Vec<SequencedOp>>,
    is_ephemeral: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: ScribeConfig::default(),
            checkpoint: ScribeCheckpoint::initial(),
            tail: Vec::new(),
            writer: ScriptedSummaryWriter::new(),
            reader_log: None,
            is_ephemeral: false,
        }
    }

    pub fn config(mut self, config: ScribeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn checkpoint(mut self, checkpoint: ScribeCheckpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn tail(mut self, tail: Vec<SequencedOp>) -> Self {
        self.tail = tail;
        self
    }

    pub fn writer(mut self, writer: ScriptedSummaryWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn reader_log(mut self, log: Vec<SequencedOp>) -> Self {
        self.reader_log = Some(log);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.is_ephemeral = true;
        self
    }

    pub fn build(self) -> Harness {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let repository = Arc::new(MockRepository::new(events.clone()));
        let writer = Arc::new(self.writer);

        let lambda = ScribeLambda::new(
            Arc::new(self.config),
            Document {
                tenant_id: TENANT.to_string(),
                document_id: DOCUMENT.to_string(),
                is_ephemeral: self.is_ephemeral,
            },
            self.checkpoint,
            self.tail,
            Collaborators {
                context: Arc::new(MockContext {
                    events: events.clone(),
                }),
                producer: Arc::new(MockProducer {
                    events: events.clone(),
                }),
                repository: repository.clone(),
                message_reader: self
                    .reader_log
                    .map(|log| Arc::new(MockReader { log }) as Arc<dyn PendingMessageReader>),
                summary_writer: writer.clone(),
            },
        );

        Harness {
            lambda,
            events,
            repository,
            writer,
        }
    }
}

// --- op constructors ---

pub fn plain_op(seq: u64, msn: u64) -> SequencedOp {
    SequencedOp {
        sequence_number: seq,
        minimum_sequence_number: msn,
        reference_sequence_number: 0,
        client_id: Some("client-a".to_string()),
        op_type: OpType::Op,
        contents: None,
        data: None,
        server_metadata: None,
        traces: Vec::new(),
        timestamp: 0,
    }
}

pub fn join_op(seq: u64, msn: u64, client_id: &str) -> SequencedOp {
    SequencedOp {
        op_type: OpType::ClientJoin,
        contents: Some(Contents::Decoded(json!({
            "clientId": client_id,
            "detail": {
                "user": {"id": format!("user-{client_id}")},
                "mode": "write",
            },
        }))),
        ..plain_op(seq, msn)
    }
}

pub fn leave_op(seq: u64, msn: u64, client_id: &str) -> SequencedOp {
    SequencedOp {
        op_type: OpType::ClientLeave,
        contents: Some(Contents::Decoded(json!(client_id))),
        ..plain_op(seq, msn)
    }
}

pub fn propose_op(seq: u64, msn: u64, key: &str, value: u64) -> SequencedOp {
    SequencedOp {
        op_type: OpType::Propose,
        contents: Some(Contents::Decoded(json!({"key": key, "value": value}))),
        ..plain_op(seq, msn)
    }
}

pub fn summarize_op(seq: u64, ref_seq: u64, head: &str) -> SequencedOp {
    SequencedOp {
        op_type: OpType::Summarize,
        reference_sequence_number: ref_seq,
        contents: Some(Contents::Decoded(json!({
            "handle": "app-tree",
            "head": head,
            "message": "client summary",
        }))),
        ..plain_op(seq, 0)
    }
}

pub fn deli_acked(mut op: SequencedOp) -> SequencedOp {
    op.server_metadata = Some(ServerMetadata { deli_acked: true });
    op
}

pub fn no_client_op(seq: u64) -> SequencedOp {
    SequencedOp {
        op_type: OpType::NoClient,
        reference_sequence_number: seq,
        minimum_sequence_number: seq,
        client_id: None,
        ..plain_op(seq, seq)
    }
}

pub fn summary_ack_op(seq: u64, msn: u64, handle: &str, summary_seq: u64) -> SequencedOp {
    SequencedOp {
        op_type: OpType::SummaryAck,
        client_id: None,
        data: Some(Contents::Decoded(json!({
            "handle": handle,
            "summaryProposal": {"summarySequenceNumber": summary_seq},
        }))),
        ..plain_op(seq, msn)
    }
}

pub fn batch(offset: i64, ops: Vec<SequencedOp>) -> OpBatch {
    OpBatch {
        tenant_id: TENANT.to_string(),
        document_id: DOCUMENT.to_string(),
        offset,
        partition: 0,
        ops,
    }
}

/// A checkpoint whose protocol state sits at `protocol_seq` while the
/// lambda-level counters sit at `seq`; ops in between come from the tail.
pub fn seeded_checkpoint(seq: u64, protocol_seq: u64, protocol_head: u64) -> ScribeCheckpoint {
    ScribeCheckpoint {
        sequence_number: seq,
        minimum_sequence_number: protocol_seq,
        protocol_state: QuorumSnapshot {
            sequence_number: protocol_seq,
            minimum_sequence_number: protocol_seq,
            ..QuorumSnapshot::default()
        },
        log_offset: 0,
        last_summary_sequence_number: protocol_head,
        last_client_summary_head: None,
        valid_parent_summaries: None,
        protocol_head,
        is_corrupt: false,
        checkpoint_timestamp: 0,
    }
}
