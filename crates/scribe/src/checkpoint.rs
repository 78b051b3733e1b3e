use std::sync::{Arc, Mutex};
use std::time::Instant;

use models::{ScribeCheckpoint, SequencedOp};
use tokio::sync::watch;

use crate::context::{CheckpointMarker, LambdaContext};
use crate::metrics::SessionTracker;
use crate::store::{CheckpointTarget, CheckpointWriteOptions, DocumentRepository};

/// Why a checkpoint was requested, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    MarkAsCorrupt,
    NoClients,
    EveryMessage,
    MaxMessages,
    MaxTime,
    IdleTime,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::MarkAsCorrupt => "markAsCorrupt",
            CheckpointReason::NoClients => "noClients",
            CheckpointReason::EveryMessage => "everyMessage",
            CheckpointReason::MaxMessages => "maxMessages",
            CheckpointReason::MaxTime => "maxTime",
            CheckpointReason::IdleTime => "idleTime",
        }
    }
}

/// A durable-progress request: the checkpoint record, the pending ops that
/// back it, and how it should be persisted and acknowledged.
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub checkpoint: ScribeCheckpoint,
    pub protocol_head: u64,
    pub ops_to_insert: Vec<SequencedOp>,
    pub no_active_clients: bool,
    pub global_only: bool,
    pub mark_corrupt: bool,
    /// Persist without acknowledging the stream offset, so the batch is
    /// re-delivered after a restart.
    pub skip_ack: bool,
    pub reason: CheckpointReason,
}

struct Slot {
    in_flight: bool,
    /// Successor register: the newest superseding (request, marker) pair,
    /// flushed when the in-flight write settles.
    next: Option<(CheckpointRequest, Option<CheckpointMarker>)>,
    /// Most recent message bookkeeping; a firing checkpoint acknowledges
    /// this marker.
    marker: Option<CheckpointMarker>,
    closed: bool,
}

struct Inner {
    tenant_id: String,
    document_id: String,
    repository: Arc<dyn DocumentRepository>,
    context: Arc<dyn LambdaContext>,
    tracker: SessionTracker,
    local_checkpoint_enabled: bool,
    restart_on_checkpoint_failure: bool,
    slot: Mutex<Slot>,
    busy: watch::Sender<bool>,
}

/// Coordinates persistence of scribe checkpoints and their paired upstream
/// offset acknowledgements. At most one repository write is in flight per
/// document; newer requests supersede any queued one. The acknowledgement
/// is issued only after its checkpoint write succeeded.
#[derive(Clone)]
pub struct CheckpointManager {
    inner: Arc<Inner>,
}

impl CheckpointManager {
    pub fn new(
        tenant_id: impl Into<String>,
        document_id: impl Into<String>,
        repository: Arc<dyn DocumentRepository>,
        context: Arc<dyn LambdaContext>,
        tracker: SessionTracker,
        local_checkpoint_enabled: bool,
        restart_on_checkpoint_failure: bool,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tenant_id: tenant_id.into(),
                document_id: document_id.into(),
                repository,
                context,
                tracker,
                local_checkpoint_enabled,
                restart_on_checkpoint_failure,
                slot: Mutex::new(Slot {
                    in_flight: false,
                    next: None,
                    marker: None,
                    closed: false,
                }),
                busy,
            }),
        }
    }

    /// Record the most recent message so a later checkpoint acknowledges it.
    pub fn update_offset(&self, marker: CheckpointMarker) {
        self.inner.slot.lock().unwrap().marker = Some(marker);
    }

    /// The persistence target a checkpoint with these properties selects.
    pub fn target_for(&self, no_active_clients: bool, global_only: bool) -> CheckpointTarget {
        if no_active_clients || global_only || !self.inner.local_checkpoint_enabled {
            CheckpointTarget::Global
        } else {
            CheckpointTarget::Local
        }
    }

    /// Request a durable write. Returns immediately: the write runs on a
    /// background task, and a newer request replaces any queued one.
    pub fn write(&self, request: CheckpointRequest) {
        let mut slot = self.inner.slot.lock().unwrap();
        if slot.closed {
            tracing::debug!(
                document_id = %self.inner.document_id,
                "dropping checkpoint request for a closed document"
            );
            return;
        }
        let marker = slot.marker;
        if slot.in_flight {
            slot.next = Some((request, marker));
        } else {
            slot.in_flight = true;
            let _ = self.inner.busy.send(true);
            tokio::spawn(Self::drive(self.inner.clone(), request, marker));
        }
    }

    /// Invalidate cached checkpoint state after a cache-clearing service
    /// summary. A deferred delete runs on a background task.
    pub async fn delete(&self, protocol_head: u64, deferred: bool) -> anyhow::Result<()> {
        if deferred {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(err) = inner
                    .repository
                    .delete_checkpoint(&inner.tenant_id, &inner.document_id, protocol_head)
                    .await
                {
                    tracing::warn!(
                        document_id = %inner.document_id,
                        protocol_head,
                        error = ?err,
                        "deferred checkpoint delete failed"
                    );
                }
            });
            Ok(())
        } else {
            self.inner
                .repository
                .delete_checkpoint(&self.inner.tenant_id, &self.inner.document_id, protocol_head)
                .await
        }
    }

    /// Stop scheduling follow-up work. An in-flight write still settles.
    pub fn close(&self) {
        let mut slot = self.inner.slot.lock().unwrap();
        slot.closed = true;
        slot.next = None;
    }

    /// Wait until no write is in flight or queued.
    pub async fn settled(&self) {
        let mut busy = self.inner.busy.subscribe();
        while *busy.borrow() {
            if busy.changed().await.is_err() {
                return;
            }
        }
    }

    async fn drive(
        inner: Arc<Inner>,
        mut request: CheckpointRequest,
        mut marker: Option<CheckpointMarker>,
    ) {
        loop {
            let target = if request.no_active_clients
                || request.global_only
                || !inner.local_checkpoint_enabled
            {
                CheckpointTarget::Global
            } else {
                CheckpointTarget::Local
            };
            let started = Instant::now();
            let result = inner
                .repository
                .update_checkpoint(
                    &inner.tenant_id,
                    &inner.document_id,
                    &request.checkpoint,
                    &request.ops_to_insert,
                    CheckpointWriteOptions {
                        target,
                        mark_corrupt: request.mark_corrupt,
                        no_active_clients: request.no_active_clients,
                    },
                )
                .await;

            match result {
                Ok(()) => {
                    inner
                        .tracker
                        .checkpoint_written(request.reason, target, started.elapsed());
                    match (request.skip_ack, marker) {
                        (false, Some(marker)) => inner
                            .context
                            .checkpoint(marker, inner.restart_on_checkpoint_failure),
                        (false, None) => tracing::debug!(
                            document_id = %inner.document_id,
                            "no offset bookkeeping yet, skipping acknowledgement"
                        ),
                        (true, _) => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        document_id = %inner.document_id,
                        reason = request.reason.as_str(),
                        log_offset = request.checkpoint.log_offset,
                        error = ?err,
                        "checkpoint write failed, skipping offset acknowledgement"
                    );
                    inner.tracker.checkpoint_failed(request.reason);
                    if inner.restart_on_checkpoint_failure {
                        inner.context.report_error(err, true);
                    }
                }
            }

            let mut slot = inner.slot.lock().unwrap();
            match slot.next.take() {
                Some((next_request, next_marker)) if !slot.closed => {
                    request = next_request;
                    marker = next_marker;
                }
                _ => {
                    slot.in_flight = false;
                    drop(slot);
                    let _ = inner.busy.send(false);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::QuorumSnapshot;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq)]
    enum Event {
        Write(i64),
        Ack(i64),
    }

    struct GatedRepository {
        release: tokio::sync::Semaphore,
        events: Arc<Mutex<Vec<Event>>>,
        fail_offsets: Vec<i64>,
    }

    #[async_trait::async_trait]
    impl DocumentRepository for GatedRepository {
        async fn update_checkpoint(
            &self,
            _tenant_id: &str,
            _document_id: &str,
            checkpoint: &ScribeCheckpoint,
            _ops_to_insert: &[SequencedOp],
            _options: CheckpointWriteOptions,
        ) -> anyhow::Result<()> {
            self.release.acquire().await.unwrap().forget();
            if self.fail_offsets.contains(&checkpoint.log_offset) {
                anyhow::bail!("injected write failure");
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::Write(checkpoint.log_offset));
            Ok(())
        }

        async fn delete_checkpoint(
            &self,
            _tenant_id: &str,
            _document_id: &str,
            _protocol_head: u64,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct RecordingContext {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl LambdaContext for RecordingContext {
        fn checkpoint(&self, marker: CheckpointMarker, _restart_on_failure: bool) {
            self.events.lock().unwrap().push(Event::Ack(marker.offset));
        }

        fn report_error(&self, _error: anyhow::Error, _restart: bool) {}
    }

    fn request(offset: i64) -> CheckpointRequest {
        CheckpointRequest {
            checkpoint: ScribeCheckpoint {
                sequence_number: 0,
                minimum_sequence_number: 0,
                protocol_state: QuorumSnapshot::default(),
                log_offset: offset,
                last_summary_sequence_number: 0,
                last_client_summary_head: None,
                valid_parent_summaries: None,
                protocol_head: 0,
                is_corrupt: false,
                checkpoint_timestamp: 0,
            },
            protocol_head: 0,
            ops_to_insert: Vec::new(),
            no_active_clients: false,
            global_only: false,
            mark_corrupt: false,
            skip_ack: false,
            reason: CheckpointReason::EveryMessage,
        }
    }

    fn manager(
        permits: usize,
        fail_offsets: Vec<i64>,
    ) -> (CheckpointManager, Arc<Mutex<Vec<Event>>>, Arc<GatedRepository>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let repository = Arc::new(GatedRepository {
            release: tokio::sync::Semaphore::new(permits),
            events: events.clone(),
            fail_offsets,
        });
        let context = Arc::new(RecordingContext {
            events: events.clone(),
        });
        let manager = CheckpointManager::new(
            "tenant",
            "doc",
            repository.clone(),
            context,
            SessionTracker::new("tenant", "doc"),
            false,
            false,
        );
        (manager, events, repository)
    }

    #[tokio::test]
    async fn test_write_then_ack_ordering() {
        let (manager, events, _repo) = manager(1, Vec::new());
        manager.update_offset(CheckpointMarker {
            offset: 10,
            partition: 0,
        });
        manager.write(request(10));
        manager.settled().await;

        assert_eq!(*events.lock().unwrap(), vec![Event::Write(10), Event::Ack(10)]);
    }

    #[tokio::test]
    async fn test_newest_queued_request_supersedes() {
        let (manager, events, repo) = manager(0, Vec::new());
        for offset in [10, 11, 12] {
            manager.update_offset(CheckpointMarker {
                offset,
                partition: 0,
            });
            manager.write(request(offset));
        }
        // Offset 10 is in flight; 12 superseded 11 in the successor slot.
        repo.release.add_permits(2);
        manager.settled().await;

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Write(10),
                Event::Ack(10),
                Event::Write(12),
                Event::Ack(12)
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_write_skips_acknowledgement() {
        let (manager, events, _repo) = manager(2, vec![10]);
        manager.update_offset(CheckpointMarker {
            offset: 10,
            partition: 0,
        });
        manager.write(request(10));
        manager.settled().await;
        assert!(events.lock().unwrap().is_empty());

        manager.update_offset(CheckpointMarker {
            offset: 11,
            partition: 0,
        });
        manager.write(request(11));
        manager.settled().await;
        assert_eq!(*events.lock().unwrap(), vec![Event::Write(11), Event::Ack(11)]);
    }

    #[tokio::test]
    async fn test_skip_ack_persists_without_acknowledging() {
        let (manager, events, _repo) = manager(1, Vec::new());
        manager.update_offset(CheckpointMarker {
            offset: 10,
            partition: 0,
        });
        let mut corrupt = request(10);
        corrupt.skip_ack = true;
        corrupt.mark_corrupt = true;
        corrupt.reason = CheckpointReason::MarkAsCorrupt;
        manager.write(corrupt);
        manager.settled().await;

        assert_eq!(*events.lock().unwrap(), vec![Event::Write(10)]);
    }

    #[tokio::test]
    async fn test_close_drops_queued_successor() {
        let (manager, events, repo) = manager(0, Vec::new());
        manager.update_offset(CheckpointMarker {
            offset: 10,
            partition: 0,
        });
        manager.write(request(10));
        manager.update_offset(CheckpointMarker {
            offset: 11,
            partition: 0,
        });
        manager.write(request(11));

        manager.close();
        repo.release.add_permits(2);
        manager.settled().await;

        // The in-flight write settled; the queued one was never flushed.
        assert_eq!(*events.lock().unwrap(), vec![Event::Write(10), Event::Ack(10)]);
    }

    #[test]
    fn test_target_selection() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let repository = Arc::new(GatedRepository {
            release: tokio::sync::Semaphore::new(0),
            events: events.clone(),
            fail_offsets: Vec::new(),
        });
        let context = Arc::new(RecordingContext { events });

        let local_enabled = CheckpointManager::new(
            "tenant",
            "doc",
            repository.clone(),
            context.clone(),
            SessionTracker::new("tenant", "doc"),
            true,
            false,
        );
        assert_eq!(local_enabled.target_for(false, false), CheckpointTarget::Local);
        assert_eq!(local_enabled.target_for(true, false), CheckpointTarget::Global);
        assert_eq!(local_enabled.target_for(false, true), CheckpointTarget::Global);

        let local_disabled = CheckpointManager::new(
            "tenant",
            "doc",
            repository,
            context,
            SessionTracker::new("tenant", "doc"),
            false,
            false,
        );
        assert_eq!(local_disabled.target_for(false, false), CheckpointTarget::Global);
    }
}
