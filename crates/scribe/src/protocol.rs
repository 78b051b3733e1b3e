use std::collections::BTreeMap;

use models::{
    ClientJoinContents, CommittedValue, OpType, ProposeContents, QuorumProposal, QuorumSnapshot,
    SequencedClient, SequencedOp,
};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("op {got} does not follow sequence number {expected}")]
    SequenceOutOfOrder { expected: u64, got: u64 },
    #[error("minimum sequence number regressed from {from} to {to}")]
    MinimumSequenceRegressed { from: u64, to: u64 },
    #[error("client '{0}' is already a quorum member")]
    DuplicateClient(String),
    #[error("client '{0}' is not a quorum member")]
    UnknownClient(String),
    #[error("malformed '{op_type}' contents")]
    MalformedContents {
        op_type: String,
        #[source]
        source: models::DecodeError,
    },
    #[error("protocol handler is closed")]
    Closed,
}

/// Observer of protocol-state mutations.
pub trait QuorumObserver: Send + Sync {
    fn on_member_joined(&mut self, client_id: &str, member: &SequencedClient);
    fn on_member_left(&mut self, client_id: &str, sequence_number: u64);
}

#[derive(Debug, Clone, Default)]
struct QuorumState {
    sequence_number: u64,
    minimum_sequence_number: u64,
    members: BTreeMap<String, SequencedClient>,
    proposals: BTreeMap<u64, QuorumProposal>,
    values: BTreeMap<String, CommittedValue>,
}

/// Replayable state machine over the document's op sequence: membership
/// quorum, pending proposals, and committed values. Identical op streams
/// applied to identical snapshots produce identical snapshots.
pub struct ProtocolHandler {
    state: QuorumState,
    observer: Option<Box<dyn QuorumObserver>>,
    closed: bool,
}

impl ProtocolHandler {
    pub fn from_snapshot(snapshot: &QuorumSnapshot) -> Self {
        Self {
            state: QuorumState {
                sequence_number: snapshot.sequence_number,
                minimum_sequence_number: snapshot.minimum_sequence_number,
                members: snapshot.members.iter().cloned().collect(),
                proposals: snapshot
                    .proposals
                    .iter()
                    .map(|p| (p.sequence_number, p.clone()))
                    .collect(),
                values: snapshot.values.iter().cloned().collect(),
            },
            observer: None,
            closed: false,
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn QuorumObserver>) {
        self.observer = Some(observer);
    }

    pub fn sequence_number(&self) -> u64 {
        self.state.sequence_number
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.state.minimum_sequence_number
    }

    /// Apply the next op in sequence. `local` marks ops originated by this
    /// service instance. Any error is fatal for the document: the caller
    /// must mark it corrupt.
    pub fn process_message(&mut self, op: &SequencedOp, local: bool) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        if op.sequence_number != self.state.sequence_number + 1 {
            return Err(ProtocolError::SequenceOutOfOrder {
                expected: self.state.sequence_number + 1,
                got: op.sequence_number,
            });
        }
        if op.minimum_sequence_number < self.state.minimum_sequence_number {
            return Err(ProtocolError::MinimumSequenceRegressed {
                from: self.state.minimum_sequence_number,
                to: op.minimum_sequence_number,
            });
        }
        tracing::trace!(
            sequence_number = op.sequence_number,
            op_type = op.op_type.as_str(),
            local,
            "applying op to protocol state"
        );
        self.state.sequence_number = op.sequence_number;
        self.state.minimum_sequence_number = op.minimum_sequence_number;

        match &op.op_type {
            OpType::ClientJoin => {
                let join: ClientJoinContents = decode(op)?;
                if self.state.members.contains_key(&join.client_id) {
                    return Err(ProtocolError::DuplicateClient(join.client_id));
                }
                let member = SequencedClient {
                    client: join.detail,
                    sequence_number: op.sequence_number,
                };
                if let Some(observer) = &mut self.observer {
                    observer.on_member_joined(&join.client_id, &member);
                }
                self.state.members.insert(join.client_id, member);
            }
            OpType::ClientLeave => {
                let client_id: String = decode(op)?;
                if self.state.members.remove(&client_id).is_none() {
                    return Err(ProtocolError::UnknownClient(client_id));
                }
                if let Some(observer) = &mut self.observer {
                    observer.on_member_left(&client_id, op.sequence_number);
                }
            }
            OpType::Propose => {
                let propose: ProposeContents = decode(op)?;
                self.state.proposals.insert(
                    op.sequence_number,
                    QuorumProposal {
                        sequence_number: op.sequence_number,
                        key: propose.key,
                        value: propose.value,
                    },
                );
            }
            _ => {}
        }

        self.commit_approved_proposals();
        Ok(())
    }

    /// A proposal commits once the MSN passes its sequence number: every
    /// connected client has then observed it.
    fn commit_approved_proposals(&mut self) {
        loop {
            let seq = match self.state.proposals.keys().next().copied() {
                Some(seq) if seq <= self.state.minimum_sequence_number => seq,
                _ => break,
            };
            let proposal = self.state.proposals.remove(&seq).unwrap();
            self.state.values.insert(
                proposal.key,
                CommittedValue {
                    value: proposal.value,
                    sequence_number: proposal.sequence_number,
                    approval_sequence_number: self.state.sequence_number,
                },
            );
        }
    }

    /// Serializable snapshot of the current state. With `scrub_user_data`,
    /// identifying member fields are replaced by stable placeholders.
    pub fn snapshot(&self, scrub_user_data: bool) -> QuorumSnapshot {
        let snapshot = QuorumSnapshot {
            members: self
                .state
                .members
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect(),
            proposals: self.state.proposals.values().cloned().collect(),
            values: self
                .state
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            minimum_sequence_number: self.state.minimum_sequence_number,
            sequence_number: self.state.sequence_number,
        };
        if scrub_user_data {
            snapshot.scrubbed()
        } else {
            snapshot
        }
    }

    /// Reset state to a previously-taken snapshot, keeping the observer.
    /// Used to roll back a speculative advance after a nacked summary.
    pub fn reset_to(&mut self, snapshot: &QuorumSnapshot) {
        let observer = self.observer.take();
        let closed = self.closed;
        *self = ProtocolHandler::from_snapshot(snapshot);
        self.observer = observer;
        self.closed = closed;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

fn decode<T: serde::de::DeserializeOwned>(op: &SequencedOp) -> Result<T, ProtocolError> {
    op.decode_contents()
        .map_err(|source| ProtocolError::MalformedContents {
            op_type: op.op_type.as_str().to_string(),
            source,
        })
}
