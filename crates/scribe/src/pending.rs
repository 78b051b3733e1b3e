use std::collections::VecDeque;

use models::SequencedOp;

/// FIFO buffer of ops sequenced above the protocol handler's position and
/// not yet applied to it. Sequence numbers are strictly increasing, and the
/// front is exactly `protocol.sequence_number() + 1` once gaps are healed.
#[derive(Debug, Default)]
pub struct PendingOpBuffer {
    ops: VecDeque<SequencedOp>,
}

impl PendingOpBuffer {
    pub fn push_back(&mut self, op: SequencedOp) {
        debug_assert!(
            self.ops
                .back()
                .map(|back| back.sequence_number < op.sequence_number)
                .unwrap_or(true),
            "pending ops must be strictly increasing",
        );
        self.ops.push_back(op);
    }

    pub fn pop_front(&mut self) -> Option<SequencedOp> {
        self.ops.pop_front()
    }

    pub fn front(&self) -> Option<&SequencedOp> {
        self.ops.front()
    }

    pub fn back(&self) -> Option<&SequencedOp> {
        self.ops.back()
    }

    pub fn back_sequence_number(&self) -> Option<u64> {
        self.ops.back().map(|op| op.sequence_number)
    }

    pub fn to_vec(&self) -> Vec<SequencedOp> {
        self.ops.iter().cloned().collect()
    }

    /// Replace the buffer wholesale, rolling back a speculative drain.
    pub fn replace(&mut self, ops: Vec<SequencedOp>) {
        self.ops = ops.into();
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered buffer of ops awaiting attachment to the next summary's logtail
/// and insertion alongside checkpoints. Entries at or below
/// `max(protocol_head, last_inserted - max_length)` are evicted.
#[derive(Debug)]
pub struct PendingCheckpointMessages {
    ops: VecDeque<SequencedOp>,
    max_length: usize,
}

impl PendingCheckpointMessages {
    pub fn new(max_length: usize) -> Self {
        Self {
            ops: VecDeque::new(),
            max_length,
        }
    }

    pub fn push(&mut self, op: SequencedOp, protocol_head: u64) {
        debug_assert!(
            self.ops
                .back()
                .map(|back| back.sequence_number < op.sequence_number)
                .unwrap_or(true),
            "pending checkpoint messages must be strictly increasing",
        );
        self.ops.push_back(op);
        self.evict(protocol_head);
    }

    /// Drop entries covered by an advanced protocol head.
    pub fn truncate_to_head(&mut self, protocol_head: u64) {
        self.evict(protocol_head);
    }

    fn evict(&mut self, protocol_head: u64) {
        let last = match self.ops.back() {
            Some(op) => op.sequence_number,
            None => return,
        };
        let floor = protocol_head.max(last.saturating_sub(self.max_length as u64));
        while self
            .ops
            .front()
            .map(|op| op.sequence_number <= floor)
            .unwrap_or(false)
        {
            self.ops.pop_front();
        }
    }

    pub fn to_vec(&self) -> Vec<SequencedOp> {
        self.ops.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn front_sequence_number(&self) -> Option<u64> {
        self.ops.front().map(|op| op.sequence_number)
    }

    pub fn back_sequence_number(&self) -> Option<u64> {
        self.ops.back().map(|op| op.sequence_number)
    }
}
