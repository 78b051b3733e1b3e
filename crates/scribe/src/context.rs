use models::{OpBatch, OutboundOp};

/// Why a lambda instance is being closed. Close is terminal: a new instance
/// must be constructed to resume the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Rebalance,
    Error,
    Shutdown,
    Stop,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Rebalance => "rebalance",
            CloseReason::Error => "error",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Stop => "stop",
        }
    }
}

/// Position within the source stream, the unit of upstream acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMarker {
    pub offset: i64,
    pub partition: i32,
}

/// Handle back to the partition driver hosting this lambda.
pub trait LambdaContext: Send + Sync {
    /// Acknowledge the stream offset to the upstream bus. Idempotent per
    /// offset; fire-and-forget from the lambda's perspective.
    fn checkpoint(&self, marker: CheckpointMarker, restart_on_failure: bool);

    /// Surface an asynchronous error to the driver, optionally requesting
    /// that the lambda be restarted.
    fn report_error(&self, error: anyhow::Error, restart: bool);
}

/// Emitter of outbound system ops (SummaryAck, SummaryNack, Control) back
/// into the document's stream.
#[async_trait::async_trait]
pub trait OpProducer: Send + Sync {
    async fn send(
        &self,
        tenant_id: &str,
        document_id: &str,
        op: OutboundOp,
    ) -> anyhow::Result<()>;
}

/// The surface the upstream driver invokes. `handle` calls for one document
/// are strictly serialized by the driver.
#[async_trait::async_trait]
pub trait PartitionLambda: Send {
    async fn handle(&mut self, batch: OpBatch) -> Result<(), crate::Error>;

    async fn close(&mut self, reason: CloseReason);
}
