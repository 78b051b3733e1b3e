use serde::{Deserialize, Serialize};

use crate::summary::{ControlContents, SummaryAckContents, SummaryNackContents};

/// Type of a sequenced operation within a document's log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpType {
    Op,
    ClientJoin,
    ClientLeave,
    Propose,
    Summarize,
    SummaryAck,
    SummaryNack,
    NoClient,
    Control,
    /// Op types this worker doesn't dispatch on. They still advance counters,
    /// and the original tag is preserved so logtail ops re-serialize intact.
    Unknown(String),
}

impl OpType {
    pub fn as_str(&self) -> &str {
        match self {
            OpType::Op => "op",
            OpType::ClientJoin => "join",
            OpType::ClientLeave => "leave",
            OpType::Propose => "propose",
            OpType::Summarize => "summarize",
            OpType::SummaryAck => "summaryAck",
            OpType::SummaryNack => "summaryNack",
            OpType::NoClient => "noClient",
            OpType::Control => "control",
            OpType::Unknown(tag) => tag,
        }
    }
}

impl Serialize for OpType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OpType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        Ok(match tag.as_ref() {
            "op" => OpType::Op,
            "join" => OpType::ClientJoin,
            "leave" => OpType::ClientLeave,
            "propose" => OpType::Propose,
            "summarize" => OpType::Summarize,
            "summaryAck" => OpType::SummaryAck,
            "summaryNack" => OpType::SummaryNack,
            "noClient" => OpType::NoClient,
            "control" => OpType::Control,
            other => OpType::Unknown(other.to_string()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("op carries no payload")]
    Missing,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// An op payload, which may arrive doubly-encoded as a JSON string.
///
/// Producers historically embedded JSON documents as strings inside the
/// envelope. Rather than sniffing at every use site, the two shapes are
/// captured here and `decode` is the single point where either is parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Contents {
    Encoded(String),
    Decoded(serde_json::Value),
}

impl Contents {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        match self {
            Contents::Encoded(raw) => Ok(serde_json::from_str(raw)?),
            Contents::Decoded(value) => Ok(serde_json::from_value(value.clone())?),
        }
    }

    pub fn decoded<T: Serialize>(value: &T) -> Contents {
        Contents::Decoded(serde_json::to_value(value).expect("contents always serialize"))
    }
}

/// Metadata attached to an op by upstream services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    #[serde(default)]
    pub deli_acked: bool,
}

/// A single hop of an op's service trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub service: String,
    pub action: String,
    pub timestamp: i64,
}

/// An immutable sequenced operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedOp {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    #[serde(default)]
    pub reference_sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "type")]
    pub op_type: OpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<Contents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Contents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_metadata: Option<ServerMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<Trace>,
    #[serde(default)]
    pub timestamp: i64,
}

impl SequencedOp {
    /// Decode the op's `contents` payload.
    pub fn decode_contents<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        self.contents.as_ref().ok_or(DecodeError::Missing)?.decode()
    }

    /// Decode `data` when present, falling back to `contents`.
    /// SummaryAck and SummaryNack ops carry their payload either way.
    pub fn decode_data_or_contents<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<T, DecodeError> {
        self.data
            .as_ref()
            .or(self.contents.as_ref())
            .ok_or(DecodeError::Missing)?
            .decode()
    }

    pub fn is_deli_acked(&self) -> bool {
        self.server_metadata
            .as_ref()
            .map(|m| m.deli_acked)
            .unwrap_or_default()
    }
}

/// An ordered group of sequenced ops delivered under a single stream offset.
/// The offset is the unit of acknowledgement back to the upstream bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpBatch {
    pub tenant_id: String,
    pub document_id: String,
    pub offset: i64,
    pub partition: i32,
    pub ops: Vec<SequencedOp>,
}

/// A system op emitted back into the document's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundOp {
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub contents: Contents,
}

impl OutboundOp {
    pub fn summary_ack(ack: &SummaryAckContents) -> Self {
        Self {
            op_type: OpType::SummaryAck,
            contents: Contents::decoded(ack),
        }
    }

    pub fn summary_nack(nack: &SummaryNackContents) -> Self {
        Self {
            op_type: OpType::SummaryNack,
            contents: Contents::decoded(nack),
        }
    }

    pub fn control(control: &ControlContents) -> Self {
        Self {
            op_type: OpType::Control,
            contents: Contents::decoded(control),
        }
    }
}
