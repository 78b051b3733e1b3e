use serde::{Deserialize, Serialize};

/// Placeholder prefix substituted for identifying fields when user data is
/// scrubbed out of checkpoints and summaries.
pub const SCRUBBED_USER_PREFIX: &str = "scrubbed:";

/// The user on whose behalf a client connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Connection details carried by a ClientJoin op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDetail {
    pub user: QuorumUser,
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// A quorum member together with the sequence number at which it joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedClient {
    pub client: ClientDetail,
    pub sequence_number: u64,
}

/// Payload of a ClientJoin op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoinContents {
    pub client_id: String,
    pub detail: ClientDetail,
}

/// Payload of a Propose op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeContents {
    pub key: String,
    pub value: serde_json::Value,
}

/// A proposal pending acceptance: it commits once the MSN passes its
/// sequence number, proving every connected client has observed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumProposal {
    pub sequence_number: u64,
    pub key: String,
    pub value: serde_json::Value,
}

/// A committed consensus value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedValue {
    pub value: serde_json::Value,
    /// Sequence number of the originating proposal.
    pub sequence_number: u64,
    /// Sequence number at which the MSN passed the proposal.
    pub approval_sequence_number: u64,
}

/// Serializable snapshot of the protocol state: a pure function of the
/// ordered op stream starting from the last persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumSnapshot {
    pub members: Vec<(String, SequencedClient)>,
    pub proposals: Vec<QuorumProposal>,
    pub values: Vec<(String, CommittedValue)>,
    pub minimum_sequence_number: u64,
    pub sequence_number: u64,
}

impl QuorumSnapshot {
    /// A copy with identifying member fields replaced by stable placeholders,
    /// for persistence targets that must not embed user data. The placeholder
    /// is derived from the (opaque) client id so repeated scrubs of the same
    /// membership are identical.
    pub fn scrubbed(&self) -> QuorumSnapshot {
        let mut scrubbed = self.clone();
        for (client_id, member) in &mut scrubbed.members {
            member.client.user = QuorumUser {
                id: format!("{SCRUBBED_USER_PREFIX}{client_id}"),
                name: None,
            };
            member.client.details = None;
        }
        scrubbed
    }
}
