//! Wire envelope for committed mutations.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Identity of one store replica.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random identity.
    pub fn random() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one run of a sequencer. A replica restarted under the same
/// [`ClientId`] numbers its packets from 1 again under a new session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed mutation plus provenance and sequencing metadata.
///
/// Encoded as a JSON object with camelCase keys:
/// `{action, payload, sourceId, msSinceLastPacket, packetId, previousPacketId}`,
/// plus `sessionId` when the packet was numbered by a sequencer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportPacket {
    /// Mutation type.
    pub action: String,
    pub payload: Value,
    /// Client that committed the mutation.
    pub source_id: ClientId,
    /// Milliseconds between this packet and the source's previous one.
    pub ms_since_last_packet: u64,
    /// Per-source sequence number, starting at 1. Zero means unsequenced.
    pub packet_id: u64,
    /// The source's previous packet id, zero for its first packet.
    pub previous_packet_id: u64,
    /// Sequencer run that assigned `packet_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl TransportPacket {
    /// An unsequenced packet.
    pub fn new(action: impl Into<String>, payload: impl Into<Value>, source_id: ClientId) -> Self {
        Self {
            action: action.into(),
            payload: payload.into(),
            source_id,
            ms_since_last_packet: 0,
            packet_id: 0,
            previous_packet_id: 0,
            session_id: None,
        }
    }

    pub fn with_sequence(
        mut self,
        packet_id: u64,
        previous_packet_id: u64,
        ms_since_last_packet: u64,
    ) -> Self {
        self.packet_id = packet_id;
        self.previous_packet_id = previous_packet_id;
        self.ms_since_last_packet = ms_since_last_packet;
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn is_sequenced(&self) -> bool {
        self.packet_id != 0
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(encoded: &str) -> Result<Self> {
        Ok(serde_json::from_str(encoded)?)
    }
}
