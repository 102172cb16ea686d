//! Wire messages exchanged between replicas.
//!
//! Two envelope kinds matter to the batching layer:
//! - [`MessageKind::ChainTransaction`]: a raw client transaction, wrapped
//!   into a [`Request`] by the receiving replica.
//! - [`MessageKind::Consensus`]: a postcard-encoded [`BatchMessage`], which
//!   is either a relayed [`Request`] or an opaque agreement-engine message.
//!
//! Anything else is logged and dropped by the coordinator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::request::Request;

// ============================================================================
// Envelope
// ============================================================================

/// Kind tag of a wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Raw client transaction submitted to this replica.
    ChainTransaction,
    /// Batching-layer message carrying a [`BatchMessage`].
    Consensus,
    /// Any other message type sharing the peer channel.
    Other(u32),
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChainTransaction => "ChainTransaction",
            Self::Consensus => "Consensus",
            Self::Other(_) => "Other",
        }
    }
}

/// A message as it travels between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl WireMessage {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Wraps a raw client transaction.
    pub fn chain_transaction(tx: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::ChainTransaction, tx)
    }

    /// Wraps a batch message into a `Consensus` envelope.
    pub fn consensus(msg: &BatchMessage) -> Result<Self, WireError> {
        Ok(Self::new(MessageKind::Consensus, msg.encode()?))
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(WireError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        postcard::from_bytes(bytes).map_err(WireError::Decode)
    }
}

// ============================================================================
// Batch Message
// ============================================================================

/// Payload of a `Consensus` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchMessage {
    /// A client request relayed so every replica knows what the primary saw.
    Request(Request),
    /// Opaque agreement-engine message (pre-prepare, prepare, commit, ...).
    ProtocolMessage(Bytes),
}

impl BatchMessage {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        postcard::to_allocvec(self)
            .map(Bytes::from)
            .map_err(WireError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        postcard::from_bytes(bytes).map_err(WireError::Decode)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Request(_) => "Request",
            Self::ProtocolMessage(_) => "ProtocolMessage",
        }
    }
}

/// Builds the outbound envelope for an agreement-engine payload.
pub fn wrap_protocol_message(payload: Bytes) -> Result<WireMessage, WireError> {
    WireMessage::consensus(&BatchMessage::ProtocolMessage(payload))
}

/// Builds the outbound envelope relaying a request.
pub fn wrap_request(request: Request) -> Result<WireMessage, WireError> {
    WireMessage::consensus(&BatchMessage::Request(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerbft_types::{ReplicaId, Timestamp};
    use test_case::test_case;

    #[test]
    fn request_survives_envelope() {
        let request = Request::new(ReplicaId::new(2), Timestamp::from_nanos(77), &b"tx"[..]);
        let wire = wrap_request(request.clone()).expect("wrap");
        assert_eq!(wire.kind, MessageKind::Consensus);

        let bytes = wire.encode().expect("encode");
        let decoded = WireMessage::decode(&bytes).expect("decode");
        let inner = BatchMessage::decode(&decoded.payload).expect("inner");
        assert_eq!(inner, BatchMessage::Request(request));
    }

    #[test]
    fn protocol_payload_is_opaque() {
        let payload = Bytes::from_static(b"\x00\x01pre-prepare");
        let wire = wrap_protocol_message(payload.clone()).expect("wrap");
        let inner = BatchMessage::decode(&wire.payload).expect("inner");
        assert_eq!(inner, BatchMessage::ProtocolMessage(payload));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(BatchMessage::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(WireMessage::decode(&[]).is_err());
    }

    #[test_case(MessageKind::ChainTransaction, "ChainTransaction")]
    #[test_case(MessageKind::Consensus, "Consensus")]
    #[test_case(MessageKind::Other(9), "Other")]
    fn kind_names(kind: MessageKind, expected: &str) {
        assert_eq!(kind.name(), expected);
    }
}
