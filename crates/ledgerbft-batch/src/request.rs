//! Client requests and the immutable batches they are ordered in.

use bytes::Bytes;
use ledgerbft_types::{Digest, ReplicaId, Timestamp};
use serde::{Deserialize, Serialize};

// ============================================================================
// Request
// ============================================================================

/// One client-submitted opaque payload.
///
/// `(replica_id, timestamp)` identifies the request for deduplication; the
/// content digest identifies it for bookkeeping in the request store, so a
/// substituted payload under a reused timestamp is a different request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    /// Replica that wrapped the client transaction into this request.
    pub replica_id: ReplicaId,

    /// Submission time, monotonic per submitter.
    pub timestamp: Timestamp,

    /// Opaque transaction bytes.
    pub payload: Bytes,

    /// Optional submitter signature over the payload.
    pub signature: Option<Bytes>,
}

impl Request {
    /// Creates an unsigned request.
    pub fn new(replica_id: ReplicaId, timestamp: Timestamp, payload: impl Into<Bytes>) -> Self {
        Self {
            replica_id,
            timestamp,
            payload: payload.into(),
            signature: None,
        }
    }

    /// Attaches a signature.
    pub fn with_signature(mut self, signature: impl Into<Bytes>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Content digest: BLAKE3 over the canonical postcard encoding.
    pub fn digest(&self) -> Digest {
        let encoded = postcard::to_allocvec(self)
            .expect("Request serialization should never fail (all fields are serializable)");
        Digest::from_bytes(*blake3::hash(&encoded).as_bytes())
    }
}

// ============================================================================
// RequestBatch
// ============================================================================

/// An ordered, immutable list of requests frozen at cut time.
///
/// Contents never change after construction; the agreement engine relies
/// on the digest staying valid.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestBatch {
    requests: Vec<Request>,
}

impl RequestBatch {
    pub fn new(requests: Vec<Request>) -> Self {
        Self { requests }
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Request> {
        self.requests.iter()
    }

    /// Deterministic batch digest over the ordered request digests.
    ///
    /// The empty batch hashes to [`Digest::NULL`], matching how null
    /// requests are identified by the agreement engine.
    pub fn digest(&self) -> Digest {
        if self.requests.is_empty() {
            return Digest::NULL;
        }
        let mut hasher = blake3::Hasher::new();
        for request in &self.requests {
            hasher.update(request.digest().as_bytes());
        }
        Digest::from_bytes(*hasher.finalize().as_bytes())
    }
}

impl<'a> IntoIterator for &'a RequestBatch {
    type Item = &'a Request;
    type IntoIter = std::slice::Iter<'a, Request>;

    fn into_iter(self) -> Self::IntoIter {
        self.requests.iter()
    }
}
