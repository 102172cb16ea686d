//! Primary misbehaviour hook for fault-injection tests.
//!
//! Production replicas run [`Honest`]. Tests plug in a [`PrimaryFault`] to
//! make a primary hide or rewrite client requests and check that backups
//! still notice the missing request and suspect the primary.

use crate::request::Request;

/// Behaviour of this replica when it originates or batches a request.
pub trait PrimaryFault: Send {
    /// If true, locally submitted requests are not relayed to other
    /// replicas.
    fn suppress_request_broadcast(&self) -> bool {
        false
    }

    /// Request that is batched in place of `request` on the primary.
    fn substitute(&mut self, request: Request) -> Request {
        request
    }
}

/// Correct behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct Honest;

impl PrimaryFault for Honest {}

/// Replaces every batched payload with a fixed one.
#[derive(Debug, Clone)]
pub struct SubstitutePayload {
    payload: bytes::Bytes,
    silent: bool,
}

impl SubstitutePayload {
    pub fn new(payload: impl Into<bytes::Bytes>) -> Self {
        Self {
            payload: payload.into(),
            silent: false,
        }
    }

    /// Also stops relaying client requests.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

impl PrimaryFault for SubstitutePayload {
    fn suppress_request_broadcast(&self) -> bool {
        self.silent
    }

    fn substitute(&mut self, request: Request) -> Request {
        Request {
            payload: self.payload.clone(),
            ..request
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerbft_types::{ReplicaId, Timestamp};

    #[test]
    fn honest_is_identity() {
        let request = Request::new(ReplicaId::new(0), Timestamp::from_nanos(1), &b"tx"[..]);
        assert!(!Honest.suppress_request_broadcast());
        assert_eq!(Honest.substitute(request.clone()), request);
    }

    #[test]
    fn substitution_keeps_identity_but_changes_digest() {
        let request = Request::new(ReplicaId::new(0), Timestamp::from_nanos(1), &b"pay alice"[..]);
        let mut fault = SubstitutePayload::new(&b"pay mallory"[..]).silent();

        let forged = fault.substitute(request.clone());
        assert!(fault.suppress_request_broadcast());
        assert_eq!(forged.timestamp, request.timestamp);
        assert_ne!(forged.digest(), request.digest());
    }
}
