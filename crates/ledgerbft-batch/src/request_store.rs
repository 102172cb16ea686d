//! Outstanding and pending client requests.
//!
//! The store is the authoritative record of requests this replica knows
//! about that have not executed yet. It tracks two sets:
//!
//! - **outstanding**: every request received and not yet executed
//! - **pending**: requests inside a batch proposal the agreement engine is
//!   processing
//!
//! A request is logically either *non-pending* (outstanding only) or
//! *pending*; the primary keeps a pending request in the outstanding set as
//! well, so that voiding the pending set on a view change returns the
//! request to the non-pending pool instead of losing it.
//!
//! # Design Invariants
//!
//! 1. **Stable order**: iteration follows first insertion, which is
//!    submission order
//! 2. **Idempotent insertion**: storing a known request never reorders it
//! 3. **Local only**: no operation performs I/O or fails
//! 4. **Hash once**: a request's digest is computed when it is stored and
//!    reused by every later membership check

use std::collections::{BTreeMap, HashMap};

use ledgerbft_types::Digest;

use crate::request::Request;

// ============================================================================
// OrderedRequests
// ============================================================================

/// Insertion-ordered set of requests keyed by content digest.
#[derive(Debug, Clone, Default)]
pub struct OrderedRequests {
    /// Requests by insertion sequence, with their cached digests.
    order: BTreeMap<u64, (Digest, Request)>,

    /// Digest → insertion sequence.
    index: HashMap<Digest, u64>,

    next_seq: u64,
}

impl OrderedRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `request` if it is not already present. Returns true if added.
    pub fn add(&mut self, request: Request) -> bool {
        self.add_with_digest(request.digest(), request)
    }

    fn add_with_digest(&mut self, digest: Digest, request: Request) -> bool {
        if self.index.contains_key(&digest) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(digest, seq);
        self.order.insert(seq, (digest, request));
        true
    }

    /// Removes `request`. Returns true if it was present.
    pub fn remove(&mut self, request: &Request) -> bool {
        self.remove_digest(&request.digest())
    }

    fn remove_digest(&mut self, digest: &Digest) -> bool {
        match self.index.remove(digest) {
            Some(seq) => self.order.remove(&seq).is_some(),
            None => false,
        }
    }

    pub fn has(&self, request: &Request) -> bool {
        self.contains_digest(&request.digest())
    }

    pub fn contains_digest(&self, digest: &Digest) -> bool {
        self.index.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Drops every request.
    pub fn empty(&mut self) {
        self.order.clear();
        self.index.clear();
    }

    /// Iterates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.order.values().map(|(_, request)| request)
    }

    /// Iterates in insertion order, with each request's digest.
    pub fn iter_with_digest(&self) -> impl Iterator<Item = (&Digest, &Request)> {
        self.order.values().map(|(digest, request)| (digest, request))
    }
}

// ============================================================================
// RequestStore
// ============================================================================

/// Outstanding/pending bookkeeping owned by the batch coordinator.
#[derive(Debug, Clone, Default)]
pub struct RequestStore {
    outstanding: OrderedRequests,
    pending: OrderedRequests,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly received request as outstanding.
    ///
    /// No-op if the request is already outstanding or already pending.
    pub fn store_outstanding(&mut self, request: Request) {
        let digest = request.digest();
        if self.pending.contains_digest(&digest) {
            return;
        }
        self.outstanding.add_with_digest(digest, request);
    }

    /// Marks a request as part of a batch proposal.
    pub fn store_pending(&mut self, request: Request) {
        self.pending.add(request);
    }

    /// Marks every request of an adopted batch as pending.
    pub fn store_pendings<'a>(&mut self, requests: impl IntoIterator<Item = &'a Request>) {
        for request in requests {
            self.store_pending(request.clone());
        }
    }

    /// Removes `request` from both sets, reporting prior membership as
    /// `(was_outstanding, was_pending)`.
    pub fn remove(&mut self, request: &Request) -> (bool, bool) {
        let digest = request.digest();
        let outstanding = self.outstanding.remove_digest(&digest);
        let pending = self.pending.remove_digest(&digest);
        (outstanding, pending)
    }

    pub fn is_pending(&self, request: &Request) -> bool {
        self.pending.has(request)
    }

    pub fn is_outstanding(&self, request: &Request) -> bool {
        self.outstanding.has(request)
    }

    /// True if some outstanding request is not pending: unmet demand that
    /// should lead to a (re)submission or, eventually, a view change.
    pub fn has_non_pending(&self) -> bool {
        self.non_pending().next().is_some()
    }

    /// Up to `limit` outstanding-but-not-pending requests in submission
    /// order. Nothing is removed.
    pub fn get_next_non_pending(&self, limit: usize) -> Vec<Request> {
        self.non_pending().take(limit).cloned().collect()
    }

    fn non_pending(&self) -> impl Iterator<Item = &Request> {
        self.outstanding
            .iter_with_digest()
            .filter(|(digest, _)| !self.pending.contains_digest(digest))
            .map(|(_, request)| request)
    }

    pub fn outstanding(&self) -> &OrderedRequests {
        &self.outstanding
    }

    pub fn pending(&self) -> &OrderedRequests {
        &self.pending
    }

    /// Drops the outstanding set (state cannot be trusted).
    pub fn empty_outstanding(&mut self) {
        self.outstanding.empty();
    }

    /// Drops the pending set (in-flight proposals were voided).
    pub fn empty_pending(&mut self) {
        self.pending.empty();
    }
}
