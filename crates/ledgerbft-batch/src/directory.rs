//! Mapping from network peer handles to replica identities.
//!
//! The transport knows peers by handle; the agreement engine only speaks
//! replica IDs. The directory is injected into the coordinator at
//! construction, so there is no process-wide lookup state.

use std::collections::HashMap;
use std::fmt;

use ledgerbft_types::ReplicaId;
use serde::{Deserialize, Serialize};

/// Network-level identity of a peer (e.g. its validator name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerHandle(String);

impl PeerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerHandle {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Resolves peer handles to replica IDs.
pub trait ReplicaDirectory {
    /// Returns the replica behind `handle`, or `None` for unknown peers.
    fn resolve(&self, handle: &PeerHandle) -> Option<ReplicaId>;
}

/// Fixed directory built from the cluster configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    by_handle: HashMap<PeerHandle, ReplicaId>,
    /// Current handle of each replica, so re-registration can retire the old one.
    by_replica: HashMap<ReplicaId, PeerHandle>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` as `replica`, replacing earlier entries for either.
    pub fn with_peer(mut self, handle: impl Into<PeerHandle>, replica: ReplicaId) -> Self {
        let handle = handle.into();
        if let Some(old) = self.by_replica.insert(replica, handle.clone()) {
            self.by_handle.remove(&old);
        }
        self.by_handle.insert(handle, replica);
        self
    }

    /// Directory for `n` replicas named `vp0..vp{n-1}`.
    pub fn sequential(n: usize) -> Self {
        (0..n as u64).fold(Self::new(), |dir, id| {
            dir.with_peer(PeerHandle::new(format!("vp{id}")), ReplicaId::new(id))
        })
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

impl ReplicaDirectory for StaticDirectory {
    fn resolve(&self, handle: &PeerHandle) -> Option<ReplicaId> {
        self.by_handle.get(handle).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_directory_resolves_every_replica() {
        let dir = StaticDirectory::sequential(4);
        assert_eq!(dir.len(), 4);
        assert_eq!(dir.resolve(&PeerHandle::new("vp2")), Some(ReplicaId::new(2)));
        assert_eq!(dir.resolve(&PeerHandle::new("vp3")), Some(ReplicaId::new(3)));
    }

    #[test]
    fn unknown_peer_resolves_to_none() {
        let dir = StaticDirectory::sequential(4);
        assert_eq!(dir.resolve(&PeerHandle::new("intruder")), None);
    }

    #[test]
    fn re_registering_a_replica_drops_the_old_handle() {
        let dir = StaticDirectory::new()
            .with_peer("old-name", ReplicaId::new(1))
            .with_peer("new-name", ReplicaId::new(1));

        assert_eq!(dir.len(), 1);
        assert_eq!(dir.resolve(&PeerHandle::new("old-name")), None);
        assert_eq!(dir.resolve(&PeerHandle::new("new-name")), Some(ReplicaId::new(1)));
    }
}
