//! Peer directory of known public keys.

use libp2p::{identity::PublicKey, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Public keys of peers this host has identified, keyed by peer id.
///
/// Filled from identify exchanges; used to verify signed name records.
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct KeyBook {
    keys: Arc<RwLock<HashMap<PeerId, PublicKey>>>,
}

impl std::fmt::Debug for KeyBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBook").field("len", &self.len()).finish()
    }
}

impl KeyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `key` under the peer id it derives. Returns that peer id.
    pub fn insert(&self, key: PublicKey) -> PeerId {
        let peer = key.to_peer_id();
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, key);
        peer
    }

    pub fn get(&self, peer: &PeerId) -> Option<PublicKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PublicKey> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
