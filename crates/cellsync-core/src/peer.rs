//! Liveness-checked handle to the remote peer.

use std::sync::{Arc, PoisonError, RwLock};

use crate::traits::RemotePeer;

/// Shared slot holding the connected remote peer, if any.
///
/// Cloning is cheap; every clone observes `connect`/`disconnect`.
#[derive(Clone, Default)]
pub struct PeerSlot {
    inner: Arc<RwLock<Option<Arc<dyn RemotePeer>>>>,
}

impl PeerSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a slot already holding `peer`.
    #[must_use]
    pub fn connected(peer: Arc<dyn RemotePeer>) -> Self {
        let slot = Self::new();
        slot.connect(peer);
        slot
    }

    /// Install the peer, replacing any previous one.
    pub fn connect(&self, peer: Arc<dyn RemotePeer>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(peer);
    }

    /// Drop the peer.
    pub fn disconnect(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// The peer, if one is installed and still connected.
    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn RemotePeer>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|peer| peer.is_connected())
            .map(Arc::clone)
    }
}

impl std::fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSlot")
            .field("connected", &self.get().is_some())
            .finish()
    }
}
