//! Shared map from peer id to the Controller serving that peer.
//!
//! One [`PeerRegistry`] is created per relay and handed to every
//! [`Router`](crate::router::Router) as an `Arc`.  It is the only state the
//! connections of a relay share.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};

use spoke_core::Controller;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Another live connection already serves this peer.
    #[error("peer {0} is already connected")]
    AlreadyRegistered(Uuid),
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<Uuid, Arc<Controller>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `controller` as the route to `peer`.
    ///
    /// Re-registering the same Controller is a no-op.  An entry whose
    /// Controller has already shut down is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if a different, still
    /// running Controller serves `peer`.
    pub fn register(&self, peer: Uuid, controller: &Arc<Controller>) -> Result<(), RegistryError> {
        let mut peers = self.write();
        match peers.get(&peer) {
            Some(existing) if Arc::ptr_eq(existing, controller) => return Ok(()),
            Some(existing) if existing.is_running() => return Err(RegistryError::AlreadyRegistered(peer)),
            Some(_) => debug!(%peer, "replacing stale route"),
            None => {}
        }
        peers.insert(peer, Arc::clone(controller));
        Ok(())
    }

    pub fn lookup(&self, peer: Uuid) -> Option<Arc<Controller>> {
        self.read().get(&peer).cloned()
    }

    /// Removes the route to `peer` only if `owner` is the Controller it points
    /// at, so a connection can never deregister its successor.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_if_owner(&self, peer: Uuid, owner: &Controller) -> bool {
        let mut peers = self.write();
        let owned = peers
            .get(&peer)
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), owner));
        if owned {
            peers.remove(&peer);
        }
        owned
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Ids of every registered peer, in no particular order.
    pub fn peers(&self) -> Vec<Uuid> {
        self.read().keys().copied().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Arc<Controller>>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Arc<Controller>>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoke_core::ControllerConfig;

    fn controller() -> Arc<Controller> {
        Controller::new(Uuid::new_v4(), ControllerConfig::default())
    }

    #[test]
    fn test_register_and_lookup() {
        // Arrange
        let registry = PeerRegistry::new();
        let peer = Uuid::new_v4();
        let owner = controller();

        // Act
        registry.register(peer, &owner).unwrap();

        // Assert
        assert!(Arc::ptr_eq(&registry.lookup(peer).unwrap(), &owner));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.peers(), vec![peer]);
    }

    #[test]
    fn test_register_same_owner_twice_is_ok() {
        let registry = PeerRegistry::new();
        let peer = Uuid::new_v4();
        let owner = controller();

        registry.register(peer, &owner).unwrap();

        assert_eq!(registry.register(peer, &owner), Ok(()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_second_live_owner() {
        let registry = PeerRegistry::new();
        let peer = Uuid::new_v4();
        registry.register(peer, &controller()).unwrap();

        let result = registry.register(peer, &controller());

        assert_eq!(result, Err(RegistryError::AlreadyRegistered(peer)));
    }

    #[tokio::test]
    async fn test_register_replaces_stopped_owner() {
        let registry = PeerRegistry::new();
        let peer = Uuid::new_v4();
        let stale = controller();
        registry.register(peer, &stale).unwrap();
        stale.shutdown().await;
        let fresh = controller();

        registry.register(peer, &fresh).unwrap();

        assert!(Arc::ptr_eq(&registry.lookup(peer).unwrap(), &fresh));
    }

    #[test]
    fn test_remove_if_owner_ignores_other_controllers() {
        let registry = PeerRegistry::new();
        let peer = Uuid::new_v4();
        let owner = controller();
        let other = controller();
        registry.register(peer, &owner).unwrap();

        assert!(!registry.remove_if_owner(peer, &other));
        assert!(registry.remove_if_owner(peer, &owner));
        assert!(registry.is_empty());
        assert!(registry.lookup(peer).is_none());
    }
}
