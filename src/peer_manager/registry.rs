use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::peer::PeerId;

/// Peer ids currently connected to one swarm.
///
/// Negotiations on many tasks race to register; `try_register` is the only
/// way in and the returned guard is the only way out.
///
/// # Examples
///
/// ```
/// use peerwire::peer::PeerId;
/// use peerwire::peer_manager::PeerIdRegistry;
///
/// let registry = PeerIdRegistry::new();
/// let id = PeerId::generate();
///
/// let guard = registry.try_register(id).unwrap();
/// assert!(registry.try_register(id).is_none());
///
/// drop(guard);
/// assert!(!registry.contains(&id));
/// ```
#[derive(Debug, Default)]
pub struct PeerIdRegistry {
    ids: Mutex<HashSet<PeerId>>,
}

impl PeerIdRegistry {
    /// Creates an empty shared registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds `id` unless it is already present.
    pub fn try_register(self: &Arc<Self>, id: PeerId) -> Option<Registration> {
        if !self.ids.lock().insert(id) {
            return None;
        }
        Some(Registration {
            registry: Arc::clone(self),
            id,
        })
    }

    /// Whether `id` is currently connected.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.ids.lock().contains(id)
    }

    /// Number of connected ids.
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

/// Keeps a peer id registered until dropped.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<PeerIdRegistry>,
    id: PeerId,
}

impl Registration {
    /// The registered id.
    pub fn peer_id(&self) -> PeerId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.ids.lock().remove(&self.id);
    }
}
