use std::collections::{hash_map::Entry, HashMap};

use tokio::sync::RwLock;

use crate::{channel::ChannelId, error::FatalError};

/// Channels a role is a confirmed party to.
///
/// Only ever grows. Owned by a single role, but read by its update handler
/// concurrently with the role's own inserts.
#[derive(Debug)]
pub struct ChannelRegistry<H> {
    chans: RwLock<HashMap<ChannelId, H>>,
}

impl<H> Default for ChannelRegistry<H> {
    fn default() -> Self {
        Self {
            chans: RwLock::new(HashMap::new()),
        }
    }
}

impl<H: Clone> ChannelRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if `id` is already registered: a fresh channel must have a
    /// fresh ID.
    pub async fn register(&self, id: ChannelId, handle: H) -> Result<(), FatalError> {
        match self.chans.write().await.entry(id) {
            Entry::Occupied(_) => Err(FatalError::DuplicateChannel(id)),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub async fn lookup(&self, id: &ChannelId) -> Option<H> {
        self.chans.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<ChannelId> {
        self.chans.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.chans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash;

    #[tokio::test]
    async fn register_and_lookup() {
        let reg = ChannelRegistry::new();
        let id = Hash([1; 32]);

        assert!(reg.is_empty().await);
        assert_eq!(reg.lookup(&id).await, None);
        reg.register(id, "first").await.unwrap();
        assert_eq!(reg.lookup(&id).await, Some("first"));
        assert_eq!(reg.ids().await, vec![id]);
    }

    #[tokio::test]
    async fn duplicate_is_fatal() {
        let reg = ChannelRegistry::new();
        let id = Hash([2; 32]);

        reg.register(id, 1).await.unwrap();
        assert_eq!(
            reg.register(id, 2).await,
            Err(FatalError::DuplicateChannel(id))
        );
        // The first registration stays.
        assert_eq!(reg.lookup(&id).await, Some(1));
        assert_eq!(reg.len().await, 1);
    }
}
