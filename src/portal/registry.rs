//! Portal cache and loader, indexed by portal key and by Matrix room id.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::bridge::BridgeContext;
use crate::error::BridgeError;
use crate::ids::{MatrixRoomId, NetworkChatId, PortalKey, UserLoginId};
use crate::portal::Portal;
use crate::storage::PortalRecord;

/// Shared cache indices. The by-key map is the authority: a portal exists
/// in the process exactly once, which is what keeps its event handling
/// serial. Entries are only inserted through [`DashMap::entry`], so racing
/// loaders converge on one instance.
#[derive(Default)]
pub(crate) struct PortalIndex {
    by_key: DashMap<PortalKey, Arc<Portal>>,
    by_room: DashMap<MatrixRoomId, PortalKey>,
}

impl PortalIndex {
    pub(crate) fn map_room(&self, room_id: MatrixRoomId, key: PortalKey) {
        self.by_room.insert(room_id, key);
    }

    pub(crate) fn unmap_room(&self, room_id: &MatrixRoomId) {
        self.by_room.remove(room_id);
    }

    pub(crate) fn remove(&self, key: &PortalKey, room_id: Option<&MatrixRoomId>) {
        self.by_key.remove(key);
        if let Some(room_id) = room_id {
            self.by_room.remove(room_id);
        }
    }
}

/// Cache + loader for portals, backed by persistence.
pub struct PortalRegistry {
    ctx: Arc<BridgeContext>,
    index: Arc<PortalIndex>,
}

impl PortalRegistry {
    #[must_use]
    pub fn new(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            index: Arc::new(PortalIndex::default()),
        }
    }

    fn materialize(&self, record: PortalRecord) -> Arc<Portal> {
        let key = record.key.clone();
        let room_id = record.room_id.clone();
        let portal = self
            .index
            .by_key
            .entry(key.clone())
            .or_insert_with(|| {
                Portal::spawn(Arc::clone(&self.ctx), Arc::clone(&self.index), record)
            })
            .clone();
        if let Some(room_id) = room_id {
            self.index.by_room.insert(room_id, key);
        }
        portal
    }

    /// Looks up a portal by key, loading it from persistence on a cache
    /// miss. With `create_if_missing` a placeholder row is inserted for
    /// unknown keys.
    pub async fn get(
        &self,
        key: &PortalKey,
        create_if_missing: bool,
    ) -> Result<Option<Arc<Portal>>, BridgeError> {
        if let Some(portal) = self.index.by_key.get(key) {
            return Ok(Some(portal.clone()));
        }

        let record = match self.ctx.db.portals.get(key).await? {
            Some(record) => record,
            None if create_if_missing => {
                let record = PortalRecord::new(key.clone());
                self.ctx.db.portals.save(&record).await?;
                debug!(portal_id = %key, "created portal row");
                record
            }
            None => return Ok(None),
        };
        Ok(Some(self.materialize(record)))
    }

    /// Looks up a portal by its Matrix room id.
    pub async fn get_by_room_id(
        &self,
        room_id: &MatrixRoomId,
    ) -> Result<Option<Arc<Portal>>, BridgeError> {
        if let Some(key) = self.index.by_room.get(room_id) {
            let key = key.clone();
            return self.get(&key, false).await;
        }
        match self.ctx.db.portals.get_by_room_id(room_id).await? {
            Some(record) => Ok(Some(self.materialize(record))),
            None => Ok(None),
        }
    }

    /// Resolves DM-vs-group receiver semantics: the split portal for the
    /// receiver first, then the shared portal, then whatever the database
    /// has for the chat.
    pub async fn find_receiver(
        &self,
        chat_id: &NetworkChatId,
        receiver: Option<&UserLoginId>,
    ) -> Result<Option<Arc<Portal>>, BridgeError> {
        if let Some(receiver) = receiver {
            let key = PortalKey::new(chat_id.clone(), Some(receiver.clone()));
            if let Some(portal) = self.get(&key, false).await? {
                return Ok(Some(portal));
            }
        }
        let shared = PortalKey::shared(chat_id.clone());
        if let Some(portal) = self.get(&shared, false).await? {
            return Ok(Some(portal));
        }
        match self.ctx.db.portals.find_any_receiver(chat_id).await? {
            Some(record) => Ok(Some(self.materialize(record))),
            None => Ok(None),
        }
    }

    /// Drops a portal from the cache.
    pub fn evict(&self, key: &PortalKey, room_id: Option<&MatrixRoomId>) {
        self.index.remove(key, room_id);
    }
}
