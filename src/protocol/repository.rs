//! Registry of synchronized objects, keyed by class name then object name.
//!
//! Entries are weak: the repository never keeps an object alive. An entry
//! whose object was dropped reads as absent and is replaced by the next
//! `add` under the same identity.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::core::variant::QVariantMap;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::syncable::{Syncable, SyncableHandle};

type WeakHandle = Weak<std::sync::Mutex<dyn Syncable>>;

#[derive(Default)]
pub struct ObjectRepository {
    objects: HashMap<String, HashMap<String, WeakHandle>>,
}

impl ObjectRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle` under its identity.
    ///
    /// Returns `false` when a live object already holds that identity, in
    /// which case the repository is left unchanged.
    pub fn add(&mut self, class_name: &str, object_name: &str, handle: &SyncableHandle) -> bool {
        let class = self.objects.entry(class_name.to_owned()).or_default();
        if class
            .get(object_name)
            .is_some_and(|existing| existing.strong_count() > 0)
        {
            trace!(class = class_name, object = object_name, "Already synchronized");
            return false;
        }
        class.insert(object_name.to_owned(), Arc::downgrade(handle));
        debug!(class = class_name, object = object_name, "Synchronizing object");
        true
    }

    pub fn find(&self, class_name: &str, object_name: &str) -> Option<SyncableHandle> {
        self.objects
            .get(class_name)
            .and_then(|class| class.get(object_name))
            .and_then(Weak::upgrade)
    }

    pub fn remove(&mut self, class_name: &str, object_name: &str) -> Option<SyncableHandle> {
        let class = self.objects.get_mut(class_name)?;
        let removed = class.remove(object_name);
        if class.is_empty() {
            self.objects.remove(class_name);
        }
        removed.and_then(|weak| weak.upgrade())
    }

    /// Move the entry at `old_name` to `new_name`.
    ///
    /// Returns the object when it was found and is still alive.
    pub fn rename(
        &mut self,
        class_name: &str,
        old_name: &str,
        new_name: &str,
    ) -> Option<SyncableHandle> {
        let class = self.objects.get_mut(class_name)?;
        let weak = class.remove(old_name)?;
        let handle = weak.upgrade()?;
        class.insert(new_name.to_owned(), weak);
        debug!(class = class_name, from = old_name, to = new_name, "Renamed object");
        Some(handle)
    }

    /// Apply `InitData` to a tracked object.
    pub fn init(handle: &SyncableHandle, properties: &QVariantMap) -> Result<()> {
        let mut object = handle
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned(constants::ERR_LOCK_POISONED.into()))?;
        object.init(properties)
    }

    /// Drop entries whose objects are gone.
    pub fn prune(&mut self) -> usize {
        let mut pruned = 0;
        self.objects.retain(|_, class| {
            let before = class.len();
            class.retain(|_, weak| weak.strong_count() > 0);
            pruned += before - class.len();
            !class.is_empty()
        });
        pruned
    }

    /// Live objects currently tracked.
    pub fn len(&self) -> usize {
        self.objects
            .values()
            .flat_map(HashMap::values)
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

impl std::fmt::Debug for ObjectRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRepository")
            .field("classes", &self.objects.len())
            .field("objects", &self.len())
            .finish()
    }
}
