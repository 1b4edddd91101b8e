//! Per-container directory of shared-object instances.
//!
//! The directory is the authoritative local view of which shared objects
//! exist. Entries installed by an in-flight replication stay *pending*,
//! tagged with their transaction, until the initiator commits; a
//! compensating removal only ever touches the pending entry of the
//! transaction that is being aborted.

use crate::error::{CohortError, Result};
use crate::id::{Id, TransactionId};
use crate::object::{instantiation_args, SharedObject, SharedObjectDescriptor};
use crate::registry::DescriptionRegistry;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Replication status of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Installed by a transaction that has not committed yet.
    Pending(TransactionId),
    Active,
}

/// Metadata about one directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    /// Container that initiated the object's creation.
    pub origin: Id,
    pub state: EntryState,
    /// Set once the origin left the group.
    pub orphaned: bool,
}

struct Entry {
    object: Arc<dyn SharedObject>,
    info: EntryInfo,
}

/// Stable snapshot of directory ids. Iterating it can be restarted any
/// number of times; later directory changes are not observed.
#[derive(Clone, Debug)]
pub struct Listing {
    ids: Arc<[Id]>,
}

impl Listing {
    pub fn iter(&self) -> std::slice::Iter<'_, Id> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.ids.binary_search(id).is_ok()
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = &'a Id;
    type IntoIter = std::slice::Iter<'a, Id>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// Shared-object directory of one container.
pub struct SharedObjectDirectory {
    local_id: Id,
    factories: Arc<DescriptionRegistry<dyn SharedObject>>,
    entries: RwLock<BTreeMap<Id, Entry>>,
}

impl SharedObjectDirectory {
    pub fn new(local_id: Id, factories: Arc<DescriptionRegistry<dyn SharedObject>>) -> Self {
        Self {
            local_id,
            factories,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    /// Instantiate `descriptor` and insert it as an active, locally
    /// originated object.
    pub fn create_local(
        &self,
        descriptor: &SharedObjectDescriptor,
    ) -> Result<Arc<dyn SharedObject>> {
        self.install(descriptor, self.local_id.clone(), EntryState::Active)
    }

    /// Instantiate `descriptor` and insert it with the given origin and
    /// state. Fails with `DuplicateObject` if the id is already present,
    /// leaving the existing instance untouched.
    pub fn install(
        &self,
        descriptor: &SharedObjectDescriptor,
        origin: Id,
        state: EntryState,
    ) -> Result<Arc<dyn SharedObject>> {
        let id = &descriptor.object_id;
        if self.entries.read().contains_key(id) {
            return Err(CohortError::DuplicateObject(id.clone()));
        }

        let object: Arc<dyn SharedObject> = Arc::from(self.factories.create(
            &descriptor.implementation,
            None,
            &instantiation_args(descriptor),
        )?);

        let mut entries = self.entries.write();
        if entries.contains_key(id) {
            // Lost a race with a concurrent install of the same id.
            object.dispose();
            return Err(CohortError::DuplicateObject(id.clone()));
        }

        debug!(object = %id, origin = %origin, ?state, "installed shared object");
        entries.insert(
            id.clone(),
            Entry {
                object: object.clone(),
                info: EntryInfo {
                    origin,
                    state,
                    orphaned: false,
                },
            },
        );
        Ok(object)
    }

    /// Remove and return an active instance. A pending entry belongs to its
    /// transaction and is reported as `NotFound`.
    pub fn remove(&self, id: &Id) -> Result<Arc<dyn SharedObject>> {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some(entry) if entry.info.state == EntryState::Active => {}
            _ => return Err(CohortError::NotFound(format!("shared object {}", id))),
        }
        let entry = entries
            .remove(id)
            .ok_or_else(|| CohortError::NotFound(format!("shared object {}", id)))?;
        drop(entries);

        debug!(object = %id, "removed shared object");
        entry.object.dispose();
        Ok(entry.object)
    }

    pub fn get(&self, id: &Id) -> Result<Arc<dyn SharedObject>> {
        self.entries
            .read()
            .get(id)
            .map(|e| e.object.clone())
            .ok_or_else(|| CohortError::NotFound(format!("shared object {}", id)))
    }

    pub fn info(&self, id: &Id) -> Option<EntryInfo> {
        self.entries.read().get(id).map(|e| e.info.clone())
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Snapshot of every id currently present, pending ones included.
    pub fn list(&self) -> Listing {
        let ids: Vec<Id> = self.entries.read().keys().cloned().collect();
        Listing { ids: ids.into() }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Promote the entry installed by `txn` to active.
    pub fn activate(&self, id: &Id, txn: TransactionId) -> bool {
        match self.entries.write().get_mut(id) {
            Some(entry) if entry.info.state == EntryState::Pending(txn) => {
                entry.info.state = EntryState::Active;
                true
            }
            _ => false,
        }
    }

    /// Remove the entry only if it is still pending for `txn`.
    pub fn discard_pending(&self, id: &Id, txn: TransactionId) -> Option<Arc<dyn SharedObject>> {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some(entry) if entry.info.state == EntryState::Pending(txn) => {}
            _ => return None,
        }
        let entry = entries.remove(id)?;
        drop(entries);

        debug!(object = %id, %txn, "discarded pending shared object");
        entry.object.dispose();
        Some(entry.object)
    }

    /// Replica descriptors of the active objects `origin` created.
    pub fn replicas_originated_by(&self, origin: &Id) -> Vec<SharedObjectDescriptor> {
        self.entries
            .read()
            .values()
            .filter(|e| e.info.state == EntryState::Active && &e.info.origin == origin)
            .map(|e| e.object.replica_descriptor())
            .collect()
    }

    /// Replica descriptors of the active objects whose origin left the group.
    pub fn orphaned_replicas(&self) -> Vec<SharedObjectDescriptor> {
        self.entries
            .read()
            .values()
            .filter(|e| e.info.state == EntryState::Active && e.info.orphaned)
            .map(|e| e.object.replica_descriptor())
            .collect()
    }

    /// Drop every pending entry installed on behalf of another container.
    pub fn discard_foreign_pending(&self) -> Vec<Id> {
        let mut entries = self.entries.write();
        let foreign: Vec<Id> = entries
            .iter()
            .filter(|(_, e)| {
                matches!(e.info.state, EntryState::Pending(_)) && e.info.origin != self.local_id
            })
            .map(|(id, _)| id.clone())
            .collect();
        let removed: Vec<Entry> = foreign.iter().filter_map(|id| entries.remove(id)).collect();
        drop(entries);

        for entry in &removed {
            entry.object.dispose();
        }
        if !foreign.is_empty() {
            debug!(count = foreign.len(), "discarded foreign pending objects");
        }
        foreign
    }

    /// Mark every object created by `departed` as orphaned and return
    /// their ids.
    pub fn mark_orphaned(&self, departed: &Id) -> Vec<Id> {
        let mut entries = self.entries.write();
        entries
            .iter_mut()
            .filter(|(_, e)| &e.info.origin == departed)
            .map(|(id, e)| {
                e.info.orphaned = true;
                id.clone()
            })
            .collect()
    }
}
