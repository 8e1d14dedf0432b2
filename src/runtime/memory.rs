//! Scoped key/value memory owned by blocks
//!
//! Entries are allocated against an owner block key and released en masse
//! when that owner is popped. Allocation, lookup and update are O(1);
//! search is a linear scan meant for once-per-lifecycle-step use.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::clock::TimeSpan;
use super::error::{MemoryError, MemoryResult};
use super::ids::{BlockKey, IdSequence, MemoryId, SubscriptionId};
use crate::script::Fragment;

/// Who may discover an entry through search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Discoverable by any block
    #[default]
    Public,
    /// Only the owner can see it
    Private,
    /// The owner and blocks stacked above it
    Inherited,
}

/// Value held by a memory entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MemoryValue {
    /// No value yet
    #[default]
    Empty,
    /// Flag
    Bool(bool),
    /// Counter
    Integer(i64),
    /// Measurement
    Number(f64),
    /// Label
    Text(String),
    /// Timer spans
    Spans(Vec<TimeSpan>),
    /// Fragment list
    Fragments(Vec<Fragment>),
    /// Arbitrary structured data
    Json(serde_json::Value),
}

impl MemoryValue {
    /// Integer payload, if any
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            MemoryValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Bool payload, if any
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MemoryValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Span payload, if any
    pub fn as_spans(&self) -> Option<&[TimeSpan]> {
        match self {
            MemoryValue::Spans(spans) => Some(spans),
            _ => None,
        }
    }

    /// Text payload, if any
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MemoryValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Handle to an allocated entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryRef {
    /// Entry id
    pub id: MemoryId,
    /// Entry type tag (e.g. "timer", "rounds")
    pub memory_type: String,
    /// Owning block
    pub owner: BlockKey,
    /// Search visibility
    pub visibility: Visibility,
}

/// Search filter; every populated field must match
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    /// Match this id
    pub id: Option<MemoryId>,
    /// Match this owner
    pub owner: Option<BlockKey>,
    /// Match this type tag
    pub memory_type: Option<String>,
    /// Match this visibility
    pub visibility: Option<Visibility>,
}

impl SearchCriteria {
    /// Entries owned by `owner`
    pub fn owned_by(owner: BlockKey) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    /// Entries of type `memory_type`
    pub fn of_type(memory_type: impl Into<String>) -> Self {
        Self {
            memory_type: Some(memory_type.into()),
            ..Self::default()
        }
    }

    /// Narrow by type
    pub fn with_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = Some(memory_type.into());
        self
    }

    /// Narrow by owner
    pub fn with_owner(mut self, owner: BlockKey) -> Self {
        self.owner = Some(owner);
        self
    }

    fn matches(&self, reference: &MemoryRef) -> bool {
        self.id.is_none_or(|id| id == reference.id)
            && self.owner.is_none_or(|owner| owner == reference.owner)
            && self
                .memory_type
                .as_deref()
                .is_none_or(|t| t == reference.memory_type)
            && self
                .visibility
                .is_none_or(|v| v == reference.visibility)
    }
}

/// Listener called with `(new, old)`; `new` is `None` on release
pub type MemoryListener = Arc<dyn Fn(Option<&MemoryValue>, Option<&MemoryValue>) + Send + Sync>;

/// Serializable view of one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshotEntry {
    /// Entry handle
    pub reference: MemoryRef,
    /// Current value
    pub value: MemoryValue,
}

#[derive(Debug)]
struct MemoryEntry {
    reference: MemoryRef,
    value: MemoryValue,
}

/// Scoped memory store
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<MemoryId, MemoryEntry>,
    owners: HashMap<BlockKey, Vec<MemoryId>>,
    listeners: HashMap<MemoryId, Vec<(SubscriptionId, MemoryListener)>>,
    ids: IdSequence,
    subscription_ids: IdSequence,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new entry for `owner`
    pub fn allocate(
        &mut self,
        memory_type: impl Into<String>,
        owner: BlockKey,
        initial: MemoryValue,
        visibility: Visibility,
    ) -> MemoryRef {
        let reference = MemoryRef {
            id: MemoryId(self.ids.next()),
            memory_type: memory_type.into(),
            owner,
            visibility,
        };

        tracing::trace!(
            id = %reference.id,
            owner = %owner,
            memory_type = %reference.memory_type,
            "allocate"
        );

        self.owners.entry(owner).or_default().push(reference.id);
        self.entries.insert(
            reference.id,
            MemoryEntry {
                reference: reference.clone(),
                value: initial,
            },
        );
        reference
    }

    /// Current value, or `None` if released
    pub fn get(&self, reference: &MemoryRef) -> Option<&MemoryValue> {
        self.entries.get(&reference.id).map(|entry| &entry.value)
    }

    /// Current value, failing on released references
    pub fn require(&self, reference: &MemoryRef) -> MemoryResult<&MemoryValue> {
        self.get(reference)
            .ok_or(MemoryError::UnknownReference(reference.id))
    }

    /// Whether the reference is still allocated
    pub fn contains(&self, reference: &MemoryRef) -> bool {
        self.entries.contains_key(&reference.id)
    }

    /// Replace the value; fails if the reference was released
    pub fn set(&mut self, reference: &MemoryRef, value: MemoryValue) -> MemoryResult<()> {
        let entry = self
            .entries
            .get_mut(&reference.id)
            .ok_or(MemoryError::UnknownReference(reference.id))?;

        let old = std::mem::replace(&mut entry.value, value);
        if let Some(listeners) = self.listeners.get(&reference.id) {
            let new = &entry.value;
            for (_, listener) in listeners {
                listener(Some(new), Some(&old));
            }
        }
        Ok(())
    }

    /// Apply `f` to the current value in place
    pub fn update<F>(&mut self, reference: &MemoryRef, f: F) -> MemoryResult<()>
    where
        F: FnOnce(&mut MemoryValue),
    {
        let mut value = self.require(reference)?.clone();
        f(&mut value);
        self.set(reference, value)
    }

    /// All entries matching every populated field of `criteria`
    pub fn search(&self, criteria: &SearchCriteria) -> Vec<MemoryRef> {
        if let Some(id) = criteria.id {
            return self
                .entries
                .get(&id)
                .filter(|entry| criteria.matches(&entry.reference))
                .map(|entry| vec![entry.reference.clone()])
                .unwrap_or_default();
        }

        let mut found: Vec<MemoryRef> = match criteria.owner {
            Some(owner) => self
                .owners
                .get(&owner)
                .into_iter()
                .flatten()
                .filter_map(|id| self.entries.get(id))
                .filter(|entry| criteria.matches(&entry.reference))
                .map(|entry| entry.reference.clone())
                .collect(),
            None => self
                .entries
                .values()
                .filter(|entry| criteria.matches(&entry.reference))
                .map(|entry| entry.reference.clone())
                .collect(),
        };
        found.sort_by_key(|r| r.id);
        found
    }

    /// Search as seen by `requester`, whose ancestors on the stack are `ancestors`
    pub fn search_visible(
        &self,
        criteria: &SearchCriteria,
        requester: BlockKey,
        ancestors: &[BlockKey],
    ) -> Vec<MemoryRef> {
        self.search(criteria)
            .into_iter()
            .filter(|r| match r.visibility {
                Visibility::Public => true,
                Visibility::Private => r.owner == requester,
                Visibility::Inherited => r.owner == requester || ancestors.contains(&r.owner),
            })
            .collect()
    }

    /// Release one entry, notifying subscribers with `(None, last)`.
    ///
    /// Returns `false` if it was already released.
    pub fn release(&mut self, reference: &MemoryRef) -> bool {
        self.release_id(reference.id)
    }

    fn release_id(&mut self, id: MemoryId) -> bool {
        let Some(entry) = self.entries.get(&id) else {
            return false;
        };

        if let Some(listeners) = self.listeners.remove(&id) {
            for (_, listener) in listeners {
                listener(None, Some(&entry.value));
            }
        }

        if let Some(entry) = self.entries.remove(&id) {
            if let Some(ids) = self.owners.get_mut(&entry.reference.owner) {
                ids.retain(|owned| *owned != id);
                if ids.is_empty() {
                    self.owners.remove(&entry.reference.owner);
                }
            }
        }
        true
    }

    /// Release everything owned by `owner`; returns how many entries were removed
    pub fn release_by_owner(&mut self, owner: BlockKey) -> usize {
        let ids = self.owners.get(&owner).cloned().unwrap_or_default();
        let released = ids.into_iter().filter(|id| self.release_id(*id)).count();
        if released > 0 {
            tracing::debug!(owner = %owner, released, "released block memory");
        }
        released
    }

    /// Subscribe to changes of one entry
    pub fn subscribe(
        &mut self,
        reference: &MemoryRef,
        listener: MemoryListener,
    ) -> MemoryResult<SubscriptionId> {
        if !self.contains(reference) {
            return Err(MemoryError::UnknownReference(reference.id));
        }
        let id = SubscriptionId(self.subscription_ids.next());
        self.listeners
            .entry(reference.id)
            .or_default()
            .push((id, listener));
        Ok(id)
    }

    /// Remove a subscription; unknown ids are ignored
    pub fn unsubscribe(&mut self, subscription: SubscriptionId) {
        self.listeners.retain(|_, listeners| {
            listeners.retain(|(id, _)| *id != subscription);
            !listeners.is_empty()
        });
    }

    /// Serializable copy of every entry, ordered by id
    pub fn snapshot(&self) -> Vec<MemorySnapshotEntry> {
        let mut entries: Vec<MemorySnapshotEntry> = self
            .entries
            .values()
            .map(|entry| MemorySnapshotEntry {
                reference: entry.reference.clone(),
                value: entry.value.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.reference.id);
        entries
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_allocate_get_set() {
        let mut store = MemoryStore::new();
        let owner = BlockKey::new();
        let r = store.allocate("counter", owner, MemoryValue::Integer(1), Visibility::Public);

        assert_eq!(store.get(&r), Some(&MemoryValue::Integer(1)));
        store.set(&r, MemoryValue::Integer(2)).unwrap();
        assert_eq!(store.get(&r).and_then(MemoryValue::as_integer), Some(2));
    }

    #[test]
    fn test_set_after_release_fails() {
        let mut store = MemoryStore::new();
        let r = store.allocate("x", BlockKey::new(), MemoryValue::Empty, Visibility::Public);
        assert!(store.release(&r));
        assert!(matches!(
            store.set(&r, MemoryValue::Bool(true)),
            Err(MemoryError::UnknownReference(_))
        ));
        assert!(!store.release(&r));
    }

    #[test]
    fn test_search_by_fields() {
        let mut store = MemoryStore::new();
        let a = BlockKey::new();
        let b = BlockKey::new();
        store.allocate("timer", a, MemoryValue::Empty, Visibility::Public);
        store.allocate("rounds", a, MemoryValue::Integer(0), Visibility::Private);
        store.allocate("timer", b, MemoryValue::Empty, Visibility::Public);

        assert_eq!(store.search(&SearchCriteria::of_type("timer")).len(), 2);
        assert_eq!(store.search(&SearchCriteria::owned_by(a)).len(), 2);
        assert_eq!(
            store
                .search(&SearchCriteria::owned_by(a).with_type("timer"))
                .len(),
            1
        );
        assert_eq!(store.search(&SearchCriteria::default()).len(), 3);
    }

    #[test]
    fn test_private_entries_hidden_from_others() {
        let mut store = MemoryStore::new();
        let parent = BlockKey::new();
        let child = BlockKey::new();
        store.allocate("secret", parent, MemoryValue::Empty, Visibility::Private);
        store.allocate("shared", parent, MemoryValue::Empty, Visibility::Inherited);

        let all = SearchCriteria::owned_by(parent);
        assert_eq!(store.search_visible(&all, parent, &[]).len(), 2);
        assert_eq!(store.search_visible(&all, child, &[parent]).len(), 1);
        assert!(store.search_visible(&all, child, &[]).is_empty());
    }

    #[test]
    fn test_release_by_owner_notifies_and_clears() {
        let mut store = MemoryStore::new();
        let owner = BlockKey::new();
        let other = BlockKey::new();
        let r = store.allocate("a", owner, MemoryValue::Integer(7), Visibility::Public);
        store.allocate("b", owner, MemoryValue::Empty, Visibility::Public);
        store.allocate("c", other, MemoryValue::Empty, Visibility::Public);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store
            .subscribe(
                &r,
                Arc::new(move |new, old| {
                    sink.lock().push((new.cloned(), old.cloned()));
                }),
            )
            .unwrap();

        assert_eq!(store.release_by_owner(owner), 2);
        assert!(store.search(&SearchCriteria::owned_by(owner)).is_empty());
        assert_eq!(store.len(), 1);
        assert_eq!(
            seen.lock().as_slice(),
            &[(None, Some(MemoryValue::Integer(7)))]
        );

        assert_eq!(store.release_by_owner(owner), 0);
    }

    #[test]
    fn test_subscribers_see_updates() {
        let mut store = MemoryStore::new();
        let r = store.allocate("n", BlockKey::new(), MemoryValue::Integer(0), Visibility::Public);
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let sub = store
            .subscribe(&r, Arc::new(move |_, _| *sink.lock() += 1))
            .unwrap();

        store.update(&r, |v| *v = MemoryValue::Integer(1)).unwrap();
        store.unsubscribe(sub);
        store.set(&r, MemoryValue::Integer(2)).unwrap();
        assert_eq!(*count.lock(), 1);
        assert!(store.listeners.is_empty());
    }

    #[test]
    fn test_snapshot_orders_live_entries() {
        let mut store = MemoryStore::new();
        let owner = BlockKey::new();
        let first = store.allocate("timer", owner, MemoryValue::Integer(3), Visibility::Public);
        let gone = store.allocate("scratch", owner, MemoryValue::Empty, Visibility::Private);
        let last = store.allocate("rounds", BlockKey::new(), MemoryValue::Integer(1), Visibility::Public);
        store.set(&first, MemoryValue::Integer(4)).unwrap();
        store.release(&gone);

        let snapshot = store.snapshot();
        let ids: Vec<MemoryId> = snapshot.iter().map(|e| e.reference.id).collect();
        assert_eq!(ids, vec![first.id, last.id]);
        assert_eq!(snapshot[0].value, MemoryValue::Integer(4));
        assert_eq!(snapshot[0].reference.memory_type, "timer");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(2));
    }
}
