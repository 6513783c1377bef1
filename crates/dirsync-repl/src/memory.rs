//! In-memory directory backend.
//!
//! Used by the simulator binary and by tests. Each write transaction stages
//! a copy of the state while holding the store lock and swaps it in on
//! commit, so an aborted transaction leaves no trace.

use crate::backend::{Backend, WriteTxn};
use crate::entry::{normalize_dn, parent_dn, ChangeState, Entry, EntryId, ModifyRequest};
use crate::error::{ReplError, Result};
use crate::metadata::{
    is_control_attr, is_usn_marker, AttributeMetadata, ValueMetadata, USN_CHANGED_ATTR, USN_CREATED_ATTR,
};
use crate::mutator::embed_metadata;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    last_usn: u64,
    last_id: u64,
    entries: BTreeMap<EntryId, Entry>,
    by_dn: HashMap<String, EntryId>,
    by_guid: HashMap<String, EntryId>,
    attr_meta: HashMap<EntryId, BTreeMap<String, AttributeMetadata>>,
    value_meta: HashMap<EntryId, BTreeMap<String, Vec<ValueMetadata>>>,
}

impl MemoryState {
    fn id_for_dn(&self, dn: &str) -> Option<EntryId> {
        self.by_dn.get(&normalize_dn(dn)).copied()
    }
}

/// One exported change, as served to a pulling partner.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedChange {
    /// Kind of change.
    pub state: ChangeState,
    /// Supplier-local sequence number of the change.
    pub usn: u64,
    /// Entry content with metadata attributes embedded.
    pub entry: Entry,
}

/// In-memory directory store rooted at a naming-context DN.
#[derive(Debug)]
pub struct MemoryBackend {
    base_dn: String,
    state: Mutex<MemoryState>,
    pending_deadlocks: AtomicU32,
}

impl MemoryBackend {
    /// Create a store whose root entry is `base_dn`.
    pub fn new(base_dn: &str) -> Self {
        let mut state = MemoryState::default();
        state.last_id = 1;
        let root = EntryId(1);
        state.entries.insert(root, Entry::new(base_dn));
        state.by_dn.insert(normalize_dn(base_dn), root);
        Self {
            base_dn: base_dn.to_string(),
            state: Mutex::new(state),
            pending_deadlocks: AtomicU32::new(0),
        }
    }

    /// Naming-context root DN.
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Make the next `count` commits fail with a deadlock.
    pub fn inject_deadlocks(&self, count: u32) {
        self.pending_deadlocks.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| ReplError::Backend {
            msg: "memory store lock poisoned".to_string(),
        })
    }

    /// Entry stored under a DN.
    pub fn entry(&self, dn: &str) -> Result<Option<Entry>> {
        let state = self.lock()?;
        Ok(state.id_for_dn(dn).and_then(|id| state.entries.get(&id).cloned()))
    }

    /// Stored attribute metadata for an entry, by DN.
    pub fn attr_meta(&self, dn: &str, attr: &str) -> Result<Option<AttributeMetadata>> {
        let state = self.lock()?;
        Ok(state.id_for_dn(dn).and_then(|id| {
            state
                .attr_meta
                .get(&id)
                .and_then(|metas| metas.get(&crate::entry::attr_key(attr)).cloned())
        }))
    }

    /// Stored value-level metadata for one attribute of an entry, by DN.
    pub fn value_meta(&self, dn: &str, attr: &str) -> Result<Vec<ValueMetadata>> {
        let state = self.lock()?;
        Ok(state
            .id_for_dn(dn)
            .and_then(|id| state.value_meta.get(&id))
            .and_then(|by_attr| by_attr.get(&crate::entry::attr_key(attr)).cloned())
            .unwrap_or_default())
    }

    /// Number of entries, the root included.
    pub fn entry_count(&self) -> Result<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Highest sequence number allocated so far.
    pub fn last_usn(&self) -> Result<u64> {
        Ok(self.lock()?.last_usn)
    }

    /// Content of every replicated entry keyed by normalized DN, local
    /// sequence markers left out and values sorted. Two converged replicas return equal maps.
    pub fn replicated_content(&self) -> Result<BTreeMap<String, Vec<(String, Vec<Vec<u8>>)>>> {
        let state = self.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|(id, _)| state.attr_meta.contains_key(id))
            .map(|(_, entry)| {
                let attrs = entry
                    .attrs()
                    .filter(|(name, _)| !is_usn_marker(name) && !is_control_attr(name))
                    .map(|(name, values)| {
                        let mut values = values.to_vec();
                        values.sort();
                        (name.to_string(), values)
                    })
                    .collect();
                (normalize_dn(&entry.dn), attrs)
            })
            .collect())
    }

    /// Replicated entries changed after `since`, ordered by their change USN,
    /// with attribute and value metadata embedded as control attributes.
    pub fn changes_since(&self, since: u64) -> Result<Vec<ExportedChange>> {
        let state = self.lock()?;
        let mut changes = Vec::new();
        for (id, entry) in &state.entries {
            let usn_of = |attr: &str| -> u64 {
                entry
                    .first_str(attr)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0)
            };
            let changed = usn_of(USN_CHANGED_ATTR);
            if changed <= since {
                continue;
            }
            let Some(metas) = state.attr_meta.get(id) else {
                continue;
            };
            // Only records of the attribute's current generation are in scope for a partner.
            let values: Vec<ValueMetadata> = state
                .value_meta
                .get(id)
                .map(|by_attr| {
                    by_attr
                        .iter()
                        .filter_map(|(attr, records)| metas.get(attr).map(|current| (current, records)))
                        .flat_map(|(current, records)| {
                            records.iter().filter(|r| r.meta.same_generation(current)).cloned()
                        })
                        .collect()
                })
                .unwrap_or_default();
            let metas: Vec<AttributeMetadata> = metas.values().cloned().collect();
            let mut exported = entry.clone();
            embed_metadata(&mut exported, &metas, &values);
            let change_state = if entry.is_deleted() {
                ChangeState::Delete
            } else if usn_of(USN_CREATED_ATTR) > since {
                ChangeState::Add
            } else {
                ChangeState::Modify
            };
            changes.push(ExportedChange {
                state: change_state,
                usn: changed,
                entry: exported,
            });
        }
        changes.sort_by_key(|c| c.usn);
        Ok(changes)
    }
}

impl Backend for MemoryBackend {
    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>> {
        let guard = self.lock()?;
        let staged = guard.clone();
        Ok(Box::new(MemoryTxn {
            guard,
            staged,
            base_dn: normalize_dn(&self.base_dn),
            pending_deadlocks: &self.pending_deadlocks,
        }))
    }
}

struct MemoryTxn<'a> {
    guard: MutexGuard<'a, MemoryState>,
    staged: MemoryState,
    base_dn: String,
    pending_deadlocks: &'a AtomicU32,
}

impl WriteTxn for MemoryTxn<'_> {
    fn next_usn(&mut self) -> Result<u64> {
        self.staged.last_usn += 1;
        Ok(self.staged.last_usn)
    }

    fn highest_usn(&self) -> Result<u64> {
        Ok(self.staged.last_usn)
    }

    fn get_attr_meta(&self, id: EntryId, attr: &str) -> Result<Option<AttributeMetadata>> {
        Ok(self
            .staged
            .attr_meta
            .get(&id)
            .and_then(|metas| metas.get(&crate::entry::attr_key(attr)).cloned()))
    }

    fn put_attr_meta(&mut self, id: EntryId, meta: &AttributeMetadata) -> Result<()> {
        self.staged
            .attr_meta
            .entry(id)
            .or_default()
            .insert(crate::entry::attr_key(&meta.attr), meta.clone());
        Ok(())
    }

    fn get_value_meta(&self, id: EntryId, attr: &str) -> Result<Vec<ValueMetadata>> {
        Ok(self
            .staged
            .value_meta
            .get(&id)
            .and_then(|by_attr| by_attr.get(&crate::entry::attr_key(attr)).cloned())
            .unwrap_or_default())
    }

    fn put_value_meta(&mut self, id: EntryId, meta: &ValueMetadata) -> Result<()> {
        let records = self
            .staged
            .value_meta
            .entry(id)
            .or_default()
            .entry(crate::entry::attr_key(meta.attr()))
            .or_default();
        records.retain(|r| r.value != meta.value);
        records.push(meta.clone());
        Ok(())
    }

    fn clear_value_meta(&mut self, id: EntryId, attr: &str) -> Result<()> {
        if let Some(by_attr) = self.staged.value_meta.get_mut(&id) {
            by_attr.remove(&crate::entry::attr_key(attr));
        }
        Ok(())
    }

    fn entry_id_for_dn(&self, dn: &str) -> Result<Option<EntryId>> {
        Ok(self.staged.id_for_dn(dn))
    }

    fn entry_id_for_guid(&self, guid: &str) -> Result<Option<EntryId>> {
        Ok(self.staged.by_guid.get(guid).copied())
    }

    fn fetch_entry(&self, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.staged.entries.get(&id).cloned())
    }

    fn children(&self, dn: &str) -> Result<Vec<Entry>> {
        let key = normalize_dn(dn);
        Ok(self
            .staged
            .entries
            .values()
            .filter(|e| parent_dn(&e.dn).map(normalize_dn).as_deref() == Some(key.as_str()))
            .cloned()
            .collect())
    }

    fn add_entry(&mut self, entry: Entry) -> Result<EntryId> {
        let key = normalize_dn(&entry.dn);
        if self.staged.by_dn.contains_key(&key) {
            return Err(ReplError::EntryAlreadyExists { dn: entry.dn });
        }
        if key != self.base_dn {
            let parent_present = parent_dn(&entry.dn)
                .map(|p| self.staged.id_for_dn(p).is_some())
                .unwrap_or(false);
            if !parent_present {
                return Err(ReplError::NoSuchParent { dn: entry.dn });
            }
        }
        let guid = entry.guid();
        if let Some(guid) = &guid {
            if self.staged.by_guid.contains_key(guid) {
                return Err(ReplError::EntryAlreadyExists { dn: entry.dn });
            }
        }
        self.staged.last_id += 1;
        let id = EntryId(self.staged.last_id);
        self.staged.by_dn.insert(key, id);
        if let Some(guid) = guid {
            self.staged.by_guid.insert(guid, id);
        }
        self.staged.entries.insert(id, entry);
        Ok(id)
    }

    fn modify_entry(&mut self, req: &ModifyRequest) -> Result<()> {
        let id = self
            .staged
            .id_for_dn(&req.dn)
            .ok_or_else(|| ReplError::NoSuchObject { dn: req.dn.clone() })?;
        let entry = self
            .staged
            .entries
            .get_mut(&id)
            .ok_or_else(|| ReplError::NoSuchObject { dn: req.dn.clone() })?;
        let old_guid = entry.guid();
        for op in &req.ops {
            entry.apply(op);
        }
        let new_guid = entry.guid();
        if old_guid != new_guid {
            if let Some(old) = old_guid {
                self.staged.by_guid.remove(&old);
            }
            if let Some(new) = new_guid {
                self.staged.by_guid.insert(new, id);
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let injected = self
            .pending_deadlocks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(ReplError::Deadlock);
        }
        *self.guard = std::mem::take(&mut self.staged);
        Ok(())
    }

    fn abort(&mut self) {
        self.staged = self.guard.clone();
    }
}
