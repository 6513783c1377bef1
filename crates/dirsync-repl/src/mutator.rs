//! Applies replicated Add/Modify/Delete units to the local directory.
//!
//! Each unit is resolved attribute by attribute (and value by value for
//! multi-valued attributes carrying value metadata) and written in one
//! entry-scoped backend transaction. A Delete is a Modify that sets the
//! tombstone flag.

use crate::backend::{Backend, TxnGuard, WriteTxn};
use crate::entry::{attr_key, rdn, ChangeState, Entry, EntryId, ModOp, ModifyRequest};
use crate::error::{ReplError, Result};
use crate::metadata::{
    is_usn_marker, AttributeMetadata, InvocationId, ValueMetadata, ValueOp, IS_DELETED_ATTR,
    META_ATTR, OBJECT_GUID_ATTR, USN_CHANGED_ATTR, USN_CREATED_ATTR, VALUE_META_ATTR,
};
use crate::resolver::{is_benign_conflict, ConflictResolver, Winner};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::Level;

/// Configuration for the entry mutator.
#[derive(Debug, Clone)]
pub struct MutatorConfig {
    /// Invocation id of the local replica.
    pub local_id: InvocationId,
    /// Attempts per entry before a deadlock becomes fatal.
    pub max_deadlock_retries: u32,
    /// RDNs of well-known singleton objects whose identity is adopted from partners.
    pub singleton_rdns: Vec<String>,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            local_id: InvocationId::generate(),
            max_deadlock_retries: 3,
            singleton_rdns: vec!["cn=Administrator".to_string(), "cn=Deleted Objects".to_string()],
        }
    }
}

/// One replicated change unit, with metadata embedded in the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingChange {
    /// Kind of change.
    pub state: ChangeState,
    /// Entry content including the metadata control attributes.
    pub entry: Entry,
}

impl IncomingChange {
    /// Create a change unit.
    pub fn new(state: ChangeState, entry: Entry) -> Self {
        Self { state, entry }
    }
}

/// Counters describing how one unit was resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Attributes where the supplier won.
    pub attrs_won: u32,
    /// Attributes where the local record won.
    pub attrs_lost: u32,
    /// Value changes applied.
    pub values_applied: u32,
    /// Value changes found out of scope.
    pub values_rejected: u32,
    /// Attributes where both sides held different generations.
    pub conflicts: u32,
}

/// Result of applying one change unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Something was written.
    Applied(ApplyStats),
    /// Every attribute and value resolved to the local side; nothing written.
    NoChange(ApplyStats),
    /// Delete for an entry this replica never had.
    NotPresent,
}

impl ApplyOutcome {
    /// Resolution counters, zero for `NotPresent`.
    pub fn stats(&self) -> ApplyStats {
        match self {
            ApplyOutcome::Applied(stats) | ApplyOutcome::NoChange(stats) => *stats,
            ApplyOutcome::NotPresent => ApplyStats::default(),
        }
    }
}

/// Split the metadata control attributes off an entry and parse them.
pub fn detach_metadata(entry: &mut Entry) -> Result<(Vec<AttributeMetadata>, Vec<ValueMetadata>)> {
    let metas = entry
        .remove(META_ATTR)
        .unwrap_or_default()
        .iter()
        .map(|raw| String::from_utf8_lossy(raw).parse())
        .collect::<Result<Vec<AttributeMetadata>>>()?;
    let values = entry
        .remove(VALUE_META_ATTR)
        .unwrap_or_default()
        .iter()
        .map(|raw| String::from_utf8_lossy(raw).parse())
        .collect::<Result<Vec<ValueMetadata>>>()?;
    Ok((metas, values))
}

/// Embed metadata records as control attributes of an entry.
pub fn embed_metadata(entry: &mut Entry, metas: &[AttributeMetadata], values: &[ValueMetadata]) {
    entry.set(
        META_ATTR,
        metas.iter().map(|m| m.to_string().into_bytes()).collect(),
    );
    entry.set(
        VALUE_META_ATTR,
        values.iter().map(|v| v.to_string().into_bytes()).collect(),
    );
}

fn restamp_value(value: &ValueMetadata, usn: u64) -> ValueMetadata {
    ValueMetadata {
        meta: value.meta.restamped(usn),
        ..value.clone()
    }
}

fn same_value_fact(a: &ValueMetadata, b: &ValueMetadata) -> bool {
    a.value == b.value
        && a.op == b.op
        && a.meta.same_generation(&b.meta)
        && a.meta.originating_time == b.meta.originating_time
}

fn usn_value(usn: u64) -> Vec<Vec<u8>> {
    vec![usn.to_string().into_bytes()]
}

/// Per-value operations turning the `local` values of `attr` into `target`.
fn value_delta(attr: &str, local: Option<&[Vec<u8>]>, target: Option<&[Vec<u8>]>) -> Vec<ModOp> {
    let local = local.unwrap_or_default();
    let target = target.unwrap_or_default();
    let deletes = local
        .iter()
        .filter(|v| !target.contains(v))
        .map(|v| ModOp::DeleteValue {
            attr: attr.to_string(),
            value: v.clone(),
        });
    let adds = target
        .iter()
        .filter(|v| !local.contains(v))
        .map(|v| ModOp::AddValue {
            attr: attr.to_string(),
            value: v.clone(),
        });
    deletes.chain(adds).collect()
}

/// Originating `(invocation id, usn)` of every attribute and value record
/// embedded in an entry.
pub fn originating_writes(entry: &Entry) -> Result<Vec<(InvocationId, u64)>> {
    let mut writes = Vec::new();
    for raw in entry.get(META_ATTR).unwrap_or_default() {
        let meta: AttributeMetadata = String::from_utf8_lossy(raw).parse()?;
        writes.push((meta.originating_id, meta.originating_usn));
    }
    for raw in entry.get(VALUE_META_ATTR).unwrap_or_default() {
        let value: ValueMetadata = String::from_utf8_lossy(raw).parse()?;
        writes.push((value.meta.originating_id, value.meta.originating_usn));
    }
    Ok(writes)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

enum Located {
    Found(EntryId, Entry),
    DnClash(EntryId, Entry),
    Absent,
}

fn locate(txn: &dyn WriteTxn, entry: &Entry) -> Result<Located> {
    let guid = entry.guid();
    if let Some(guid) = &guid {
        if let Some(id) = txn.entry_id_for_guid(guid)? {
            if let Some(local) = txn.fetch_entry(id)? {
                return Ok(Located::Found(id, local));
            }
        }
    }
    let Some(id) = txn.entry_id_for_dn(&entry.dn)? else {
        return Ok(Located::Absent);
    };
    let Some(local) = txn.fetch_entry(id)? else {
        return Ok(Located::Absent);
    };
    if guid.is_some() {
        Ok(Located::DnClash(id, local))
    } else {
        Ok(Located::Found(id, local))
    }
}

/// Applies replicated changes and authors local ones.
#[derive(Debug, Clone)]
pub struct EntryMutator {
    config: MutatorConfig,
}

impl EntryMutator {
    /// Create a mutator.
    pub fn new(config: MutatorConfig) -> Self {
        Self { config }
    }

    /// Invocation id of the local replica.
    pub fn local_id(&self) -> &InvocationId {
        &self.config.local_id
    }

    /// Apply one replicated unit, retrying the whole transaction on deadlock.
    pub fn apply(&self, backend: &dyn Backend, change: &IncomingChange) -> Result<ApplyOutcome> {
        let max = self.config.max_deadlock_retries.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.apply_once(backend, change) {
                Err(ReplError::Deadlock) if attempts < max => {
                    tracing::debug!(dn = %change.entry.dn, attempts, "deadlock applying entry, retrying");
                }
                Err(ReplError::Deadlock) => {
                    return Err(ReplError::DeadlockRetriesExhausted { attempts });
                }
                other => return other,
            }
        }
    }

    fn is_singleton(&self, dn: &str) -> bool {
        let first = rdn(dn).trim();
        self.config
            .singleton_rdns
            .iter()
            .any(|s| s.eq_ignore_ascii_case(first))
    }

    fn apply_once(&self, backend: &dyn Backend, change: &IncomingChange) -> Result<ApplyOutcome> {
        let mut entry = change.entry.clone();
        let (metas, values) = detach_metadata(&mut entry)?;
        if metas.is_empty() {
            return Err(ReplError::MissingMetadata { dn: entry.dn });
        }

        let mut txn = TxnGuard::begin(backend)?;
        let local = match locate(&*txn, &entry)? {
            Located::Found(id, local) => Some((id, local)),
            Located::Absent => None,
            Located::DnClash(id, local) if self.is_singleton(&entry.dn) => {
                let mut req = ModifyRequest::new(local.dn.clone());
                req.ops.push(ModOp::Replace {
                    attr: OBJECT_GUID_ATTR.to_string(),
                    values: entry.get(OBJECT_GUID_ATTR).map(<[Vec<u8>]>::to_vec).unwrap_or_default(),
                });
                txn.modify_entry(&req)?;
                tracing::info!(dn = %local.dn, "adopted partner identity for well-known object");
                let local = txn
                    .fetch_entry(id)?
                    .ok_or_else(|| ReplError::NoSuchObject { dn: local.dn.clone() })?;
                Some((id, local))
            }
            Located::DnClash(..) => {
                return Err(ReplError::EntryAlreadyExists { dn: entry.dn });
            }
        };

        match (change.state, local) {
            (ChangeState::Delete, None) => {
                tracing::debug!(dn = %entry.dn, "delete for unknown entry ignored");
                Ok(ApplyOutcome::NotPresent)
            }
            (_, None) => self.add_in(txn, entry, &metas, &values),
            (_, Some((id, local))) => self.modify_in(txn, id, local, entry, &metas, &values),
        }
    }

    fn add_in(
        &self,
        mut txn: TxnGuard<'_>,
        mut entry: Entry,
        metas: &[AttributeMetadata],
        values: &[ValueMetadata],
    ) -> Result<ApplyOutcome> {
        let usn = txn.next_usn()?;
        entry.set(USN_CREATED_ATTR, usn_value(usn));
        entry.set(USN_CHANGED_ATTR, usn_value(usn));
        let dn = entry.dn.clone();
        let id = txn.add_entry(entry)?;
        for meta in metas {
            txn.put_attr_meta(id, &meta.restamped(usn))?;
        }
        for value in values {
            txn.put_value_meta(id, &restamp_value(value, usn))?;
        }
        txn.commit()?;
        tracing::debug!(dn = %dn, usn, "replicated add applied");
        Ok(ApplyOutcome::Applied(ApplyStats {
            attrs_won: metas.iter().filter(|m| !is_usn_marker(&m.attr)).count() as u32,
            values_applied: values.len() as u32,
            ..ApplyStats::default()
        }))
    }

    fn modify_in(
        &self,
        mut txn: TxnGuard<'_>,
        id: EntryId,
        local: Entry,
        entry: Entry,
        metas: &[AttributeMetadata],
        values: &[ValueMetadata],
    ) -> Result<ApplyOutcome> {
        let usn = txn.next_usn()?;
        let value_attrs: HashSet<String> = values.iter().map(|v| attr_key(v.attr())).collect();
        let mut req = ModifyRequest::new(local.dn.clone());
        let mut stamped = Vec::new();
        // Value-tracked attributes whose generation the supplier won, by key.
        let mut adopted: HashMap<String, AttributeMetadata> = HashMap::new();
        let mut adopted_values = Vec::new();
        let mut accepted_values = Vec::new();
        let mut stats = ApplyStats::default();

        {
            let mut resolver = ConflictResolver::new(&*txn);
            for meta in metas {
                let res = resolver.resolve_attribute(id, meta, usn)?;
                if res.conflict {
                    stats.conflicts += 1;
                }
                let marker = is_usn_marker(&meta.attr);
                match res.winner {
                    Winner::Supplier if !marker => {
                        stats.attrs_won += 1;
                        let concurrent = res
                            .consumer
                            .as_ref()
                            .map(|c| c.version == meta.version && c.originating_id != meta.originating_id)
                            .unwrap_or(false);
                        if concurrent
                            && tracing::enabled!(Level::WARN)
                            && !is_benign_conflict(&meta.attr, &entry, Some(&local))
                        {
                            tracing::warn!(
                                dn = %local.dn,
                                attr = %meta.attr,
                                winner = %meta.originating_id,
                                "concurrent update conflict: partner value replaces local value"
                            );
                        }
                        let key = attr_key(&meta.attr);
                        let tracked = value_attrs.contains(&key) || !txn.get_value_meta(id, &meta.attr)?.is_empty();
                        if tracked {
                            let ops = value_delta(&meta.attr, local.get(&meta.attr), entry.get(&meta.attr));
                            stats.values_applied += ops.len() as u32;
                            req.ops.extend(ops);
                            adopted.insert(key, meta.clone());
                        } else {
                            req.ops.push(match entry.get(&meta.attr) {
                                Some(vals) => ModOp::Replace {
                                    attr: meta.attr.clone(),
                                    values: vals.to_vec(),
                                },
                                None => ModOp::Delete {
                                    attr: meta.attr.clone(),
                                },
                            });
                        }
                    }
                    Winner::Consumer if !marker => {
                        stats.attrs_lost += 1;
                        if res.conflict
                            && tracing::enabled!(Level::WARN)
                            && !is_benign_conflict(&meta.attr, &entry, Some(&local))
                        {
                            tracing::warn!(
                                dn = %local.dn,
                                attr = %meta.attr,
                                supplier = %meta,
                                "concurrent update conflict: local value kept"
                            );
                        }
                    }
                    _ => {}
                }
                if let Some(record) = res.stored {
                    stamped.push(record);
                }
            }

            for value in values {
                if let Some(generation) = adopted.get(&attr_key(value.attr())) {
                    if value.meta.same_generation(generation) {
                        adopted_values.push(value.clone());
                    } else {
                        stats.values_rejected += 1;
                    }
                    continue;
                }
                if !resolver.resolve_value(value, id)? {
                    stats.values_rejected += 1;
                    continue;
                }
                // The local content already reflects the generation; only the record is missing.
                let known = txn
                    .get_value_meta(id, value.attr())?
                    .iter()
                    .any(|existing| same_value_fact(existing, value));
                if !known {
                    accepted_values.push(value.clone());
                }
            }
        }

        if stats.attrs_won == 0 && accepted_values.is_empty() {
            return Ok(ApplyOutcome::NoChange(stats));
        }

        req.ops.push(ModOp::Replace {
            attr: USN_CHANGED_ATTR.to_string(),
            values: usn_value(usn),
        });

        txn.modify_entry(&req)?;
        for record in &stamped {
            txn.put_attr_meta(id, record)?;
        }
        for generation in adopted.values() {
            txn.clear_value_meta(id, &generation.attr)?;
        }
        for value in adopted_values.iter().chain(&accepted_values) {
            txn.put_value_meta(id, &restamp_value(value, usn))?;
        }
        txn.commit()?;
        tracing::debug!(dn = %local.dn, usn, won = stats.attrs_won, "replicated modify applied");
        Ok(ApplyOutcome::Applied(stats))
    }

    /// Author a local add. Every attribute starts at version 1, originated here.
    /// Returns the USN assigned to the change.
    pub fn originate_add(&self, backend: &dyn Backend, mut entry: Entry) -> Result<u64> {
        let mut txn = TxnGuard::begin(backend)?;
        let usn = txn.next_usn()?;
        if entry.guid().is_none() {
            entry.set(
                OBJECT_GUID_ATTR,
                vec![uuid::Uuid::new_v4().to_string().into_bytes()],
            );
        }
        entry.set(USN_CREATED_ATTR, usn_value(usn));
        entry.set(USN_CHANGED_ATTR, usn_value(usn));
        let now = now_secs();
        let metas: Vec<AttributeMetadata> = entry
            .attrs()
            .map(|(name, _)| {
                AttributeMetadata::new(name, usn, 1, self.config.local_id.clone(), now, usn)
            })
            .collect();
        let id = txn.add_entry(entry)?;
        for meta in &metas {
            txn.put_attr_meta(id, meta)?;
        }
        txn.commit()?;
        Ok(usn)
    }

    /// Author a local modify, bumping the version of every touched attribute.
    /// Value operations also record value metadata against the new generation.
    pub fn originate_modify(&self, backend: &dyn Backend, dn: &str, ops: Vec<ModOp>) -> Result<u64> {
        let mut txn = TxnGuard::begin(backend)?;
        let id = txn
            .entry_id_for_dn(dn)?
            .ok_or_else(|| ReplError::NoSuchObject { dn: dn.to_string() })?;
        let local = txn
            .fetch_entry(id)?
            .ok_or_else(|| ReplError::NoSuchObject { dn: dn.to_string() })?;
        let usn = txn.next_usn()?;
        let now = now_secs();

        let mut generations: BTreeMap<String, AttributeMetadata> = BTreeMap::new();
        let touched = ops
            .iter()
            .map(ModOp::attr)
            .chain(std::iter::once(USN_CHANGED_ATTR));
        for attr in touched {
            let key = attr_key(attr);
            if generations.contains_key(&key) {
                continue;
            }
            let version = txn
                .get_attr_meta(id, attr)?
                .map(|current| current.version + 1)
                .unwrap_or(1);
            generations.insert(
                key,
                AttributeMetadata::new(attr, usn, version, self.config.local_id.clone(), now, usn),
            );
        }

        let replaced: Vec<String> = ops
            .iter()
            .filter(|op| matches!(op, ModOp::Replace { .. } | ModOp::Delete { .. }))
            .map(|op| op.attr().to_string())
            .collect();
        let mut value_records = Vec::new();
        for op in &ops {
            let (value, value_op) = match op {
                ModOp::AddValue { value, .. } => (value, ValueOp::Add),
                ModOp::DeleteValue { value, .. } => (value, ValueOp::Delete),
                _ => continue,
            };
            if let Some(generation) = generations.get(&attr_key(op.attr())) {
                value_records.push(ValueMetadata::new(generation.clone(), value_op, value.clone()));
            }
        }

        let mut req = ModifyRequest::new(local.dn);
        req.ops = ops;
        req.ops.push(ModOp::Replace {
            attr: USN_CHANGED_ATTR.to_string(),
            values: usn_value(usn),
        });
        txn.modify_entry(&req)?;
        for meta in generations.values() {
            txn.put_attr_meta(id, meta)?;
        }
        // A whole-attribute write supersedes the per-value history.
        for attr in &replaced {
            txn.clear_value_meta(id, attr)?;
        }
        for value in &value_records {
            txn.put_value_meta(id, value)?;
        }
        txn.commit()?;
        Ok(usn)
    }

    /// Author a local delete by setting the tombstone flag.
    pub fn originate_delete(&self, backend: &dyn Backend, dn: &str) -> Result<u64> {
        self.originate_modify(
            backend,
            dn,
            vec![ModOp::Replace {
                attr: IS_DELETED_ATTR.to_string(),
                values: vec![b"TRUE".to_vec()],
            }],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    const BASE: &str = "dc=example";

    fn mutator(id: &str) -> EntryMutator {
        EntryMutator::new(MutatorConfig {
            local_id: InvocationId::new(id),
            ..MutatorConfig::default()
        })
    }

    fn meta(attr: &str, version: u32, origin: &str) -> AttributeMetadata {
        AttributeMetadata::new(attr, 7, version, InvocationId::new(origin), 1_000, 7)
    }

    /// Entry as a partner would send it.
    fn incoming(dn: &str, guid: &str, attrs: &[(&str, &[&str], u32, &str)]) -> Entry {
        let mut entry = Entry::new(dn).with_attr(OBJECT_GUID_ATTR, &[guid]);
        let mut metas = vec![meta(OBJECT_GUID_ATTR, 1, "partner")];
        for (name, values, version, origin) in attrs {
            if !values.is_empty() {
                entry = entry.with_attr(name, values);
            }
            metas.push(meta(name, *version, origin));
        }
        embed_metadata(&mut entry, &metas, &[]);
        entry
    }

    fn seeded(local: &EntryMutator) -> MemoryBackend {
        let backend = MemoryBackend::new(BASE);
        let change = IncomingChange::new(
            ChangeState::Add,
            incoming(
                "cn=alice,dc=example",
                "guid-alice",
                &[("description", &["v1"], 1, "partner"), ("mail", &["a@x"], 1, "partner")],
            ),
        );
        local.apply(&backend, &change).unwrap();
        backend
    }

    mod add {
        use super::*;

        #[test]
        fn test_add_stamps_usn_markers_and_metadata() {
            let local = mutator("local");
            let backend = seeded(&local);
            let entry = backend.entry("cn=alice,dc=example").unwrap().unwrap();
            let usn = entry.first_str(USN_CHANGED_ATTR).unwrap();
            assert_eq!(entry.first_str(USN_CREATED_ATTR).unwrap(), usn);
            assert!(!entry.has(META_ATTR));

            let stored = backend.attr_meta("cn=alice,dc=example", "description").unwrap().unwrap();
            assert_eq!(stored.local_usn.to_string(), usn);
            assert_eq!(stored.version, 1);
            assert_eq!(stored.originating_id, InvocationId::new("partner"));
            assert_eq!(stored.originating_usn, 7);
        }

        #[test]
        fn test_add_without_parent_fails_recoverably() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            let change = IncomingChange::new(
                ChangeState::Add,
                incoming("cn=bob,ou=people,dc=example", "guid-bob", &[("sn", &["b"], 1, "p")]),
            );
            let err = local.apply(&backend, &change).unwrap_err();
            assert!(err.is_transient());
        }

        #[test]
        fn test_add_clashing_dn_is_unresolved_conflict() {
            let local = mutator("local");
            let backend = seeded(&local);
            let change = IncomingChange::new(
                ChangeState::Add,
                incoming("cn=alice,dc=example", "guid-other", &[("sn", &["x"], 1, "p")]),
            );
            let err = local.apply(&backend, &change).unwrap_err();
            assert!(matches!(err, ReplError::EntryAlreadyExists { .. }));
            assert!(err.is_unresolved_conflict());
        }

        #[test]
        fn test_singleton_adopts_partner_identity() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            local
                .originate_add(
                    &backend,
                    Entry::new("cn=Administrator,dc=example").with_attr(OBJECT_GUID_ATTR, &["local-admin"]),
                )
                .unwrap();
            let change = IncomingChange::new(
                ChangeState::Add,
                incoming("cn=Administrator,dc=example", "shared-admin", &[("description", &["root"], 4, "p")]),
            );
            let outcome = local.apply(&backend, &change).unwrap();
            assert!(matches!(outcome, ApplyOutcome::Applied(_)));
            let entry = backend.entry("cn=administrator,dc=example").unwrap().unwrap();
            assert_eq!(entry.guid().as_deref(), Some("shared-admin"));
            assert_eq!(entry.first_str("description").as_deref(), Some("root"));
        }

        #[test]
        fn test_missing_metadata_rejected() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            let change = IncomingChange::new(ChangeState::Add, Entry::new("cn=x,dc=example"));
            let err = local.apply(&backend, &change).unwrap_err();
            assert!(matches!(err, ReplError::MissingMetadata { .. }));
        }

        #[test]
        fn test_malformed_metadata_is_fatal() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            let entry = Entry::new("cn=x,dc=example").with_attr(META_ATTR, &["garbage"]);
            let err = local
                .apply(&backend, &IncomingChange::new(ChangeState::Add, entry))
                .unwrap_err();
            assert!(matches!(err, ReplError::MalformedMetadata { .. }));
        }
    }

    mod modify {
        use super::*;

        #[test]
        fn test_higher_version_overwrites() {
            let local = mutator("local");
            let backend = seeded(&local);
            let change = IncomingChange::new(
                ChangeState::Modify,
                incoming(
                    "cn=alice,dc=example",
                    "guid-alice",
                    &[("description", &["v2"], 2, "partner"), ("mail", &["a@x"], 1, "partner")],
                ),
            );
            let outcome = local.apply(&backend, &change).unwrap();
            let stats = outcome.stats();
            assert_eq!(stats.attrs_won, 1);
            assert_eq!(stats.conflicts, 1);
            let entry = backend.entry("cn=alice,dc=example").unwrap().unwrap();
            assert_eq!(entry.first_str("description").as_deref(), Some("v2"));
        }

        #[test]
        fn test_lower_version_is_no_change() {
            let local = mutator("local");
            let backend = seeded(&local);
            let before = backend.last_usn().unwrap();
            local
                .originate_modify(
                    &backend,
                    "cn=alice,dc=example",
                    vec![ModOp::Replace {
                        attr: "description".to_string(),
                        values: vec![b"mine".to_vec()],
                    }],
                )
                .unwrap();
            let change = IncomingChange::new(
                ChangeState::Modify,
                incoming("cn=alice,dc=example", "guid-alice", &[("description", &["old"], 1, "zzz")]),
            );
            let outcome = local.apply(&backend, &change).unwrap();
            assert!(matches!(outcome, ApplyOutcome::NoChange(_)));
            let entry = backend.entry("cn=alice,dc=example").unwrap().unwrap();
            assert_eq!(entry.first_str("description").as_deref(), Some("mine"));
            assert_eq!(backend.last_usn().unwrap(), before + 1);
        }

        #[test]
        fn test_replay_is_idempotent() {
            let local = mutator("local");
            let backend = seeded(&local);
            let change = IncomingChange::new(
                ChangeState::Modify,
                incoming("cn=alice,dc=example", "guid-alice", &[("description", &["v3"], 3, "partner")]),
            );
            local.apply(&backend, &change).unwrap();
            let after_first = backend.entry("cn=alice,dc=example").unwrap();
            let outcome = local.apply(&backend, &change).unwrap();
            assert!(matches!(outcome, ApplyOutcome::NoChange(_)));
            assert_eq!(backend.entry("cn=alice,dc=example").unwrap(), after_first);
        }

        #[test]
        fn test_attribute_in_metadata_but_not_content_is_removed() {
            let local = mutator("local");
            let backend = seeded(&local);
            let change = IncomingChange::new(
                ChangeState::Modify,
                incoming("cn=alice,dc=example", "guid-alice", &[("mail", &[], 2, "partner")]),
            );
            local.apply(&backend, &change).unwrap();
            let entry = backend.entry("cn=alice,dc=example").unwrap().unwrap();
            assert!(!entry.has("mail"));
            assert!(entry.has("description"));
        }

        #[test]
        fn test_renamed_entry_resolved_by_guid() {
            let local = mutator("local");
            let backend = seeded(&local);
            let change = IncomingChange::new(
                ChangeState::Modify,
                incoming("cn=alice-renamed,dc=example", "guid-alice", &[("description", &["v9"], 9, "p")]),
            );
            local.apply(&backend, &change).unwrap();
            let entry = backend.entry("cn=alice,dc=example").unwrap().unwrap();
            assert_eq!(entry.first_str("description").as_deref(), Some("v9"));
            assert!(backend.entry("cn=alice-renamed,dc=example").unwrap().is_none());
        }

        #[test]
        fn test_modify_of_unknown_entry_creates_it() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            let change = IncomingChange::new(
                ChangeState::Modify,
                incoming("cn=carol,dc=example", "guid-carol", &[("sn", &["c"], 2, "p")]),
            );
            local.apply(&backend, &change).unwrap();
            assert!(backend.entry("cn=carol,dc=example").unwrap().is_some());
        }

        #[test]
        fn test_losing_usn_changed_still_advances_marker() {
            let local = mutator("local");
            let backend = seeded(&local);
            local
                .originate_modify(
                    &backend,
                    "cn=alice,dc=example",
                    vec![ModOp::Replace {
                        attr: "mail".to_string(),
                        values: vec![b"local@x".to_vec()],
                    }],
                )
                .unwrap();
            let local_usn_meta = backend
                .attr_meta("cn=alice,dc=example", USN_CHANGED_ATTR)
                .unwrap()
                .unwrap();

            let mut entry = Entry::new("cn=alice,dc=example")
                .with_attr(OBJECT_GUID_ATTR, &["guid-alice"])
                .with_attr("description", &["from-partner"]);
            embed_metadata(
                &mut entry,
                &[meta(USN_CHANGED_ATTR, 0, "a-low"), meta("description", 5, "partner")],
                &[],
            );
            local
                .apply(&backend, &IncomingChange::new(ChangeState::Modify, entry))
                .unwrap();

            let stored = backend
                .attr_meta("cn=alice,dc=example", USN_CHANGED_ATTR)
                .unwrap()
                .unwrap();
            assert!(stored.same_generation(&local_usn_meta));
            assert!(stored.local_usn > local_usn_meta.local_usn);
            let entry = backend.entry("cn=alice,dc=example").unwrap().unwrap();
            assert_eq!(entry.first_str(USN_CHANGED_ATTR).unwrap(), stored.local_usn.to_string());
        }
    }

    mod delete {
        use super::*;

        #[test]
        fn test_delete_sets_tombstone() {
            let local = mutator("local");
            let backend = seeded(&local);
            let change = IncomingChange::new(
                ChangeState::Delete,
                incoming("cn=alice,dc=example", "guid-alice", &[(IS_DELETED_ATTR, &["TRUE"], 1, "p")]),
            );
            local.apply(&backend, &change).unwrap();
            assert!(backend.entry("cn=alice,dc=example").unwrap().unwrap().is_deleted());
        }

        #[test]
        fn test_delete_of_unknown_entry_is_ignored() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            let change = IncomingChange::new(
                ChangeState::Delete,
                incoming("cn=ghost,dc=example", "guid-ghost", &[(IS_DELETED_ATTR, &["TRUE"], 1, "p")]),
            );
            assert_eq!(local.apply(&backend, &change).unwrap(), ApplyOutcome::NotPresent);
        }
    }

    mod values {
        use super::*;

        const GROUP: &str = "cn=admins,dc=example";

        fn group_backend(local: &EntryMutator) -> MemoryBackend {
            let backend = MemoryBackend::new(BASE);
            local
                .originate_add(
                    &backend,
                    Entry::new(GROUP)
                        .with_attr(OBJECT_GUID_ATTR, &["guid-admins"])
                        .with_attr("member", &["cn=a"]),
                )
                .unwrap();
            backend
        }

        fn add_member(local: &EntryMutator, backend: &MemoryBackend, value: &str) {
            local
                .originate_modify(
                    backend,
                    GROUP,
                    vec![ModOp::AddValue {
                        attr: "member".to_string(),
                        value: value.as_bytes().to_vec(),
                    }],
                )
                .unwrap();
        }

        /// A partner's group entry whose `member` content is `members`, carrying
        /// one value record authored at the given generation.
        fn value_change(
            version: u32,
            origin: &str,
            time: u64,
            op: ValueOp,
            value: &str,
            members: &[&str],
        ) -> IncomingChange {
            let mut member = meta("member", version, origin);
            member.originating_time = time;
            let mut entry = Entry::new(GROUP).with_attr(OBJECT_GUID_ATTR, &["guid-admins"]);
            if !members.is_empty() {
                entry = entry.with_attr("member", members);
            }
            let record = ValueMetadata::new(member.clone(), op, value.as_bytes().to_vec());
            embed_metadata(&mut entry, &[member], &[record]);
            IncomingChange::new(ChangeState::Modify, entry)
        }

        fn members(backend: &MemoryBackend) -> Vec<String> {
            let mut values: Vec<String> = backend
                .entry(GROUP)
                .unwrap()
                .unwrap()
                .get("member")
                .unwrap_or_default()
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect();
            values.sort();
            values
        }

        #[test]
        fn test_value_add_merges_into_attribute() {
            let local = mutator("local");
            let backend = group_backend(&local);
            let change = value_change(2, "partner", 5_000, ValueOp::Add, "cn=b", &["cn=a", "cn=b"]);
            let outcome = local.apply(&backend, &change).unwrap();
            assert_eq!(outcome.stats().values_applied, 1);
            assert_eq!(members(&backend), vec!["cn=a", "cn=b"]);
        }

        #[test]
        fn test_stale_generation_value_is_discarded() {
            let local = mutator("local");
            let backend = group_backend(&local);
            add_member(&local, &backend, "cn=c");
            let outcome = local
                .apply(&backend, &value_change(1, "aaa", 5_000, ValueOp::Delete, "cn=a", &[]))
                .unwrap();
            assert!(matches!(outcome, ApplyOutcome::NoChange(_)));
            assert_eq!(outcome.stats().values_rejected, 1);
            assert_eq!(members(&backend), vec!["cn=a", "cn=c"]);
        }

        #[test]
        fn test_value_replay_is_idempotent() {
            let local = mutator("local");
            let backend = group_backend(&local);
            let change = value_change(2, "partner", 5_000, ValueOp::Delete, "cn=a", &[]);
            local.apply(&backend, &change).unwrap();
            let after_first = backend.entry(GROUP).unwrap();
            assert!(!after_first.as_ref().unwrap().has("member"));
            let outcome = local.apply(&backend, &change).unwrap();
            assert!(matches!(outcome, ApplyOutcome::NoChange(_)));
            assert_eq!(backend.entry(GROUP).unwrap(), after_first);
        }

        #[test]
        fn test_winning_generation_replaces_local_values() {
            let local = mutator("1111");
            let backend = group_backend(&local);
            add_member(&local, &backend, "cn=x");

            let change = value_change(2, "2222", 5_000, ValueOp::Add, "cn=y", &["cn=a", "cn=y"]);
            let outcome = local.apply(&backend, &change).unwrap();
            assert!(matches!(outcome, ApplyOutcome::Applied(_)));
            assert_eq!(outcome.stats().values_applied, 2);
            assert_eq!(members(&backend), vec!["cn=a", "cn=y"]);

            let records = backend.value_meta(GROUP, "member").unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].value, b"cn=y".to_vec());
            assert_eq!(records[0].meta.originating_id, InvocationId::new("2222"));
        }

        #[test]
        fn test_losing_generation_values_are_rejected() {
            let local = mutator("2222");
            let backend = group_backend(&local);
            add_member(&local, &backend, "cn=y");

            let change = value_change(2, "1111", 5_000, ValueOp::Add, "cn=x", &["cn=a", "cn=x"]);
            let outcome = local.apply(&backend, &change).unwrap();
            assert!(matches!(outcome, ApplyOutcome::NoChange(_)));
            assert_eq!(outcome.stats().values_rejected, 1);
            assert_eq!(members(&backend), vec!["cn=a", "cn=y"]);
        }

        #[test]
        fn test_whole_attribute_write_supersedes_value_records() {
            let local = mutator("1111");
            let backend = group_backend(&local);
            add_member(&local, &backend, "cn=x");
            assert_eq!(backend.value_meta(GROUP, "member").unwrap().len(), 1);

            local
                .originate_modify(
                    &backend,
                    GROUP,
                    vec![ModOp::Replace {
                        attr: "member".to_string(),
                        values: vec![b"cn=z".to_vec()],
                    }],
                )
                .unwrap();
            assert!(backend.value_meta(GROUP, "member").unwrap().is_empty());
            assert_eq!(members(&backend), vec!["cn=z"]);
        }

        #[test]
        fn test_partner_replace_drops_local_value_history() {
            let local = mutator("2222");
            let backend = group_backend(&local);
            add_member(&local, &backend, "cn=x");

            let mut entry = Entry::new(GROUP)
                .with_attr(OBJECT_GUID_ATTR, &["guid-admins"])
                .with_attr("member", &["cn=z"]);
            embed_metadata(&mut entry, &[meta("member", 3, "1111")], &[]);
            let outcome = local
                .apply(&backend, &IncomingChange::new(ChangeState::Modify, entry))
                .unwrap();
            assert_eq!(outcome.stats().attrs_won, 1);
            assert_eq!(members(&backend), vec!["cn=z"]);
            assert!(backend.value_meta(GROUP, "member").unwrap().is_empty());
        }
    }

    mod conflict_logging {
        use super::*;
        use std::io;
        use std::sync::{Arc, Mutex};

        #[derive(Clone, Default)]
        struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

        impl io::Write for CaptureWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        /// Apply a version-5 description from 2222 over a local version-5
        /// description from 1111 and count the conflict warnings emitted.
        fn conflict_warnings(local_value: &str, partner_value: &str) -> usize {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            let seed = IncomingChange::new(
                ChangeState::Add,
                incoming("cn=carol,dc=example", "guid-carol", &[("description", &[local_value], 5, "1111")]),
            );
            local.apply(&backend, &seed).unwrap();

            let change = IncomingChange::new(
                ChangeState::Modify,
                incoming("cn=carol,dc=example", "guid-carol", &[("description", &[partner_value], 5, "2222")]),
            );
            let capture = CaptureWriter::default();
            let writer = capture.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .with_max_level(Level::WARN)
                .finish();
            tracing::subscriber::with_default(subscriber, || {
                local.apply(&backend, &change).unwrap();
            });

            let logged = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
            logged
                .lines()
                .filter(|line| line.contains("WARN") && line.contains("concurrent update conflict"))
                .count()
        }

        #[test]
        fn test_differing_concurrent_values_warn_once() {
            assert_eq!(conflict_warnings("a", "b"), 1);
        }

        #[test]
        fn test_identical_concurrent_values_are_silent() {
            assert_eq!(conflict_warnings("a", "a"), 0);
        }
    }

    mod deadlock {
        use super::*;

        #[test]
        fn test_deadlock_retried_until_success() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            backend.inject_deadlocks(2);
            let change = IncomingChange::new(
                ChangeState::Add,
                incoming("cn=dan,dc=example", "guid-dan", &[("sn", &["d"], 1, "p")]),
            );
            local.apply(&backend, &change).unwrap();
            assert!(backend.entry("cn=dan,dc=example").unwrap().is_some());
        }

        #[test]
        fn test_deadlock_ceiling_is_fatal() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            backend.inject_deadlocks(10);
            let change = IncomingChange::new(
                ChangeState::Add,
                incoming("cn=dan,dc=example", "guid-dan", &[("sn", &["d"], 1, "p")]),
            );
            let err = local.apply(&backend, &change).unwrap_err();
            assert!(matches!(err, ReplError::DeadlockRetriesExhausted { attempts: 3 }));
        }
    }

    mod origination {
        use super::*;

        #[test]
        fn test_originate_modify_bumps_version() {
            let local = mutator("local");
            let backend = seeded(&local);
            let usn = local
                .originate_modify(
                    &backend,
                    "cn=alice,dc=example",
                    vec![ModOp::Replace {
                        attr: "description".to_string(),
                        values: vec![b"x".to_vec()],
                    }],
                )
                .unwrap();
            let stored = backend.attr_meta("cn=alice,dc=example", "description").unwrap().unwrap();
            assert_eq!(stored.version, 2);
            assert_eq!(stored.originating_id, InvocationId::new("local"));
            assert_eq!(stored.originating_usn, usn);
            assert_eq!(stored.local_usn, usn);
        }

        #[test]
        fn test_originate_add_generates_guid() {
            let local = mutator("local");
            let backend = MemoryBackend::new(BASE);
            local
                .originate_add(&backend, Entry::new("cn=x,dc=example").with_attr("sn", &["x"]))
                .unwrap();
            let entry = backend.entry("cn=x,dc=example").unwrap().unwrap();
            assert!(entry.guid().is_some());
            assert!(backend.attr_meta("cn=x,dc=example", OBJECT_GUID_ATTR).unwrap().is_some());
        }

        #[test]
        fn test_originate_delete_marks_tombstone() {
            let local = mutator("local");
            let backend = seeded(&local);
            local.originate_delete(&backend, "cn=alice,dc=example").unwrap();
            assert!(backend.entry("cn=alice,dc=example").unwrap().unwrap().is_deleted());
        }
    }
}
