//! Conflict resolution for multi-master directory replication.
//!
//! Implements last-writer-wins arbitration over attribute metadata: the higher
//! `version` wins, and equal versions fall back to the lexicographically larger
//! originating invocation id. Value-level changes of multi-valued attributes
//! are only in scope when they were authored against the attribute generation
//! that won.

use crate::backend::WriteTxn;
use crate::entry::{attr_key, Entry, EntryId};
use crate::error::Result;
use crate::metadata::{is_usn_marker, AttributeMetadata, ValueMetadata, USN_CHANGED_ATTR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Side whose metadata prevails for one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    /// The incoming (partner) record wins.
    Supplier,
    /// The locally stored record wins.
    Consumer,
}

/// Compare an incoming record against the locally stored one.
///
/// A missing consumer record means the supplier wins. Records describing the
/// same generation resolve to the consumer, so replaying a change is a no-op.
pub fn resolve_attribute(supplier: &AttributeMetadata, consumer: Option<&AttributeMetadata>) -> Winner {
    let Some(consumer) = consumer else {
        return Winner::Supplier;
    };
    match supplier.version.cmp(&consumer.version) {
        std::cmp::Ordering::Greater => Winner::Supplier,
        std::cmp::Ordering::Less => Winner::Consumer,
        std::cmp::Ordering::Equal => {
            if supplier.originating_id > consumer.originating_id {
                Winner::Supplier
            } else {
                Winner::Consumer
            }
        }
    }
}

/// Outcome of resolving one attribute against the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeResolution {
    /// Which side won.
    pub winner: Winner,
    /// Metadata the consumer held before resolution.
    pub consumer: Option<AttributeMetadata>,
    /// Metadata to persist, already stamped with the new local USN.
    /// `None` means the stored record stays untouched.
    pub stored: Option<AttributeMetadata>,
    /// Both sides held different generations of the attribute.
    pub conflict: bool,
}

/// Per-entry resolver bound to one read view of the backend.
///
/// Remembers the winning generation of every attribute it resolved so the
/// value-level check can compare against it.
pub struct ConflictResolver<'t> {
    txn: &'t dyn WriteTxn,
    winning: HashMap<(EntryId, String), AttributeMetadata>,
}

impl<'t> ConflictResolver<'t> {
    /// Create a resolver reading through `txn`.
    pub fn new(txn: &'t dyn WriteTxn) -> Self {
        Self {
            txn,
            winning: HashMap::new(),
        }
    }

    /// Resolve one incoming attribute record for an entry.
    ///
    /// `new_usn` is the local sequence number allocated for the replication
    /// unit. When the supplier loses on the change-sequence marker, the
    /// consumer's own content is kept but re-stamped so local ordering still
    /// advances.
    pub fn resolve_attribute(
        &mut self,
        id: EntryId,
        supplier: &AttributeMetadata,
        new_usn: u64,
    ) -> Result<AttributeResolution> {
        let consumer = self.txn.get_attr_meta(id, &supplier.attr)?;
        let winner = resolve_attribute(supplier, consumer.as_ref());
        let conflict = consumer
            .as_ref()
            .map(|c| !c.same_generation(supplier))
            .unwrap_or(false);

        let stored = match (winner, consumer.as_ref()) {
            (Winner::Supplier, _) => Some(supplier.restamped(new_usn)),
            (Winner::Consumer, Some(c)) if supplier.attr.eq_ignore_ascii_case(USN_CHANGED_ATTR) => {
                Some(c.restamped(new_usn))
            }
            (Winner::Consumer, _) => None,
        };

        let winning = match winner {
            Winner::Supplier => supplier.clone(),
            Winner::Consumer => consumer.clone().unwrap_or_else(|| supplier.clone()),
        };
        self.winning.insert((id, attr_key(&supplier.attr)), winning);

        Ok(AttributeResolution {
            winner,
            consumer,
            stored,
            conflict,
        })
    }

    /// Whether an incoming value change is still in scope for the entry.
    ///
    /// The value must have been authored against the winning attribute
    /// generation, and no stored record for the same value may carry a later
    /// originating time.
    pub fn resolve_value(&self, supplier: &ValueMetadata, id: EntryId) -> Result<bool> {
        let key = (id, attr_key(supplier.attr()));
        let winning = match self.winning.get(&key) {
            Some(meta) => Some(meta.clone()),
            None => self.txn.get_attr_meta(id, supplier.attr())?,
        };
        let Some(winning) = winning else {
            return Ok(false);
        };
        if !winning.same_generation(&supplier.meta) {
            return Ok(false);
        }

        let existing = self.txn.get_value_meta(id, supplier.attr())?;
        let newer_known = existing.iter().any(|record| {
            record.value == supplier.value
                && record.meta.originating_time > supplier.meta.originating_time
        });
        Ok(!newer_known)
    }
}

/// Whether losing this attribute changes nothing observable.
///
/// True for the local sequence markers and when both sides hold the same
/// values (in any order). Only used to keep conflict warnings quiet.
pub fn is_benign_conflict(attr: &str, supplier: &Entry, consumer: Option<&Entry>) -> bool {
    if is_usn_marker(attr) {
        return true;
    }
    let Some(consumer) = consumer else {
        return false;
    };
    let sorted = |entry: &Entry| {
        let mut values = entry.get(attr).map(<[Vec<u8>]>::to_vec).unwrap_or_default();
        values.sort();
        values
    };
    sorted(supplier) == sorted(consumer)
}
