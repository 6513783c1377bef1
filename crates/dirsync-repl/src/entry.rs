//! Directory entry model and modify requests exchanged with the backend.

use crate::metadata::{IS_DELETED_ATTR, OBJECT_GUID_ATTR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Backend-local entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

/// Normalized lookup key for an attribute name (names are case-insensitive).
pub fn attr_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Normalized lookup key for a DN.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parent DN, or None for a single-RDN name.
pub fn parent_dn(dn: &str) -> Option<&str> {
    dn.split_once(',').map(|(_, parent)| parent.trim_start())
}

/// First RDN of a DN.
pub fn rdn(dn: &str) -> &str {
    dn.split_once(',').map_or(dn, |(first, _)| first)
}

/// A directory entry: DN plus multi-valued attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// Distinguished name as last written.
    pub dn: String,
    attrs: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    /// Create an entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter taking string values.
    pub fn with_attr(mut self, name: &str, values: &[&str]) -> Self {
        self.set(name, values.iter().map(|v| v.as_bytes().to_vec()).collect());
        self
    }

    /// Replace all values of an attribute. An empty list removes it.
    pub fn set(&mut self, name: &str, values: Vec<Vec<u8>>) {
        if values.is_empty() {
            self.attrs.remove(&attr_key(name));
        } else {
            self.attrs.insert(attr_key(name), values);
        }
    }

    /// Values of an attribute.
    pub fn get(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attrs.get(&attr_key(name)).map(Vec::as_slice)
    }

    /// First value of an attribute decoded as UTF-8.
    pub fn first_str(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|values| values.first())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Whether the attribute is present.
    pub fn has(&self, name: &str) -> bool {
        self.attrs.contains_key(&attr_key(name))
    }

    /// Detach an attribute, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<Vec<u8>>> {
        self.attrs.remove(&attr_key(name))
    }

    /// Add one value if not already present.
    pub fn add_value(&mut self, name: &str, value: &[u8]) {
        let values = self.attrs.entry(attr_key(name)).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_vec());
        }
    }

    /// Remove one value; drops the attribute when its last value goes.
    pub fn remove_value(&mut self, name: &str, value: &[u8]) {
        let key = attr_key(name);
        if let Some(values) = self.attrs.get_mut(&key) {
            values.retain(|v| v != value);
            if values.is_empty() {
                self.attrs.remove(&key);
            }
        }
    }

    /// Iterate attribute names (normalized) and values.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &[Vec<u8>])> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Object identity, if the entry carries one.
    pub fn guid(&self) -> Option<String> {
        self.first_str(OBJECT_GUID_ATTR)
    }

    /// Whether the entry is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.first_str(IS_DELETED_ATTR)
            .map(|v| v.eq_ignore_ascii_case("TRUE"))
            .unwrap_or(false)
    }

    /// Apply one modification in place.
    pub fn apply(&mut self, op: &ModOp) {
        match op {
            ModOp::Replace { attr, values } => self.set(attr, values.clone()),
            ModOp::Delete { attr } => {
                self.remove(attr);
            }
            ModOp::AddValue { attr, value } => self.add_value(attr, value),
            ModOp::DeleteValue { attr, value } => self.remove_value(attr, value),
        }
    }
}

/// Kind of change carried by a sync page item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeState {
    /// Entry was created.
    Add,
    /// Entry was modified.
    Modify,
    /// Entry was deleted (tombstoned).
    Delete,
}

/// One modification inside a modify request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModOp {
    /// Replace every value of the attribute.
    Replace {
        /// Attribute name.
        attr: String,
        /// New values.
        values: Vec<Vec<u8>>,
    },
    /// Remove the attribute entirely.
    Delete {
        /// Attribute name.
        attr: String,
    },
    /// Add a single value.
    AddValue {
        /// Attribute name.
        attr: String,
        /// Value to add.
        value: Vec<u8>,
    },
    /// Remove a single value.
    DeleteValue {
        /// Attribute name.
        attr: String,
        /// Value to remove.
        value: Vec<u8>,
    },
}

impl ModOp {
    /// Attribute the operation touches.
    pub fn attr(&self) -> &str {
        match self {
            ModOp::Replace { attr, .. }
            | ModOp::Delete { attr }
            | ModOp::AddValue { attr, .. }
            | ModOp::DeleteValue { attr, .. } => attr,
        }
    }
}

/// Modify request handed to the directory write interface.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModifyRequest {
    /// Local DN of the target entry.
    pub dn: String,
    /// Modifications in application order.
    pub ops: Vec<ModOp>,
}

impl ModifyRequest {
    /// Create an empty request for a DN.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ops: Vec::new(),
        }
    }

    /// Whether any modification was queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
