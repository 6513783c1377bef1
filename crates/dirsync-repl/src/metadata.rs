//! Per-attribute and per-value replication metadata.
//!
//! Business logic only handles the typed structs below. The colon-separated
//! text form exists for the storage/wire edge, where metadata travels as
//! ordinary attribute values of the replicated entry:
//!
//! ```text
//! attr:localUsn:version:originatingId:originatingTime:originatingUsn
//! attr:localUsn:version:originatingId:originatingTime:originatingUsn:add|del:<base64 value>
//! ```

use crate::error::{ReplError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Attribute carrying the encoded attribute-level metadata set of an entry.
pub const META_ATTR: &str = "replPropertyMetaData";
/// Attribute carrying the encoded value-level metadata of an entry.
pub const VALUE_META_ATTR: &str = "replValueMetaData";
/// Local "last changed" sequence marker.
pub const USN_CHANGED_ATTR: &str = "uSNChanged";
/// Local "created" sequence marker.
pub const USN_CREATED_ATTR: &str = "uSNCreated";
/// Stable object identity, independent of the DN.
pub const OBJECT_GUID_ATTR: &str = "objectGUID";
/// Tombstone flag set by a replicated delete.
pub const IS_DELETED_ATTR: &str = "isDeleted";

/// Returns true for the locally assigned sequence marker attributes.
pub fn is_usn_marker(attr: &str) -> bool {
    attr.eq_ignore_ascii_case(USN_CHANGED_ATTR) || attr.eq_ignore_ascii_case(USN_CREATED_ATTR)
}

/// Returns true for control-plane attributes that never replicate as content.
pub fn is_control_attr(attr: &str) -> bool {
    attr.eq_ignore_ascii_case(META_ATTR) || attr.eq_ignore_ascii_case(VALUE_META_ATTR)
}

/// Stable unique identifier of a replica (a.k.a. invocation id).
///
/// Ordering is the lexicographic order of the string form, which is the
/// tie-break used by conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvocationId(String);

impl InvocationId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change descriptor attached to every replicated attribute of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    /// Attribute name.
    pub attr: String,
    /// Sequence number assigned by the replica that last accepted the value.
    pub local_usn: u64,
    /// Revision counter, bumped by the replica whose write wins.
    pub version: u32,
    /// Replica that introduced the currently winning value.
    pub originating_id: InvocationId,
    /// Wall-clock time of the originating change (seconds since epoch).
    pub originating_time: u64,
    /// Sequence number assigned by the originating replica.
    pub originating_usn: u64,
}

impl AttributeMetadata {
    /// Create a metadata record.
    pub fn new(
        attr: impl Into<String>,
        local_usn: u64,
        version: u32,
        originating_id: InvocationId,
        originating_time: u64,
        originating_usn: u64,
    ) -> Self {
        Self {
            attr: attr.into(),
            local_usn,
            version,
            originating_id,
            originating_time,
            originating_usn,
        }
    }

    /// True when both records describe the same attribute generation.
    pub fn same_generation(&self, other: &AttributeMetadata) -> bool {
        self.version == other.version && self.originating_id == other.originating_id
    }

    /// Copy with only the locally assigned sequence number replaced.
    pub fn restamped(&self, local_usn: u64) -> Self {
        Self {
            local_usn,
            ..self.clone()
        }
    }
}

impl fmt::Display for AttributeMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.attr,
            self.local_usn,
            self.version,
            self.originating_id,
            self.originating_time,
            self.originating_usn
        )
    }
}

fn malformed(record: &str, what: &str) -> ReplError {
    ReplError::MalformedMetadata {
        msg: format!("{}: {:?}", what, record),
    }
}

fn parse_num<T: FromStr>(field: &str, record: &str, what: &str) -> Result<T> {
    field.parse().map_err(|_| malformed(record, what))
}

fn parse_fields(record: &str, parts: &[&str]) -> Result<AttributeMetadata> {
    if parts[0].is_empty() {
        return Err(malformed(record, "empty attribute name"));
    }
    if parts[3].is_empty() {
        return Err(malformed(record, "empty originating id"));
    }
    Ok(AttributeMetadata {
        attr: parts[0].to_string(),
        local_usn: parse_num(parts[1], record, "bad local usn")?,
        version: parse_num(parts[2], record, "bad version")?,
        originating_id: InvocationId::new(parts[3]),
        originating_time: parse_num(parts[4], record, "bad originating time")?,
        originating_usn: parse_num(parts[5], record, "bad originating usn")?,
    })
}

impl FromStr for AttributeMetadata {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(malformed(s, "expected 6 fields"));
        }
        parse_fields(s, &parts)
    }
}

/// Add or delete of a single value of a multi-valued attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueOp {
    /// The value was added.
    Add,
    /// The value was removed.
    Delete,
}

impl ValueOp {
    fn as_str(self) -> &'static str {
        match self {
            ValueOp::Add => "add",
            ValueOp::Delete => "del",
        }
    }
}

/// Attribute metadata plus the value it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    /// Generation the value change was authored against.
    pub meta: AttributeMetadata,
    /// Whether the value was added or removed.
    pub op: ValueOp,
    /// Raw value payload.
    pub value: Vec<u8>,
}

impl ValueMetadata {
    /// Create a value metadata record.
    pub fn new(meta: AttributeMetadata, op: ValueOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            meta,
            op,
            value: value.into(),
        }
    }

    /// Attribute the value belongs to.
    pub fn attr(&self) -> &str {
        &self.meta.attr
    }
}

impl fmt::Display for ValueMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.meta,
            self.op.as_str(),
            BASE64.encode(&self.value)
        )
    }
}

impl FromStr for ValueMetadata {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 8 {
            return Err(malformed(s, "expected 8 fields"));
        }
        let meta = parse_fields(s, &parts[..6])?;
        let op = match parts[6] {
            "add" => ValueOp::Add,
            "del" => ValueOp::Delete,
            _ => return Err(malformed(s, "bad value op")),
        };
        let value = BASE64
            .decode(parts[7])
            .map_err(|_| malformed(s, "bad value encoding"))?;
        Ok(Self { meta, op, value })
    }
}
