//! Up-to-date vector: per-origin high-watermarks and the sync cookie.
//!
//! The vector maps an originating invocation id to the highest sequence number
//! from that origin known to this replica. Slots only ever move forward.

use crate::backend::{Backend, TxnGuard};
use crate::entry::{ModOp, ModifyRequest};
use crate::error::{ReplError, Result};
use crate::metadata::InvocationId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;

/// Directory attribute on the naming-context root holding the vector.
pub const UTDV_ATTR: &str = "replUpToDateVector";

/// Per-origin map of highest known sequence numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpToDateVector {
    slots: BTreeMap<InvocationId, u64>,
}

impl UpToDateVector {
    /// Create an empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the slot for `origin` to `usn` if strictly greater. Returns whether it moved.
    pub fn update(&mut self, origin: &InvocationId, usn: u64) -> bool {
        match self.slots.get_mut(origin) {
            Some(current) if *current >= usn => false,
            Some(current) => {
                *current = usn;
                true
            }
            None => {
                self.slots.insert(origin.clone(), usn);
                true
            }
        }
    }

    /// Highest known sequence number from `origin`.
    pub fn get(&self, origin: &InvocationId) -> Option<u64> {
        self.slots.get(origin).copied()
    }

    /// Whether a write `usn` authored by `origin` is past this vector.
    pub fn needs(&self, origin: &InvocationId, usn: u64) -> bool {
        self.get(origin).map_or(true, |known| usn > known)
    }

    /// Whether any of `writes` is past this vector. An empty set is always needed.
    pub fn needs_any(&self, writes: &[(InvocationId, u64)]) -> bool {
        writes.is_empty() || writes.iter().any(|(origin, usn)| self.needs(origin, *usn))
    }

    /// Number of origins tracked.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no origin is tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate slots in origin order.
    pub fn iter(&self) -> impl Iterator<Item = (&InvocationId, u64)> {
        self.slots.iter().map(|(id, usn)| (id, *usn))
    }

    /// Fold every slot of `other` into this vector. Returns how many slots moved.
    pub fn merge(&mut self, other: &UpToDateVector) -> usize {
        other
            .iter()
            .filter(|(origin, usn)| self.update(origin, *usn))
            .count()
    }

    /// Wire form of the vector segment: `id1:usn1,id2:usn2`.
    pub fn to_wire(&self) -> String {
        self.slots
            .iter()
            .map(|(id, usn)| format!("{}:{}", id, usn))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a vector segment. An empty segment is an empty vector.
    pub fn parse_wire(segment: &str) -> Result<Self> {
        let mut vector = Self::new();
        for pair in segment.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (id, usn) = pair.rsplit_once(':').ok_or_else(|| ReplError::MalformedCookie {
                msg: format!("vector pair without ':' in {:?}", pair),
            })?;
            if id.is_empty() {
                return Err(ReplError::MalformedCookie {
                    msg: format!("empty origin in {:?}", pair),
                });
            }
            let usn = usn.parse::<u64>().map_err(|e| ReplError::MalformedCookie {
                msg: format!("bad usn in {:?}: {}", pair, e),
            })?;
            vector.update(&InvocationId::new(id), usn);
        }
        Ok(vector)
    }

    /// Parse a vector segment and fold it in. Returns how many slots moved.
    pub fn merge_wire(&mut self, segment: &str) -> Result<usize> {
        let parsed = Self::parse_wire(segment)?;
        Ok(self.merge(&parsed))
    }
}

/// Final sync-done value of a pull: `<partnerUsn>,<id1:usn1,...>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    /// Partner-local sequence number the pull reached.
    pub partner_usn: u64,
    /// Partner's vector, its own slot included.
    pub vector: UpToDateVector,
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.partner_usn, self.vector.to_wire())
    }
}

impl FromStr for Cookie {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        let (usn, segment) = s.split_once(',').unwrap_or((s, ""));
        let partner_usn = usn.trim().parse::<u64>().map_err(|e| ReplError::MalformedCookie {
            msg: format!("bad partner usn {:?}: {}", usn, e),
        })?;
        Ok(Self {
            partner_usn,
            vector: UpToDateVector::parse_wire(segment)?,
        })
    }
}

/// Shared, lock-guarded vector of the local replica.
///
/// Reads (the sync-search path) take the read lock; applying a partner cookie
/// and restoring from a foreign database take the write lock.
#[derive(Debug)]
pub struct UpToDateStore {
    local_id: InvocationId,
    vector: RwLock<UpToDateVector>,
}

impl UpToDateStore {
    /// Create an empty store for the replica `local_id`.
    pub fn new(local_id: InvocationId) -> Self {
        Self {
            local_id,
            vector: RwLock::new(UpToDateVector::new()),
        }
    }

    /// Invocation id of the local replica.
    pub fn local_id(&self) -> &InvocationId {
        &self.local_id
    }

    /// Raise one slot if strictly greater.
    pub async fn update(&self, origin: &InvocationId, usn: u64) -> bool {
        self.vector.write().await.update(origin, usn)
    }

    /// Fold a partner cookie's vector in, skipping the local slot.
    pub async fn merge_cookie(&self, cookie: &Cookie) -> usize {
        let mut vector = self.vector.write().await;
        cookie
            .vector
            .iter()
            .filter(|(origin, _)| **origin != self.local_id)
            .filter(|(origin, usn)| vector.update(origin, *usn))
            .count()
    }

    /// Parse and fold in a wire vector segment.
    pub async fn merge_wire(&self, segment: &str) -> Result<usize> {
        let parsed = UpToDateVector::parse_wire(segment)?;
        Ok(self.vector.write().await.merge(&parsed))
    }

    /// Merge the vector of a restored foreign database.
    pub async fn restore_from(&self, foreign: &UpToDateVector) -> usize {
        let moved = self.vector.write().await.merge(foreign);
        tracing::info!(origins = foreign.len(), moved, "up-to-date vector restored from foreign database");
        moved
    }

    /// Wire form of the vector segment.
    pub async fn to_wire_format(&self) -> String {
        self.vector.read().await.to_wire()
    }

    /// Whether a change `usn` authored by `origin` is still unknown here.
    pub async fn needs(&self, origin: &InvocationId, usn: u64) -> bool {
        if *origin == self.local_id {
            return false;
        }
        self.vector.read().await.needs(origin, usn)
    }

    /// Highest known sequence number from `origin`.
    pub async fn get(&self, origin: &InvocationId) -> Option<u64> {
        self.vector.read().await.get(origin)
    }

    /// Copy of the current vector.
    pub async fn snapshot(&self) -> UpToDateVector {
        self.vector.read().await.clone()
    }

    /// Current vector with the local slot set to `highest_usn`.
    pub async fn with_local_slot(&self, highest_usn: u64) -> UpToDateVector {
        let mut vector = self.snapshot().await;
        vector.update(&self.local_id, highest_usn);
        vector
    }

    /// Cookie a supplier hands out after serving everything up to `highest_usn`.
    pub async fn export_cookie(&self, highest_usn: u64) -> Cookie {
        Cookie {
            partner_usn: highest_usn,
            vector: self.with_local_slot(highest_usn).await,
        }
    }

    /// Merge the persisted vector from the naming-context root, if any.
    pub async fn load(&self, backend: &dyn Backend, base_dn: &str) -> Result<usize> {
        let stored = read_persisted(backend, base_dn)?;
        match stored {
            Some(vector) => Ok(self.vector.write().await.merge(&vector)),
            None => {
                tracing::debug!(base_dn, "no persisted up-to-date vector yet");
                Ok(0)
            }
        }
    }

    /// Write the vector to the naming-context root.
    pub async fn persist(&self, backend: &dyn Backend, base_dn: &str) -> Result<()> {
        let wire = self.to_wire_format().await;
        let mut txn = TxnGuard::begin(backend)?;
        let mut req = ModifyRequest::new(base_dn);
        req.ops.push(ModOp::Replace {
            attr: UTDV_ATTR.to_string(),
            values: if wire.is_empty() { Vec::new() } else { vec![wire.into_bytes()] },
        });
        txn.modify_entry(&req)?;
        txn.commit()
    }
}

fn read_persisted(backend: &dyn Backend, base_dn: &str) -> Result<Option<UpToDateVector>> {
    let txn = TxnGuard::begin(backend)?;
    let Some(id) = txn.entry_id_for_dn(base_dn)? else {
        return Ok(None);
    };
    let value = txn.fetch_entry(id)?.and_then(|root| root.first_str(UTDV_ATTR));
    value.map(|v| UpToDateVector::parse_wire(&v)).transpose()
}
