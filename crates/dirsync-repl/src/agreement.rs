//! Replication agreements and the registry of live partners.

use crate::backend::{Backend, TxnGuard};
use crate::entry::{normalize_dn, Entry, ModOp, ModifyRequest};
use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Identifier of an agreement (normalized DN of its backing entry, or a configured name).
pub type AgreementId = String;

/// Object class marking agreement entries.
pub const AGREEMENT_CLASS: &str = "replicationAgreement";
/// Attribute holding the partner URI.
pub const PARTNER_URI_ATTR: &str = "replPartnerUri";
/// Attribute holding the last partner USN processed.
pub const LAST_USN_ATTR: &str = "replLastUsnProcessed";

/// Authentication failures older than this are forgotten.
const AUTH_FAILURE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// One pull agreement with a partner replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAgreement {
    /// Agreement identifier.
    pub id: AgreementId,
    /// Backing directory entry, if the agreement lives in the directory.
    pub dn: Option<String>,
    /// URI of the partner.
    pub partner_uri: String,
    /// Highest partner USN fully absorbed.
    pub last_usn: u64,
    /// Soft-deleted: skipped by cycles, awaiting purge.
    pub deleted: bool,
    /// Recent authentication failures.
    #[serde(skip)]
    pub auth_failures: Vec<SystemTime>,
}

impl ReplicationAgreement {
    /// Create an agreement with a zero watermark.
    pub fn new(id: impl Into<AgreementId>, partner_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dn: None,
            partner_uri: partner_uri.into(),
            last_usn: 0,
            deleted: false,
            auth_failures: Vec::new(),
        }
    }

    /// Build an agreement from its directory entry.
    pub fn from_entry(entry: &Entry) -> Result<Self> {
        let partner_uri = entry
            .first_str(PARTNER_URI_ATTR)
            .ok_or_else(|| ReplError::Backend {
                msg: format!("agreement {} has no {}", entry.dn, PARTNER_URI_ATTR),
            })?;
        let last_usn = match entry.first_str(LAST_USN_ATTR) {
            Some(raw) => raw.trim().parse().map_err(|e| ReplError::Backend {
                msg: format!("agreement {} has bad {}: {}", entry.dn, LAST_USN_ATTR, e),
            })?,
            None => 0,
        };
        Ok(Self {
            id: normalize_dn(&entry.dn),
            dn: Some(entry.dn.clone()),
            partner_uri,
            last_usn,
            deleted: false,
            auth_failures: Vec::new(),
        })
    }
}

fn is_agreement_entry(entry: &Entry) -> bool {
    entry
        .get("objectClass")
        .map(|classes| {
            classes
                .iter()
                .any(|c| String::from_utf8_lossy(c).eq_ignore_ascii_case(AGREEMENT_CLASS))
        })
        .unwrap_or(false)
}

fn read_agreement_entries(backend: &dyn Backend, container_dn: &str) -> Result<Vec<Entry>> {
    let txn = TxnGuard::begin(backend)?;
    Ok(txn
        .children(container_dn)?
        .into_iter()
        .filter(|e| is_agreement_entry(e) && !e.is_deleted())
        .collect())
}

fn write_watermark(backend: &dyn Backend, dn: &str, usn: u64) -> Result<()> {
    let mut txn = TxnGuard::begin(backend)?;
    let mut req = ModifyRequest::new(dn);
    req.ops.push(ModOp::Replace {
        attr: LAST_USN_ATTR.to_string(),
        values: vec![usn.to_string().into_bytes()],
    });
    txn.modify_entry(&req)?;
    txn.commit()
}

/// Ordered, lock-guarded set of agreements.
///
/// Removal is two-phase: `soft_delete` hides an agreement from new cycles and
/// waves, `purge_deleted` drops it.
#[derive(Debug, Default)]
pub struct AgreementRegistry {
    agreements: Mutex<BTreeMap<AgreementId, ReplicationAgreement>>,
}

impl AgreementRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an agreement.
    pub async fn add(&self, agreement: ReplicationAgreement) -> Option<ReplicationAgreement> {
        tracing::info!(agreement = %agreement.id, partner = %agreement.partner_uri, "agreement registered");
        self.agreements
            .lock()
            .await
            .insert(agreement.id.clone(), agreement)
    }

    /// Reconcile with the agreement entries under `container_dn`.
    ///
    /// New entries are added (keeping the in-memory watermark of known ones),
    /// and directory-backed agreements whose entry disappeared are soft-deleted.
    /// Returns the number of live directory-backed agreements.
    pub async fn load_from_directory(&self, backend: &dyn Backend, container_dn: &str) -> Result<usize> {
        let entries = read_agreement_entries(backend, container_dn)?;
        let mut loaded = Vec::with_capacity(entries.len());
        for entry in &entries {
            match ReplicationAgreement::from_entry(entry) {
                Ok(agreement) => loaded.push(agreement),
                Err(e) => tracing::warn!(dn = %entry.dn, error = %e, "skipping malformed agreement entry"),
            }
        }

        let mut agreements = self.agreements.lock().await;
        for agreement in agreements.values_mut() {
            if agreement.dn.is_some() && !loaded.iter().any(|a| a.id == agreement.id) {
                if !agreement.deleted {
                    tracing::info!(agreement = %agreement.id, "agreement entry removed, soft-deleting");
                }
                agreement.deleted = true;
            }
        }
        let count = loaded.len();
        for agreement in loaded {
            match agreements.get_mut(&agreement.id) {
                Some(existing) => {
                    existing.partner_uri = agreement.partner_uri;
                    existing.last_usn = existing.last_usn.max(agreement.last_usn);
                    existing.deleted = false;
                }
                None => {
                    agreements.insert(agreement.id.clone(), agreement);
                }
            }
        }
        Ok(count)
    }

    /// Hide an agreement from new cycles and waves.
    pub async fn soft_delete(&self, id: &str) -> bool {
        match self.agreements.lock().await.get_mut(id) {
            Some(agreement) => {
                agreement.deleted = true;
                true
            }
            None => false,
        }
    }

    /// Drop every soft-deleted agreement.
    pub async fn purge_deleted(&self) -> Vec<AgreementId> {
        let mut agreements = self.agreements.lock().await;
        let purged: Vec<AgreementId> = agreements
            .values()
            .filter(|a| a.deleted)
            .map(|a| a.id.clone())
            .collect();
        for id in &purged {
            agreements.remove(id);
        }
        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "purged soft-deleted agreements");
        }
        purged
    }

    /// Copy of every live agreement, in id order.
    pub async fn live_snapshot(&self) -> Vec<ReplicationAgreement> {
        self.agreements
            .lock()
            .await
            .values()
            .filter(|a| !a.deleted)
            .cloned()
            .collect()
    }

    /// Copy of one agreement.
    pub async fn get(&self, id: &str) -> Option<ReplicationAgreement> {
        self.agreements.lock().await.get(id).cloned()
    }

    /// Number of agreements, soft-deleted ones included.
    pub async fn len(&self) -> usize {
        self.agreements.lock().await.len()
    }

    /// True when no agreement is registered.
    pub async fn is_empty(&self) -> bool {
        self.agreements.lock().await.is_empty()
    }

    /// Advance an agreement's watermark and mirror it to its directory entry.
    pub async fn set_watermark(&self, backend: &dyn Backend, id: &str, usn: u64) -> Result<()> {
        let dn = {
            let mut agreements = self.agreements.lock().await;
            let agreement = agreements
                .get_mut(id)
                .ok_or_else(|| ReplError::AgreementUnknown { id: id.to_string() })?;
            agreement.last_usn = usn;
            agreement.dn.clone()
        };
        if let Some(dn) = dn {
            write_watermark(backend, &dn, usn)?;
        }
        Ok(())
    }

    /// Record an authentication failure; returns the failures within the window.
    pub async fn record_auth_failure(&self, id: &str, at: SystemTime) -> usize {
        let mut agreements = self.agreements.lock().await;
        let Some(agreement) = agreements.get_mut(id) else {
            return 0;
        };
        agreement.auth_failures.retain(|t| {
            at.duration_since(*t)
                .map(|age| age <= AUTH_FAILURE_WINDOW)
                .unwrap_or(true)
        });
        agreement.auth_failures.push(at);
        agreement.auth_failures.len()
    }

    /// Forget recorded authentication failures after a successful bind.
    pub async fn clear_auth_failures(&self, id: &str) {
        if let Some(agreement) = self.agreements.lock().await.get_mut(id) {
            agreement.auth_failures.clear();
        }
    }
}
