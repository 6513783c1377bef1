//! Partner-facing seams: credentials, the paged sync protocol and the urgent
//! notification RPC.
//!
//! The wire transport lives outside this crate; the cycle engine and the
//! urgent coordinator only see these traits.

use crate::agreement::ReplicationAgreement;
use crate::entry::{ChangeState, Entry};
use crate::error::Result;
use crate::mutator::IncomingChange;
use crate::uptodate::{Cookie, UpToDateVector};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Machine credential used to bind to partners.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    principal: String,
    secret: String,
}

impl Credential {
    /// Create a credential.
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }

    /// Account the credential belongs to.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Secret material.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Current machine credential plus the one it replaced, if a rotation is recent.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Credential in force.
    pub current: Credential,
    /// Credential before the last rotation.
    pub previous: Option<Credential>,
}

impl Credentials {
    /// Credentials with no rotation history.
    pub fn new(current: Credential) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    /// Install a new credential, keeping the old one as fallback.
    pub fn rotate(&mut self, next: Credential) {
        let old = std::mem::replace(&mut self.current, next);
        self.previous = Some(old);
    }
}

/// One change received in a sync page.
///
/// Keeps the encoded entry so a failed item can be requeued without fetching
/// it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageEntry {
    /// bincode-encoded entry, metadata attributes embedded.
    pub entry: Vec<u8>,
    /// Target DN as known to the partner.
    pub dn: String,
    /// Partner-local sequence number of the change.
    pub partner_usn: u64,
    /// Kind of change.
    pub state: ChangeState,
    /// Error code of the last failed attempt.
    pub last_error: Option<String>,
}

impl PageEntry {
    /// Encode a change for the wire.
    pub fn encode(state: ChangeState, partner_usn: u64, entry: &Entry) -> Result<Self> {
        Ok(Self {
            entry: bincode::serialize(entry)?,
            dn: entry.dn.clone(),
            partner_usn,
            state,
            last_error: None,
        })
    }

    /// Decode into a change unit for the mutator.
    pub fn decode(&self) -> Result<IncomingChange> {
        let entry: Entry = bincode::deserialize(&self.entry)?;
        Ok(IncomingChange::new(self.state, entry))
    }
}

/// Paged pull request: every change after `since_usn`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Agreement watermark.
    pub since_usn: u64,
    /// Maximum entries per page.
    pub page_size: usize,
    /// Opaque continuation from the previous page.
    pub paging_cookie: Option<Vec<u8>>,
    /// Consumer's up-to-date vector, its own slot included. Changes whose
    /// every originating write it already covers need not be sent.
    pub up_to_date: UpToDateVector,
}

/// One page of a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPage {
    /// Changes in partner USN order.
    pub entries: Vec<PageEntry>,
    /// Continuation; `None` on the last page.
    pub paging_cookie: Option<Vec<u8>>,
    /// Sync-done cookie, present on the last page.
    pub sync_done: Option<Cookie>,
}

impl SyncPage {
    /// Whether this page ends the pull.
    pub fn is_last(&self) -> bool {
        self.paging_cookie.is_none()
    }
}

/// Opens authenticated sessions to partners.
#[async_trait]
pub trait PartnerConnector: Send + Sync {
    /// Bind to the agreement's partner with `credential`.
    async fn connect(
        &self,
        agreement: &ReplicationAgreement,
        credential: &Credential,
    ) -> Result<Box<dyn PartnerSession>>;
}

/// An authenticated session serving sync pages.
#[async_trait]
pub trait PartnerSession: Send {
    /// Fetch the next page.
    async fn fetch_page(&mut self, request: &SearchRequest) -> Result<SyncPage>;
}

/// Sends "replicate now" to a partner and resolves once it acknowledged.
#[async_trait]
pub trait UrgentNotifier: Send + Sync {
    /// Ask the partner to pull now; returns after its acknowledgement.
    async fn notify(&self, agreement: &ReplicationAgreement) -> Result<()>;
}
