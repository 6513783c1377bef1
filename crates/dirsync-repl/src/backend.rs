//! Backend transaction and directory write interfaces consumed by the
//! replication core.
//!
//! The storage engine lives outside this crate. Everything the core needs
//! from it goes through [`Backend`] and the entry-scoped [`WriteTxn`]; the
//! [`TxnGuard`] aborts any transaction that is dropped without a commit.

use crate::entry::{Entry, EntryId, ModifyRequest};
use crate::error::Result;
use crate::metadata::{AttributeMetadata, ValueMetadata};
use std::ops::{Deref, DerefMut};

/// Source of write transactions.
pub trait Backend: Send + Sync {
    /// Begin a write transaction.
    fn begin_write(&self) -> Result<Box<dyn WriteTxn + '_>>;
}

/// One write transaction against the directory store.
///
/// Directory writes (`add_entry`, `modify_entry`) perform their own schema and
/// access checks; the replication core does not duplicate them.
pub trait WriteTxn {
    /// Allocate the next local sequence number.
    fn next_usn(&mut self) -> Result<u64>;

    /// Highest sequence number allocated so far.
    fn highest_usn(&self) -> Result<u64>;

    /// Stored metadata for one attribute of an entry.
    fn get_attr_meta(&self, id: EntryId, attr: &str) -> Result<Option<AttributeMetadata>>;

    /// Store metadata for one attribute of an entry.
    fn put_attr_meta(&mut self, id: EntryId, meta: &AttributeMetadata) -> Result<()>;

    /// Stored value-level metadata for one attribute of an entry.
    fn get_value_meta(&self, id: EntryId, attr: &str) -> Result<Vec<ValueMetadata>>;

    /// Store value-level metadata, replacing any record for the same value.
    fn put_value_meta(&mut self, id: EntryId, meta: &ValueMetadata) -> Result<()>;

    /// Drop every value-level record of one attribute.
    fn clear_value_meta(&mut self, id: EntryId, attr: &str) -> Result<()>;

    /// Resolve a DN to a local entry id.
    fn entry_id_for_dn(&self, dn: &str) -> Result<Option<EntryId>>;

    /// Resolve an object GUID to a local entry id.
    fn entry_id_for_guid(&self, guid: &str) -> Result<Option<EntryId>>;

    /// Fetch an entry by id.
    fn fetch_entry(&self, id: EntryId) -> Result<Option<Entry>>;

    /// Direct children of a DN.
    fn children(&self, dn: &str) -> Result<Vec<Entry>>;

    /// Create an entry.
    fn add_entry(&mut self, entry: Entry) -> Result<EntryId>;

    /// Modify an existing entry.
    fn modify_entry(&mut self, req: &ModifyRequest) -> Result<()>;

    /// Commit the transaction.
    fn commit(&mut self) -> Result<()>;

    /// Abort the transaction, discarding its writes.
    fn abort(&mut self);
}

/// Scoped write transaction: aborts on drop unless committed.
pub struct TxnGuard<'a> {
    txn: Box<dyn WriteTxn + 'a>,
    finished: bool,
}

impl<'a> TxnGuard<'a> {
    /// Begin a guarded transaction on the backend.
    pub fn begin(backend: &'a dyn Backend) -> Result<Self> {
        Ok(Self {
            txn: backend.begin_write()?,
            finished: false,
        })
    }

    /// Commit and consume the guard.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.txn.commit()
    }
}

impl<'a> Deref for TxnGuard<'a> {
    type Target = dyn WriteTxn + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.txn
    }
}

impl<'a> DerefMut for TxnGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.txn
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.txn.abort();
        }
    }
}
