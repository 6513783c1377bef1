//! In-process partner transport.
//!
//! Replicas registered on a [`LoopbackNetwork`] serve each other sync pages
//! straight from their [`MemoryBackend`], check bind credentials, and relay
//! urgent notifications to each other's engines. Used by the simulator and by
//! tests; a peer can be marked unreachable to simulate a network partition.

use crate::agreement::{AgreementRegistry, ReplicationAgreement};
use crate::engine::{EngineConfig, EngineHandle, ReplicationEngine};
use crate::error::{ReplError, Result};
use crate::memory::MemoryBackend;
use crate::metadata::InvocationId;
use crate::mutator::{originating_writes, EntryMutator, MutatorConfig};
use crate::partner::{
    Credential, Credentials, PageEntry, PartnerConnector, PartnerSession, SearchRequest, SyncPage,
    UrgentNotifier,
};
use crate::uptodate::UpToDateStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Peer {
    backend: Arc<MemoryBackend>,
    utdv: Arc<UpToDateStore>,
    accepted: Credential,
    reachable: bool,
    engine: Option<Arc<EngineHandle>>,
}

/// Registry of in-process replicas, keyed by URI.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: RwLock<HashMap<String, Peer>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a replica reachable under `uri`, accepting binds with `accepted`.
    pub async fn register(
        &self,
        uri: &str,
        backend: Arc<MemoryBackend>,
        utdv: Arc<UpToDateStore>,
        accepted: Credential,
    ) {
        self.peers.write().await.insert(
            uri.to_string(),
            Peer {
                backend,
                utdv,
                accepted,
                reachable: true,
                engine: None,
            },
        );
    }

    /// Change the credential a replica accepts.
    pub async fn set_accepted_credential(&self, uri: &str, accepted: Credential) {
        if let Some(peer) = self.peers.write().await.get_mut(uri) {
            peer.accepted = accepted;
        }
    }

    /// Partition a replica off the network, or heal it.
    pub async fn set_reachable(&self, uri: &str, reachable: bool) {
        if let Some(peer) = self.peers.write().await.get_mut(uri) {
            peer.reachable = reachable;
        }
    }

    /// Route urgent notifications for `uri` to its running engine.
    pub async fn attach_engine(&self, uri: &str, engine: Arc<EngineHandle>) {
        if let Some(peer) = self.peers.write().await.get_mut(uri) {
            peer.engine = Some(engine);
        }
    }

    async fn reachable_peer<T>(&self, uri: &str, pick: impl FnOnce(&Peer) -> T) -> Result<T> {
        let peers = self.peers.read().await;
        match peers.get(uri) {
            Some(peer) if peer.reachable => Ok(pick(peer)),
            Some(_) => Err(ReplError::NetworkError {
                msg: format!("{} unreachable", uri),
            }),
            None => Err(ReplError::NetworkError {
                msg: format!("no route to {}", uri),
            }),
        }
    }
}

#[async_trait]
impl PartnerConnector for LoopbackNetwork {
    async fn connect(
        &self,
        agreement: &ReplicationAgreement,
        credential: &Credential,
    ) -> Result<Box<dyn PartnerSession>> {
        let (backend, utdv, accepted) = self
            .reachable_peer(&agreement.partner_uri, |peer| {
                (peer.backend.clone(), peer.utdv.clone(), peer.accepted.clone())
            })
            .await?;
        if accepted != *credential {
            return Err(ReplError::AuthFailed {
                partner: agreement.partner_uri.clone(),
            });
        }
        Ok(Box::new(LoopbackSession {
            backend,
            utdv,
            snapshot: None,
        }))
    }
}

#[async_trait]
impl UrgentNotifier for LoopbackNetwork {
    async fn notify(&self, agreement: &ReplicationAgreement) -> Result<()> {
        let engine = self
            .reachable_peer(&agreement.partner_uri, |peer| peer.engine.clone())
            .await?
            .ok_or_else(|| ReplError::NetworkError {
                msg: format!("{} runs no engine", agreement.partner_uri),
            })?;
        engine.sync_now().await.map(|_| ())
    }
}

struct Snapshot {
    entries: Vec<PageEntry>,
    highest_usn: u64,
}

/// Session serving one pull from a snapshot taken at the first page.
struct LoopbackSession {
    backend: Arc<MemoryBackend>,
    utdv: Arc<UpToDateStore>,
    snapshot: Option<Snapshot>,
}

impl LoopbackSession {
    /// Changes past the watermark, minus those the consumer's vector covers.
    /// The sync-done USN still reaches past the withheld ones.
    fn take_snapshot(&self, request: &SearchRequest) -> Result<Snapshot> {
        let changes = self.backend.changes_since(request.since_usn)?;
        let highest_usn = changes.iter().map(|c| c.usn).max().unwrap_or(request.since_usn);
        let mut entries = Vec::with_capacity(changes.len());
        for change in &changes {
            if request.up_to_date.needs_any(&originating_writes(&change.entry)?) {
                entries.push(PageEntry::encode(change.state, change.usn, &change.entry)?);
            }
        }
        let withheld = changes.len() - entries.len();
        if withheld > 0 {
            tracing::debug!(withheld, highest_usn, "changes already known to the consumer withheld");
        }
        Ok(Snapshot {
            entries,
            highest_usn,
        })
    }
}

#[async_trait]
impl PartnerSession for LoopbackSession {
    async fn fetch_page(&mut self, request: &SearchRequest) -> Result<SyncPage> {
        let offset = match &request.paging_cookie {
            Some(raw) => bincode::deserialize::<u64>(raw)? as usize,
            None => {
                self.snapshot = Some(self.take_snapshot(request)?);
                0
            }
        };
        let Some(snapshot) = &self.snapshot else {
            return Err(ReplError::NetworkError {
                msg: "paging cookie without an open search".to_string(),
            });
        };
        let page_size = request.page_size.max(1);
        let end = (offset + page_size).min(snapshot.entries.len());
        let entries = snapshot.entries.get(offset..end).unwrap_or_default().to_vec();
        if end < snapshot.entries.len() {
            return Ok(SyncPage {
                entries,
                paging_cookie: Some(bincode::serialize(&(end as u64))?),
                sync_done: None,
            });
        }
        let cookie = self.utdv.export_cookie(snapshot.highest_usn).await;
        Ok(SyncPage {
            entries,
            paging_cookie: None,
            sync_done: Some(cookie),
        })
    }
}

/// One in-process replica: store, vector, agreements and mutator.
pub struct LoopbackReplica {
    /// URI the replica is reachable under.
    pub uri: String,
    /// Directory store.
    pub backend: Arc<MemoryBackend>,
    /// Up-to-date vector.
    pub utdv: Arc<UpToDateStore>,
    /// Pull agreements.
    pub agreements: Arc<AgreementRegistry>,
    /// Mutator for local writes.
    pub mutator: EntryMutator,
}

impl LoopbackReplica {
    /// Create a replica and register it on `network`.
    pub async fn join(
        network: &LoopbackNetwork,
        uri: &str,
        base_dn: &str,
        mutator_config: MutatorConfig,
        accepted: Credential,
    ) -> Self {
        let backend = Arc::new(MemoryBackend::new(base_dn));
        let utdv = Arc::new(UpToDateStore::new(mutator_config.local_id.clone()));
        network
            .register(uri, backend.clone(), utdv.clone(), accepted)
            .await;
        Self {
            uri: uri.to_string(),
            backend,
            utdv,
            agreements: Arc::new(AgreementRegistry::new()),
            mutator: EntryMutator::new(mutator_config),
        }
    }

    /// Invocation id of the replica.
    pub fn id(&self) -> &InvocationId {
        self.mutator.local_id()
    }

    /// Add a pull agreement towards `partner`.
    pub async fn pull_from(&self, partner: &LoopbackReplica) {
        self.agreements
            .add(ReplicationAgreement::new(partner.uri.clone(), partner.uri.clone()))
            .await;
    }

    /// Build the replica's cycle engine over `network`.
    pub fn engine(&self, network: Arc<LoopbackNetwork>, config: EngineConfig, credentials: Credentials) -> ReplicationEngine {
        ReplicationEngine::new(
            config,
            self.backend.clone(),
            self.mutator.clone(),
            self.utdv.clone(),
            self.agreements.clone(),
            network,
            credentials,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::uptodate::UpToDateVector;

    const BASE: &str = "dc=example";

    fn cred(secret: &str) -> Credential {
        Credential::new("dc$", secret)
    }

    async fn replica(network: &LoopbackNetwork, uri: &str) -> LoopbackReplica {
        LoopbackReplica::join(
            network,
            uri,
            BASE,
            MutatorConfig {
                local_id: InvocationId::new(uri),
                ..MutatorConfig::default()
            },
            cred("s"),
        )
        .await
    }

    #[tokio::test]
    async fn test_pages_and_sync_done_cookie() {
        let network = LoopbackNetwork::new();
        let dc1 = replica(&network, "ldap://dc1").await;
        for i in 0..5 {
            dc1.mutator
                .originate_add(dc1.backend.as_ref(), Entry::new(format!("cn=u{},{}", i, BASE)))
                .unwrap();
        }
        let agreement = ReplicationAgreement::new("a", "ldap://dc1");
        let mut session = network.connect(&agreement, &cred("s")).await.unwrap();

        let mut request = SearchRequest {
            since_usn: 0,
            page_size: 2,
            paging_cookie: None,
            up_to_date: UpToDateVector::new(),
        };
        let mut seen = Vec::new();
        let cookie = loop {
            let page = session.fetch_page(&request).await.unwrap();
            seen.extend(page.entries.iter().map(|e| e.partner_usn));
            if page.is_last() {
                break page.sync_done.unwrap();
            }
            request.paging_cookie = page.paging_cookie;
        };
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(cookie.partner_usn, 5);
        assert_eq!(cookie.vector.get(&InvocationId::new("ldap://dc1")), Some(5));
    }

    #[tokio::test]
    async fn test_known_changes_are_withheld() {
        let network = LoopbackNetwork::new();
        let dc1 = replica(&network, "ldap://dc1").await;
        for i in 0..3 {
            dc1.mutator
                .originate_add(dc1.backend.as_ref(), Entry::new(format!("cn=u{},{}", i, BASE)))
                .unwrap();
        }
        let agreement = ReplicationAgreement::new("a", "ldap://dc1");
        let mut session = network.connect(&agreement, &cred("s")).await.unwrap();

        let mut up_to_date = UpToDateVector::new();
        up_to_date.update(&InvocationId::new("ldap://dc1"), 2);
        let request = SearchRequest {
            since_usn: 0,
            page_size: 10,
            paging_cookie: None,
            up_to_date,
        };
        let page = session.fetch_page(&request).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].partner_usn, 3);
        assert_eq!(page.sync_done.unwrap().partner_usn, 3);
    }

    #[tokio::test]
    async fn test_wrong_credential_rejected() {
        let network = LoopbackNetwork::new();
        let _dc1 = replica(&network, "ldap://dc1").await;
        let agreement = ReplicationAgreement::new("a", "ldap://dc1");
        let err = network.connect(&agreement, &cred("nope")).await.err().unwrap();
        assert!(matches!(err, ReplError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let network = LoopbackNetwork::new();
        let _dc1 = replica(&network, "ldap://dc1").await;
        network.set_reachable("ldap://dc1", false).await;
        let agreement = ReplicationAgreement::new("a", "ldap://dc1");
        let err = network.connect(&agreement, &cred("s")).await.err().unwrap();
        assert!(err.is_transient());
        let err = network.notify(&agreement).await.unwrap_err();
        assert!(matches!(err, ReplError::NetworkError { .. }));
    }

    #[tokio::test]
    async fn test_notify_without_engine_fails() {
        let network = LoopbackNetwork::new();
        let _dc1 = replica(&network, "ldap://dc1").await;
        let agreement = ReplicationAgreement::new("a", "ldap://dc1");
        assert!(network.notify(&agreement).await.is_err());
    }
}
