//! Shared fixtures for the loopback integration tests.

#![allow(dead_code)]

use dirsync_repl::engine::{EngineConfig, ReplicationEngine};
use dirsync_repl::entry::Entry;
use dirsync_repl::loopback::{LoopbackNetwork, LoopbackReplica};
use dirsync_repl::metadata::InvocationId;
use dirsync_repl::mutator::MutatorConfig;
use dirsync_repl::partner::{Credential, Credentials};
use std::sync::Arc;
use std::time::Duration;

pub const BASE: &str = "dc=example,dc=com";

pub fn credential(secret: &str) -> Credential {
    Credential::new("dsrepl$", secret)
}

pub fn uri(id: &str) -> String {
    format!("ldap://dc-{}", id)
}

/// Engine settings for tests: the run loop never fires on its own.
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        base_dn: BASE.to_string(),
        agreement_container: None,
        page_size: 50,
        cycle_interval: Duration::from_secs(3600),
    }
}

/// Replicas named by invocation id, each pulling from every other one.
pub async fn mesh(network: &LoopbackNetwork, ids: &[&str]) -> Vec<LoopbackReplica> {
    let mut replicas = Vec::new();
    for id in ids {
        let config = MutatorConfig {
            local_id: InvocationId::new(*id),
            ..MutatorConfig::default()
        };
        replicas.push(LoopbackReplica::join(network, &uri(id), BASE, config, credential("secret")).await);
    }
    for replica in &replicas {
        for partner in replicas.iter().filter(|p| p.uri != replica.uri) {
            replica.pull_from(partner).await;
        }
    }
    replicas
}

pub fn engines(network: &Arc<LoopbackNetwork>, replicas: &[LoopbackReplica]) -> Vec<ReplicationEngine> {
    replicas
        .iter()
        .map(|r| r.engine(network.clone(), engine_config(), Credentials::new(credential("secret"))))
        .collect()
}

/// Run `rounds` cycles on every engine, in order.
pub async fn sync_rounds(engines: &mut [ReplicationEngine], rounds: usize) {
    for _ in 0..rounds {
        for engine in engines.iter_mut() {
            engine.run_cycle().await;
        }
    }
}

pub fn converged(replicas: &[LoopbackReplica]) -> bool {
    let reference = replicas[0].backend.replicated_content().unwrap();
    replicas[1..]
        .iter()
        .all(|r| r.backend.replicated_content().unwrap() == reference)
}

pub fn person(cn: &str, parent: &str) -> Entry {
    Entry::new(format!("cn={},{}", cn, parent)).with_attr("cn", &[cn])
}

pub fn attr(replica: &LoopbackReplica, dn: &str, name: &str) -> Option<String> {
    replica.backend.entry(dn).unwrap().and_then(|e| e.first_str(name))
}
