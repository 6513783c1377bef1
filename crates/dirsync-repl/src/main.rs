#![warn(missing_docs)]

//! dirsync replication simulator: in-memory replicas over a loopback network.

use anyhow::{bail, Result};
use clap::Parser;
use dirsync_repl::config::ReplConfig;
use dirsync_repl::entry::{Entry, ModOp};
use dirsync_repl::loopback::{LoopbackNetwork, LoopbackReplica};
use dirsync_repl::metadata::InvocationId;
use dirsync_repl::mutator::MutatorConfig;
use dirsync_repl::partner::{Credential, Credentials};
use dirsync_repl::urgent::{UrgentCoordinator, UrgentOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dsrepl-sim", about = "Simulate multi-master directory replication")]
struct Cli {
    /// Replica configuration file (.toml or .json).
    #[arg(long, env = "DSREPL_CONFIG")]
    config: Option<PathBuf>,

    /// Number of replicas in the full mesh.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=3))]
    replicas: u8,

    /// Replication rounds after the conflicting writes.
    #[arg(long, default_value_t = 2)]
    rounds: u32,

    /// Skip the urgent propagation phase.
    #[arg(long)]
    no_urgent: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) if path.exists() => ReplConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            ReplConfig::default()
        }
        None => ReplConfig::default(),
    };
    tracing::info!(replicas = cli.replicas, base_dn = %config.base_dn, "dirsync simulator starting");

    let base = config.base_dn.clone();
    let network = Arc::new(LoopbackNetwork::new());
    let credential = Credential::new("dsrepl$", "machine-secret");

    let mut replicas = Vec::new();
    for n in 1..=cli.replicas as usize {
        let mutator = MutatorConfig {
            local_id: InvocationId::new(format!("{}", n * 1111)),
            ..config.mutator_config()
        };
        let uri = format!("ldap://dc{}", n);
        replicas.push(LoopbackReplica::join(&network, &uri, &base, mutator, credential.clone()).await);
    }
    for replica in &replicas {
        for partner in replicas.iter().filter(|p| p.uri != replica.uri) {
            replica.pull_from(partner).await;
        }
    }
    let mut engines: Vec<_> = replicas
        .iter()
        .map(|r| r.engine(network.clone(), config.engine_config(), Credentials::new(credential.clone())))
        .collect();

    let users = format!("ou=Users,{}", base);
    let alice = format!("cn=alice,{}", users);
    let first = &replicas[0];
    first
        .mutator
        .originate_add(first.backend.as_ref(), Entry::new(users.clone()).with_attr("ou", &["Users"]))?;
    first.mutator.originate_add(
        first.backend.as_ref(),
        Entry::new(alice.clone())
            .with_attr("cn", &["alice"])
            .with_attr("title", &["Engineer"]),
    )?;
    for engine in engines.iter_mut() {
        engine.run_cycle().await;
    }

    // Concurrent, conflicting edits on every replica before anyone syncs.
    for (n, replica) in replicas.iter().enumerate() {
        replica.mutator.originate_modify(
            replica.backend.as_ref(),
            &alice,
            vec![ModOp::Replace {
                attr: "title".to_string(),
                values: vec![format!("Title from dc{}", n + 1).into_bytes()],
            }],
        )?;
    }
    for round in 0..cli.rounds.max(1) {
        for engine in engines.iter_mut() {
            let report = engine.run_cycle().await;
            tracing::info!(round, cycle = report.cycle, recovery = report.recovery, "cycle done");
        }
    }

    // One membership per replica, each replicated before the next builds on it.
    for (n, replica) in replicas.iter().enumerate() {
        replica.mutator.originate_modify(
            replica.backend.as_ref(),
            &alice,
            vec![ModOp::AddValue {
                attr: "memberOf".to_string(),
                value: format!("cn=group{},{}", n + 1, base).into_bytes(),
            }],
        )?;
        for _ in 0..2 {
            for engine in engines.iter_mut() {
                engine.run_cycle().await;
            }
        }
    }

    let reference = replicas[0].backend.replicated_content()?;
    for replica in &replicas[1..] {
        if replica.backend.replicated_content()? != reference {
            bail!("{} diverged from {}", replica.uri, replicas[0].uri);
        }
    }
    let winner = replicas[0]
        .backend
        .entry(&alice)?
        .and_then(|e| e.first_str("title"))
        .unwrap_or_default();
    println!("converged: {} replicas, {} entries, title = {:?}", replicas.len(), reference.len(), winner);

    let mut handles = Vec::new();
    for (replica, engine) in replicas.iter().zip(engines) {
        let handle = Arc::new(engine.start());
        network.attach_engine(&replica.uri, handle.clone()).await;
        handles.push(handle);
    }

    if !cli.no_urgent {
        let urgent = UrgentCoordinator::start(
            config.urgent_config(),
            first.agreements.clone(),
            network.clone(),
            handles[0].metrics(),
        );
        let urgent_dn = format!("cn=urgent,{}", users);
        first.mutator.originate_add(
            first.backend.as_ref(),
            Entry::new(urgent_dn.clone()).with_attr("cn", &["urgent"]),
        )?;
        match urgent.wait_for_propagation(Some(Duration::from_secs(10))).await {
            UrgentOutcome::Done(wave) => {
                println!(
                    "urgent wave {}: {}/{} partners acknowledged ({:?})",
                    wave.wave, wave.acknowledged, wave.partners, wave.verdict
                );
            }
            other => tracing::warn!(outcome = ?other, "urgent propagation did not complete"),
        }
        for replica in &replicas[1..] {
            let present = replica.backend.entry(&urgent_dn)?.is_some();
            println!("{} has urgent entry: {}", replica.uri, present);
        }
        urgent.shutdown().await;
    }

    for (replica, handle) in replicas.iter().zip(&handles) {
        println!("# replica {}", replica.uri);
        print!("{}", handle.metrics().lock().await.format_all());
    }
    for handle in &handles {
        handle.shutdown().await;
    }
    Ok(())
}
