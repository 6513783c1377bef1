#![warn(missing_docs)]

//! dirsync replication subsystem: multi-master directory replication with
//! per-attribute last-writer-wins resolution, up-to-date vectors, paged pull
//! cycles and urgent propagation.

pub mod agreement;
pub mod backend;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod loopback;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod mutator;
pub mod partner;
pub mod resolver;
pub mod uptodate;
pub mod urgent;
