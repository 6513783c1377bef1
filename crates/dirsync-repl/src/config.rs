//! Replica configuration file.

use crate::agreement::ReplicationAgreement;
use crate::engine::EngineConfig;
use crate::metadata::InvocationId;
use crate::mutator::MutatorConfig;
use crate::urgent::UrgentConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A pull agreement declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAgreement {
    /// Agreement identifier.
    pub id: String,
    /// Partner URI.
    pub partner_uri: String,
}

/// Top-level replica configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Invocation id; generated at startup when absent.
    pub invocation_id: Option<String>,
    /// Naming-context root DN.
    pub base_dn: String,
    /// Container holding agreement entries.
    pub agreement_container: Option<String>,
    /// Seconds between replication cycles.
    pub cycle_interval_secs: u64,
    /// Entries requested per sync page.
    pub page_size: usize,
    /// Attempts per entry before a deadlock aborts the cycle.
    pub max_deadlock_retries: u32,
    /// Urgent acknowledgements required; all live partners when absent.
    pub urgent_ack_threshold: Option<usize>,
    /// Per-wave urgent timeout in milliseconds.
    pub urgent_wave_timeout_ms: u64,
    /// Default writer wait in milliseconds.
    pub urgent_writer_timeout_ms: u64,
    /// Singleton object RDNs.
    pub singleton_rdns: Vec<String>,
    /// Agreements configured statically.
    pub agreements: Vec<StaticAgreement>,
}

impl Default for ReplConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        let urgent = UrgentConfig::default();
        let mutator = MutatorConfig::default();
        Self {
            invocation_id: None,
            base_dn: engine.base_dn,
            agreement_container: engine.agreement_container,
            cycle_interval_secs: engine.cycle_interval.as_secs(),
            page_size: engine.page_size,
            max_deadlock_retries: mutator.max_deadlock_retries,
            urgent_ack_threshold: urgent.ack_threshold,
            urgent_wave_timeout_ms: urgent.wave_timeout.as_millis() as u64,
            urgent_writer_timeout_ms: urgent.default_writer_timeout.as_millis() as u64,
            singleton_rdns: mutator.singleton_rdns,
            agreements: Vec::new(),
        }
    }
}

impl ReplConfig {
    /// Load from a `.toml` or `.json` file; missing keys take defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ReplConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ReplConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Cycle engine settings.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            base_dn: self.base_dn.clone(),
            agreement_container: self.agreement_container.clone(),
            page_size: self.page_size.max(1),
            cycle_interval: Duration::from_secs(self.cycle_interval_secs),
        }
    }

    /// Urgent coordinator settings.
    pub fn urgent_config(&self) -> UrgentConfig {
        UrgentConfig {
            ack_threshold: self.urgent_ack_threshold,
            wave_timeout: Duration::from_millis(self.urgent_wave_timeout_ms),
            default_writer_timeout: Duration::from_millis(self.urgent_writer_timeout_ms),
            ..UrgentConfig::default()
        }
    }

    /// Mutator settings; a missing invocation id is generated.
    pub fn mutator_config(&self) -> MutatorConfig {
        MutatorConfig {
            local_id: self
                .invocation_id
                .as_deref()
                .map(InvocationId::new)
                .unwrap_or_else(InvocationId::generate),
            max_deadlock_retries: self.max_deadlock_retries.max(1),
            singleton_rdns: self.singleton_rdns.clone(),
        }
    }

    /// Statically configured agreements.
    pub fn static_agreements(&self) -> Vec<ReplicationAgreement> {
        self.agreements
            .iter()
            .map(|a| ReplicationAgreement::new(a.id.clone(), a.partner_uri.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ReplConfig::default();
        assert!(config.invocation_id.is_none());
        assert_eq!(config.page_size, 100);
        assert_eq!(config.cycle_interval_secs, 60);
        assert_eq!(config.max_deadlock_retries, 3);
        assert!(config.urgent_ack_threshold.is_none());
        assert!(config.agreements.is_empty());
        assert_eq!(config.singleton_rdns.len(), 2);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
invocation_id = "1111"
base_dn = "dc=corp,dc=example"
page_size = 50
urgent_ack_threshold = 1

[[agreements]]
id = "to-dc2"
partner_uri = "ldap://dc2"
            "#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        assert_eq!(config.base_dn, "dc=corp,dc=example");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.cycle_interval_secs, 60);
        assert_eq!(config.urgent_config().ack_threshold, Some(1));
        assert_eq!(config.mutator_config().local_id, InvocationId::new("1111"));

        let agreements = config.static_agreements();
        assert_eq!(agreements.len(), 1);
        assert_eq!(agreements[0].partner_uri, "ldap://dc2");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "base_dn": "dc=example",
                "cycle_interval_secs": 5,
                "urgent_wave_timeout_ms": 250
            }}"#
        )
        .unwrap();

        let config = ReplConfig::from_file(file.path()).unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.base_dn, "dc=example");
        assert_eq!(engine.cycle_interval, Duration::from_secs(5));
        assert_eq!(config.urgent_config().wave_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ReplConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_generated_invocation_ids_differ() {
        let config = ReplConfig::default();
        assert_ne!(config.mutator_config().local_id, config.mutator_config().local_id);
    }

    #[test]
    fn test_zero_page_size_clamped() {
        let config = ReplConfig {
            page_size: 0,
            ..ReplConfig::default()
        };
        assert_eq!(config.engine_config().page_size, 1);
    }
}
