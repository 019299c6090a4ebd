use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::registry::DEFAULT_KEY_PREFIX;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root of the cluster keyspace in the KV store.
    pub key_prefix: String,
    /// Boot-ID source; None falls back to the platform file or a
    /// generated ID.
    pub boot_id_path: Option<PathBuf>,
    /// Address other machines can reach this one at.
    pub public_ip: Option<String>,
    /// Free-form placement attributes published with the machine record.
    pub metadata: BTreeMap<String, String>,
    /// Whether this node competes for the engine role.
    pub run_engine: bool,

    /// Machine record TTL; refreshed at half.
    pub machine_ttl: Duration,
    /// Engine-role lease TTL; renewed at half.
    pub lease_ttl: Duration,
    /// Per-job heartbeat TTL; refreshed at half.
    pub job_heartbeat_ttl: Duration,
    /// Engine reconcile interval.
    pub reconcile_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            boot_id_path: None,
            public_ip: None,
            metadata: BTreeMap::new(),
            run_engine: true,
            machine_ttl: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(10),
            job_heartbeat_ttl: Duration::from_secs(20),
            reconcile_interval: Duration::from_secs(2),
        }
    }
}

impl NodeConfig {
    pub fn new(key_prefix: &str) -> Self {
        Self {
            key_prefix: key_prefix.to_string(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Reject configurations whose TTLs cannot satisfy the renewal
    /// contract (refresh at half the TTL).
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.trim_matches('/').is_empty() {
            return Err(Error::InvalidConfig("empty key prefix".to_string()));
        }
        for (name, ttl) in [
            ("machine_ttl", self.machine_ttl),
            ("lease_ttl", self.lease_ttl),
            ("job_heartbeat_ttl", self.job_heartbeat_ttl),
        ] {
            if ttl < Duration::from_millis(100) {
                return Err(Error::InvalidConfig(format!("{name} too short: {ttl:?}")));
            }
        }
        if self.reconcile_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "reconcile_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let config = NodeConfig::new("///");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_tiny_ttl() {
        let config = NodeConfig {
            lease_ttl: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
