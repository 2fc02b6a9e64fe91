//! Cluster configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! resource_manager:
//!   type: yarn
//!   kwargs:
//!     address: "http://rm.example.org:8088"
//! stat_collector:
//!   type: influxdb
//!   kwargs:
//!     address: "http://metrics.example.org:8086"
//!     database: telegraf
//! server:
//!   disk_max: 500.0
//!   net_max: 450.0
//!   disk_name: sda
//!   net_interface: eth0
//!   containers: 4          # optional per-node override
//! application_master: "wally080.cit.tu-berlin.de"   # optional
//! slots:                   # optional, used by the group-adaptive policy
//!   - name: slot1
//!     nodes: [w081, w082]
//!   - name: slot2
//!     nodes: [w083, w084]
//! job_groups:              # optional, used by the group estimator
//!   - name: "WC,KM"
//!     jobs: [WordCount, KMeans]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Selects one concrete collaborator implementation by name, with free-form
/// keyword arguments interpreted by the chosen implementation.
#[derive(Debug, Clone, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub kwargs: serde_yaml::Value,
}

impl CollaboratorConfig {
    /// Deserialize the `kwargs` block into the settings type of the chosen
    /// implementation.  An absent block yields the settings' defaults.
    pub fn kwargs_as<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.kwargs.is_null() {
            return Ok(T::default());
        }
        serde_yaml::from_value(self.kwargs.clone())
            .with_context(|| format!("invalid kwargs for collaborator '{}'", self.kind))
    }
}

/// Per-resource normalization maxima and node-level overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Disk throughput treated as 100 % utilisation, in the unit the metrics
    /// store reports (bytes/s for the stock telegraf setup).
    pub disk_max: f64,
    /// Network throughput treated as 100 % utilisation.
    pub net_max: f64,
    /// Block device name the disk query filters on.
    pub disk_name: String,
    /// Interface name the network query filters on.
    pub net_interface: String,
    /// When set, overrides the container capacity reported by the resource
    /// manager for every node.
    #[serde(default)]
    pub containers: Option<u32>,
}

/// One named partition of the node fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotConfig {
    pub name: String,
    pub nodes: Vec<String>,
}

/// One named group of complementary-by-assumption job names.
#[derive(Debug, Clone, Deserialize)]
pub struct JobGroupConfig {
    pub name: String,
    pub jobs: Vec<String>,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub resource_manager: CollaboratorConfig,
    pub stat_collector: CollaboratorConfig,
    pub server: ServerConfig,
    /// Node hosting the external application master; excluded from placement.
    #[serde(default)]
    pub application_master: Option<String>,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    #[serde(default)]
    pub job_groups: Vec<JobGroupConfig>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open configuration file: {}", path.display()))?;
        Self::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn from_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("structurally invalid configuration YAML")
    }

    /// Slot label of `address`, if the config partitions the fleet.
    pub fn slot_of(&self, address: &str) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| s.nodes.iter().any(|n| n == address))
            .map(|s| s.name.as_str())
    }

    /// Ordered slot labels as written in the config.
    pub fn slot_labels(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }
}
