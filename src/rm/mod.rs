/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Resource-manager client.
//!
//! The scheduler never talks to the cluster resource manager directly; it goes
//! through the [`ResourceManager`] capability trait.  [`YarnRm`] is the
//! production implementation against the YARN-style REST API, [`DummyRm`] is a
//! fixed in-memory fleet used by tests and offline runs.
//!
//! State polls deliberately swallow transport errors and report "not running,
//! not finished": the lifecycle workers poll in a loop, so the next attempt
//! retries, and a flaky RM must not wedge the scheduler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Application states the RM reports as terminal.
const FINISHED_STATES: [&str; 3] = ["FINISHED", "FAILED", "KILLED"];

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// One-shot enumeration of the fleet: address → container capacity.
    async fn nodes(&self) -> Result<BTreeMap<String, u32>>;

    /// Allocate the id the next submitted application will receive.
    fn next_application_id(&self) -> String;

    /// Whether the RM reports the application as currently running.
    /// Transport errors are swallowed and read as `false`.
    async fn is_application_running(&self, application_id: &str) -> bool;

    /// Whether the RM reports the application as finished (in any terminal
    /// state).  Transport errors are swallowed and read as `false`.
    async fn is_application_finished(&self, application_id: &str) -> bool;
}

// ── YARN REST client ──────────────────────────────────────────────────────────

/// Connection settings for [`YarnRm`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct YarnRmSettings {
    /// Base address of the RM web service, e.g. `http://rm.example.org:8088`.
    pub address: String,
}

/// Client for the YARN-style resource-manager REST API.
pub struct YarnRm {
    http: reqwest::Client,
    base: String,
    cluster_started_on: u64,
    next_sequence: AtomicU64,
    /// Serializes the running/finished state polls issued by the per-app
    /// lifecycle workers.
    poll_gate: Mutex<()>,
}

impl YarnRm {
    /// Connect and snapshot the cluster epoch and submission counter, which
    /// seed the application-id sequence.
    pub async fn connect(settings: YarnRmSettings) -> Result<Self> {
        let http = reqwest::Client::new();
        let base = settings.address.trim_end_matches('/').to_string();

        let info: ClusterInfoBody = get_json(&http, &format!("{base}/ws/v1/cluster/info"))
            .await
            .context("cannot read RM cluster info")?;
        let metrics: ClusterMetricsBody = get_json(&http, &format!("{base}/ws/v1/cluster/metrics"))
            .await
            .context("cannot read RM cluster metrics")?;

        info!(
            address = %base,
            cluster_started_on = info.cluster_info.started_on,
            apps_submitted = metrics.cluster_metrics.apps_submitted,
            "connected to resource manager"
        );

        Ok(Self {
            http,
            base,
            cluster_started_on: info.cluster_info.started_on,
            next_sequence: AtomicU64::new(metrics.cluster_metrics.apps_submitted),
            poll_gate: Mutex::new(()),
        })
    }

    async fn application_state(&self, application_id: &str) -> Result<String> {
        let url = format!("{}/ws/v1/cluster/apps/{application_id}", self.base);
        let body: ApplicationBody = get_json(&self.http, &url).await?;
        Ok(body.app.state)
    }
}

#[async_trait]
impl ResourceManager for YarnRm {
    async fn nodes(&self) -> Result<BTreeMap<String, u32>> {
        let url = format!("{}/ws/v1/cluster/nodes", self.base);
        let body: NodesBody = get_json(&self.http, &url)
            .await
            .context("cannot enumerate RM nodes")?;
        Ok(parse_nodes(body))
    }

    fn next_application_id(&self) -> String {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("application_{}_{:04}", self.cluster_started_on, sequence)
    }

    async fn is_application_running(&self, application_id: &str) -> bool {
        let _gate = self.poll_gate.lock().await;
        match self.application_state(application_id).await {
            Ok(state) => state == "RUNNING",
            Err(error) => {
                debug!(%application_id, %error, "running poll failed, assuming not running");
                false
            }
        }
    }

    async fn is_application_finished(&self, application_id: &str) -> bool {
        let _gate = self.poll_gate.lock().await;
        match self.application_state(application_id).await {
            Ok(state) => FINISHED_STATES.contains(&state.as_str()),
            Err(error) => {
                debug!(%application_id, %error, "finished poll failed, assuming not finished");
                false
            }
        }
    }
}

async fn get_json<T: for<'de> Deserialize<'de>>(http: &reqwest::Client, url: &str) -> Result<T> {
    http.get(url)
        .send()
        .await
        .with_context(|| format!("GET {url} failed"))?
        .error_for_status()
        .with_context(|| format!("GET {url} returned an error status"))?
        .json::<T>()
        .await
        .with_context(|| format!("GET {url} returned an unexpected payload"))
}

// ── REST payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClusterInfoBody {
    #[serde(rename = "clusterInfo")]
    cluster_info: ClusterInfo,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    #[serde(rename = "startedOn")]
    started_on: u64,
}

#[derive(Debug, Deserialize)]
struct ClusterMetricsBody {
    #[serde(rename = "clusterMetrics")]
    cluster_metrics: ClusterMetrics,
}

#[derive(Debug, Deserialize)]
struct ClusterMetrics {
    #[serde(rename = "appsSubmitted")]
    apps_submitted: u64,
}

#[derive(Debug, Deserialize)]
struct NodesBody {
    nodes: NodeList,
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    node: Vec<NodeEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    #[serde(rename = "nodeHostName")]
    node_host_name: String,
    #[serde(rename = "availableVirtualCores")]
    available_virtual_cores: u32,
}

#[derive(Debug, Deserialize)]
struct ApplicationBody {
    app: ApplicationReport,
}

#[derive(Debug, Deserialize)]
struct ApplicationReport {
    state: String,
}

fn parse_nodes(body: NodesBody) -> BTreeMap<String, u32> {
    body.nodes
        .node
        .into_iter()
        .map(|n| (n.node_host_name, n.available_virtual_cores))
        .collect()
}

// ── Dummy implementation ──────────────────────────────────────────────────────

/// Settings for [`DummyRm`], also usable from the config file for offline runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DummyRmSettings {
    pub n_nodes: usize,
    pub n_containers: u32,
    pub node_pattern: String,
    pub app_pattern: String,
}

impl Default for DummyRmSettings {
    fn default() -> Self {
        Self {
            n_nodes: 4,
            n_containers: 8,
            node_pattern: "N{}".to_string(),
            app_pattern: "A{}".to_string(),
        }
    }
}

/// In-memory resource manager with a fixed fleet and externally driven
/// application states.
pub struct DummyRm {
    settings: DummyRmSettings,
    submitted: AtomicU64,
    running: StdMutex<BTreeMap<String, bool>>,
    finished: StdMutex<BTreeMap<String, bool>>,
}

impl DummyRm {
    pub fn new(settings: DummyRmSettings) -> Self {
        Self {
            settings,
            submitted: AtomicU64::new(0),
            running: StdMutex::new(BTreeMap::new()),
            finished: StdMutex::new(BTreeMap::new()),
        }
    }

    pub fn set_running(&self, application_id: &str, running: bool) {
        self.running
            .lock()
            .expect("dummy RM state lock poisoned")
            .insert(application_id.to_string(), running);
    }

    pub fn set_finished(&self, application_id: &str, finished: bool) {
        self.finished
            .lock()
            .expect("dummy RM state lock poisoned")
            .insert(application_id.to_string(), finished);
    }
}

impl Default for DummyRm {
    fn default() -> Self {
        Self::new(DummyRmSettings::default())
    }
}

#[async_trait]
impl ResourceManager for DummyRm {
    async fn nodes(&self) -> Result<BTreeMap<String, u32>> {
        Ok((0..self.settings.n_nodes)
            .map(|i| {
                (
                    self.settings.node_pattern.replace("{}", &i.to_string()),
                    self.settings.n_containers,
                )
            })
            .collect())
    }

    fn next_application_id(&self) -> String {
        let sequence = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        self.settings.app_pattern.replace("{}", &sequence.to_string())
    }

    async fn is_application_running(&self, application_id: &str) -> bool {
        *self
            .running
            .lock()
            .expect("dummy RM state lock poisoned")
            .get(application_id)
            .unwrap_or(&false)
    }

    async fn is_application_finished(&self, application_id: &str) -> bool {
        *self
            .finished
            .lock()
            .expect("dummy RM state lock poisoned")
            .get(application_id)
            .unwrap_or(&false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dummy_rm_enumerates_patterned_nodes() {
        let rm = DummyRm::new(DummyRmSettings {
            n_nodes: 3,
            n_containers: 5,
            node_pattern: "NN{}".into(),
            app_pattern: "AA{}".into(),
        });

        let nodes = rm.nodes().await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes.get("NN0"), Some(&5));
        assert_eq!(nodes.get("NN2"), Some(&5));
    }

    #[tokio::test]
    async fn dummy_rm_allocates_sequential_ids() {
        let rm = DummyRm::default();
        assert_eq!(rm.next_application_id(), "A1");
        assert_eq!(rm.next_application_id(), "A2");
    }

    #[tokio::test]
    async fn dummy_rm_reports_externally_driven_state() {
        let rm = DummyRm::default();
        assert!(!rm.is_application_running("A1").await);
        assert!(!rm.is_application_finished("A1").await);

        rm.set_running("A1", true);
        assert!(rm.is_application_running("A1").await);

        rm.set_finished("A1", true);
        assert!(rm.is_application_finished("A1").await);
    }

    #[test]
    fn yarn_node_payload_parses() {
        let body: NodesBody = serde_json::from_str(
            r#"{"nodes":{"node":[
                {"nodeHostName":"w081","availableVirtualCores":4,"state":"RUNNING"},
                {"nodeHostName":"w082","availableVirtualCores":8}
            ]}}"#,
        )
        .unwrap();

        let nodes = parse_nodes(body);
        assert_eq!(nodes.get("w081"), Some(&4));
        assert_eq!(nodes.get("w082"), Some(&8));
    }

    #[test]
    fn yarn_cluster_payloads_parse() {
        let info: ClusterInfoBody =
            serde_json::from_str(r#"{"clusterInfo":{"id":1,"startedOn":1326895313}}"#).unwrap();
        assert_eq!(info.cluster_info.started_on, 1326895313);

        let metrics: ClusterMetricsBody =
            serde_json::from_str(r#"{"clusterMetrics":{"appsSubmitted":41,"appsPending":0}}"#)
                .unwrap();
        assert_eq!(metrics.cluster_metrics.apps_submitted, 41);

        let app: ApplicationBody =
            serde_json::from_str(r#"{"app":{"id":"application_1326895313_0042","state":"RUNNING"}}"#)
                .unwrap();
        assert_eq!(app.app.state, "RUNNING");
    }

    #[test]
    fn application_id_format_matches_the_rm_convention() {
        // Reproduce the id arithmetic without a live endpoint.
        let rm = YarnRm {
            http: reqwest::Client::new(),
            base: "http://localhost:8088".into(),
            cluster_started_on: 1326895313,
            next_sequence: AtomicU64::new(41),
            poll_gate: Mutex::new(()),
        };

        assert_eq!(rm.next_application_id(), "application_1326895313_0042");
        assert_eq!(rm.next_application_id(), "application_1326895313_0043");
    }
}
