//! Per-node usage sampling.
//!
//! [`StatCollector`] pulls windowed per-host aggregates from the external
//! metrics store and reduces them to one [`Usage`] per node.  The production
//! implementation talks to an InfluxDB-style HTTP API with three queries
//! (cpu, disk derivative, network derivative) grouped by host; hosts that
//! returned no points get an all-zero sample, which the updater then skips as
//! idle.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::ServerConfig;
use crate::usage::Usage;

/// Default sampling window, in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

#[async_trait]
pub trait StatCollector: Send + Sync {
    /// Mean usage per host over the trailing `window_secs` seconds.
    ///
    /// Every requested host is present in the result; hosts without samples
    /// map to a zero [`Usage`].
    async fn mean_usage(
        &self,
        hosts: &[String],
        window_secs: u64,
    ) -> Result<BTreeMap<String, Usage>>;
}

// ── Dummy implementation ──────────────────────────────────────────────────────

/// Constant all-ones usage, for tests and offline runs.
#[derive(Debug, Default)]
pub struct DummyStatCollector;

#[async_trait]
impl StatCollector for DummyStatCollector {
    async fn mean_usage(
        &self,
        hosts: &[String],
        _window_secs: u64,
    ) -> Result<BTreeMap<String, Usage>> {
        Ok(hosts
            .iter()
            .map(|h| {
                (
                    h.clone(),
                    Usage {
                        cpu: 1.0,
                        io_wait: 1.0,
                        dsk_read: 1.0,
                        dsk_write: 1.0,
                        net_recv: 1.0,
                        net_sent: 1.0,
                    },
                )
            })
            .collect())
    }
}

// ── InfluxDB-style implementation ─────────────────────────────────────────────

/// Connection settings for [`InfluxCollector`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxSettings {
    /// Base address, e.g. `http://metrics.example.org:8086`.
    pub address: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for InfluxSettings {
    fn default() -> Self {
        Self {
            address: "http://localhost:8086".to_string(),
            database: "telegraf".to_string(),
            username: None,
            password: None,
        }
    }
}

/// Per-resource normalization maxima taken from the `server` config section.
#[derive(Debug, Clone)]
pub struct ResourceMaxima {
    pub disk_max: f64,
    pub net_max: f64,
    pub disk_name: String,
    pub net_interface: String,
}

impl ResourceMaxima {
    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            disk_max: server.disk_max,
            net_max: server.net_max,
            disk_name: server.disk_name.clone(),
            net_interface: server.net_interface.clone(),
        }
    }
}

/// CPU readings are percentages.
const CPU_MAX: f64 = 100.0;

pub struct InfluxCollector {
    http: reqwest::Client,
    settings: InfluxSettings,
    maxima: ResourceMaxima,
}

impl InfluxCollector {
    pub fn new(settings: InfluxSettings, maxima: ResourceMaxima) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            maxima,
        }
    }

    async fn query(&self, q: &str) -> Result<QueryResponse> {
        let url = format!("{}/query", self.settings.address.trim_end_matches('/'));
        let mut params = vec![("db", self.settings.database.clone()), ("q", q.to_string())];
        if let Some(username) = &self.settings.username {
            params.push(("u", username.clone()));
        }
        if let Some(password) = &self.settings.password {
            params.push(("p", password.clone()));
        }

        self.http
            .get(&url)
            .query(&params)
            .send()
            .await
            .with_context(|| format!("metrics query failed: {q}"))?
            .error_for_status()
            .with_context(|| format!("metrics query rejected: {q}"))?
            .json::<QueryResponse>()
            .await
            .with_context(|| format!("unexpected metrics payload for: {q}"))
    }

    fn host_regex(hosts: &[String]) -> String {
        hosts.join("|")
    }
}

#[async_trait]
impl StatCollector for InfluxCollector {
    async fn mean_usage(
        &self,
        hosts: &[String],
        window_secs: u64,
    ) -> Result<BTreeMap<String, Usage>> {
        let host_regex = Self::host_regex(hosts);

        let cpu_query = format!(
            "SELECT mean(\"usage_user\"), mean(\"usage_iowait\") FROM \"cpu\" \
             WHERE time > now() - {window_secs}s AND host =~ /^({host_regex})$/ GROUP BY host"
        );
        let disk_query = format!(
            "SELECT non_negative_derivative(first(\"read_bytes\"), 1s), \
             non_negative_derivative(first(\"write_bytes\"), 1s) FROM \"diskio\" \
             WHERE \"name\" = '{}' AND time > now() - {window_secs}s \
             AND host =~ /^({host_regex})$/ GROUP BY host, time(10s) fill(none)",
            self.maxima.disk_name
        );
        let net_query = format!(
            "SELECT non_negative_derivative(first(\"bytes_recv\"), 1s), \
             non_negative_derivative(first(\"bytes_sent\"), 1s) FROM \"net\" \
             WHERE \"interface\" = '{}' AND time > now() - {window_secs}s \
             AND host =~ /^({host_regex})$/ GROUP BY host, time(10s) fill(none)",
            self.maxima.net_interface
        );

        let cpu = self.query(&cpu_query).await?;
        let disk = self.query(&disk_query).await?;
        let net = self.query(&net_query).await?;

        let mut usage: BTreeMap<String, Usage> =
            hosts.iter().map(|h| (h.clone(), Usage::default())).collect();

        for (host, means) in host_means(&cpu, [CPU_MAX, CPU_MAX], "cpu") {
            if let Some(u) = usage.get_mut(&host) {
                u.cpu = means[0];
                u.io_wait = means[1];
            }
        }
        for (host, means) in host_means(&disk, [self.maxima.disk_max; 2], "diskio") {
            if let Some(u) = usage.get_mut(&host) {
                u.dsk_read = means[0];
                u.dsk_write = means[1];
            }
        }
        for (host, means) in host_means(&net, [self.maxima.net_max; 2], "net") {
            if let Some(u) = usage.get_mut(&host) {
                u.net_recv = means[0];
                u.net_sent = means[1];
            }
        }

        Ok(usage)
    }
}

// ── Query payload reduction ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Reduce every series of a response to `(host, [mean per value column])`.
///
/// Each point is normalized against the column's maximum before the mean is
/// taken; points above the maximum are clamped to 1.0 and logged, since they
/// indicate a misconfigured `server` section.
fn host_means(response: &QueryResponse, maxima: [f64; 2], measurement: &str) -> Vec<(String, [f64; 2])> {
    let mut out = Vec::new();

    for result in &response.results {
        for series in &result.series {
            let Some(host) = series.tags.get("host") else {
                continue;
            };

            let mut means = [0.0f64; 2];
            for (column, mean) in means.iter_mut().enumerate() {
                let mut sum = 0.0;
                let mut count = 0usize;
                for row in &series.values {
                    // Column 0 is the timestamp; value columns follow.
                    let Some(value) = row.get(column + 1).and_then(|v| v.as_f64()) else {
                        continue;
                    };
                    let mut normalized = value / maxima[column];
                    if normalized > 1.0 {
                        warn!(
                            host = %host,
                            measurement,
                            value,
                            maximum = maxima[column],
                            "sample exceeds the configured resource maximum, clamping"
                        );
                        normalized = 1.0;
                    }
                    sum += normalized;
                    count += 1;
                }
                if count > 0 {
                    *mean = sum / count as f64;
                }
            }

            out.push((host.clone(), means));
        }
    }

    out
}
