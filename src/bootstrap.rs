//! Construction of the concrete collaborators from configuration.
//!
//! Config names an implementation (`type`) plus its settings (`kwargs`);
//! everything behind the capability traits is decided here, once, at startup.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::Rng;

use crate::cluster::{Cluster, Node};
use crate::config::ClusterConfig;
use crate::estimator::{
    ComplementarityEstimator, EpsilonGreedy, Gradient, GroupGradient,
};
use crate::groups::JobGroups;
use crate::rm::{DummyRm, ResourceManager, YarnRm};
use crate::stats::{DummyStatCollector, InfluxCollector, ResourceMaxima, StatCollector};
use crate::workload::{Experiment, ExperimentEntry, Jobs};

/// Which estimator variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorKind {
    EpsilonGreedy,
    Gradient,
    GroupGradient,
}

pub async fn resource_manager(config: &ClusterConfig) -> Result<Arc<dyn ResourceManager>> {
    match config.resource_manager.kind.as_str() {
        "yarn" => {
            let settings = config.resource_manager.kwargs_as()?;
            Ok(Arc::new(YarnRm::connect(settings).await?))
        }
        "dummy" => Ok(Arc::new(DummyRm::new(config.resource_manager.kwargs_as()?))),
        other => bail!("unknown resource_manager type '{other}'"),
    }
}

pub fn stat_collector(config: &ClusterConfig) -> Result<Arc<dyn StatCollector>> {
    match config.stat_collector.kind.as_str() {
        "influxdb" => Ok(Arc::new(InfluxCollector::new(
            config.stat_collector.kwargs_as()?,
            ResourceMaxima::from_config(&config.server),
        ))),
        "dummy" => Ok(Arc::new(DummyStatCollector)),
        other => bail!("unknown stat_collector type '{other}'"),
    }
}

/// Build the cluster model from the fleet the resource manager reports,
/// applying the application-master exclusion, the per-node container
/// override, and the slot labels.
pub async fn cluster(config: &ClusterConfig, rm: &Arc<dyn ResourceManager>) -> Result<Cluster> {
    let fleet = rm.nodes().await?;

    let mut nodes = Vec::new();
    for (address, capacity) in fleet {
        if config.application_master.as_deref() == Some(address.as_str()) {
            continue;
        }
        let capacity = config.server.containers.unwrap_or(capacity) as usize;
        let slot = config.slot_of(&address).map(String::from);
        nodes.push(Node::new(address, capacity, slot));
    }

    if nodes.is_empty() {
        bail!("the resource manager reported no usable nodes");
    }
    Ok(Cluster::new(nodes))
}

/// The job-group table, when the config carries one.
pub fn job_groups(config: &ClusterConfig) -> Result<Option<JobGroups>> {
    if config.job_groups.is_empty() {
        return Ok(None);
    }
    JobGroups::from_config(&config.job_groups).map(Some)
}

pub fn estimator(
    kind: EstimatorKind,
    jobs: &Jobs,
    groups: Option<&JobGroups>,
) -> Result<Box<dyn ComplementarityEstimator>> {
    Ok(match kind {
        EstimatorKind::EpsilonGreedy => Box::new(EpsilonGreedy::new(
            jobs.names(),
            0.0,
            EpsilonGreedy::DEFAULT_EPSILON,
        )),
        EstimatorKind::Gradient => {
            Box::new(Gradient::new(jobs.names(), Gradient::DEFAULT_ALPHA, 0.0))
        }
        EstimatorKind::GroupGradient => {
            let groups = groups
                .context("the group estimator needs a job_groups configuration section")?;
            let names = jobs.names();
            groups.validate_workload(names.iter().map(String::as_str))?;
            Box::new(GroupGradient::new(groups.clone(), Gradient::DEFAULT_ALPHA, 0.0))
        }
    })
}

/// Sample a `n_jobs`-entry experiment uniformly from the catalog.
pub fn generate_experiment(jobs: &Jobs, n_jobs: usize, rng: &mut StdRng) -> Result<Experiment> {
    let names = jobs.names();
    if names.is_empty() {
        bail!("the jobs catalog is empty");
    }

    let entries = (0..n_jobs)
        .map(|_| ExperimentEntry {
            job: names[rng.gen_range(0..names.len())].clone(),
            data_set: None,
        })
        .collect();
    Ok(Experiment::new("generated_experiment", entries))
}
