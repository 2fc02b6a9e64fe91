/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Command-line entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_sched::app::launch::{ExperimentContext, FlinkLauncher};
use tandem_sched::bootstrap::{self, EstimatorKind};
use tandem_sched::config::ClusterConfig;
use tandem_sched::estimator::ComplementarityEstimator;
use tandem_sched::scheduler::{Policy, Scheduler, SchedulerOpts};
use tandem_sched::stats::DEFAULT_WINDOW_SECS;
use tandem_sched::updater::UsageUpdater;
use tandem_sched::workload::{Experiment, Jobs};

#[derive(Parser)]
#[command(name = "tandem-sched", about = "Schedule batch applications on a cluster", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an experiment
    Run(RunArgs),
    /// Generate an experiment suite from the jobs catalog
    Gen {
        /// Path to the jobs.xml catalog
        jobs_xml: PathBuf,
        /// Number of jobs in the experiment
        #[arg(short = 'n', long, default_value_t = 10)]
        n_jobs: usize,
        /// Output path for the suite XML
        #[arg(short = 'o', long, default_value = "experiment.xml")]
        output: PathBuf,
    },
    /// Run an experiment while benchmarking several estimators in parallel
    Estimations {
        /// Path to the config.yaml
        config_yaml: PathBuf,
        /// Path to the jobs.xml catalog
        jobs_xml: PathBuf,
        /// Path to the experiment suite XML
        experiment_xml: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    RoundRobin,
    Random,
    Adaptive,
    GroupAdaptive,
}

impl From<PolicyArg> for Policy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::RoundRobin => Policy::RoundRobin,
            PolicyArg::Random => Policy::Random,
            PolicyArg::Adaptive => Policy::Adaptive,
            PolicyArg::GroupAdaptive => Policy::GroupAdaptive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EstimatorArg {
    EpsilonGreedy,
    Gradient,
    GroupGradient,
}

impl From<EstimatorArg> for EstimatorKind {
    fn from(value: EstimatorArg) -> Self {
        match value {
            EstimatorArg::EpsilonGreedy => EstimatorKind::EpsilonGreedy,
            EstimatorArg::Gradient => EstimatorKind::Gradient,
            EstimatorArg::GroupGradient => EstimatorKind::GroupGradient,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Path to the config.yaml
    config_yaml: PathBuf,
    /// Path to the jobs.xml catalog
    jobs_xml: PathBuf,
    /// Path to the experiment suite XML
    experiment_xml: PathBuf,

    /// Scheduling strategy
    #[arg(short = 's', long = "scheduler", value_enum, default_value = "round-robin")]
    scheduler: PolicyArg,

    /// Complementarity estimation strategy
    #[arg(short = 'e', long = "estimation", value_enum, default_value = "gradient")]
    estimation: EstimatorArg,

    /// Previously saved estimator state to start from
    #[arg(long = "estimation-parameters")]
    estimation_parameters: Option<PathBuf>,

    /// Folder the estimator state is saved into on stop
    #[arg(long = "estimation-folder", default_value = "estimation")]
    estimation_folder: PathBuf,

    /// Experiment name suffix
    #[arg(long = "experiment-name", default_value = "run")]
    experiment_name: String,

    /// Number of queued jobs the adaptive policies may peek
    #[arg(long = "jobs-to-peek", default_value_t = 7)]
    jobs_to_peek: usize,

    /// Root folder the post-run exports are collected into
    #[arg(long = "export-root", default_value = "expData")]
    export_root: String,

    /// Seconds between estimator update ticks
    #[arg(long = "update-interval", default_value_t = 60)]
    update_interval: u64,

    /// Log the full launch and export command lines
    #[arg(long)]
    pcmd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Gen {
            jobs_xml,
            n_jobs,
            output,
        } => gen(&jobs_xml, n_jobs, &output),
        Command::Estimations {
            config_yaml,
            jobs_xml,
            experiment_xml,
        } => estimations(&config_yaml, &jobs_xml, &experiment_xml).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = ClusterConfig::load(&args.config_yaml)?;
    let jobs = Jobs::from_xml_file(&args.jobs_xml)?;
    let experiment = Experiment::from_xml_file(&args.experiment_xml, &jobs)?;
    let groups = bootstrap::job_groups(&config)?;

    let policy = Policy::from(args.scheduler);
    if policy == Policy::GroupAdaptive {
        if args.estimation != EstimatorArg::GroupGradient {
            bail!("the group-adaptive scheduler needs the group-gradient estimator");
        }
        if config.slots.len() < 2 {
            bail!("the group-adaptive scheduler needs at least two slots configured");
        }
    }

    let estimators = vec![bootstrap::estimator(
        args.estimation.into(),
        &jobs,
        groups.as_ref(),
    )?];

    execute(
        &config,
        &jobs,
        &experiment,
        estimators,
        policy,
        groups,
        &args.experiment_name,
        &args.export_root,
        args.jobs_to_peek,
        args.update_interval,
        args.pcmd,
        args.estimation_parameters.as_deref(),
        &args.estimation_folder,
    )
    .await
}

fn gen(jobs_xml: &std::path::Path, n_jobs: usize, output: &std::path::Path) -> Result<()> {
    let jobs = Jobs::from_xml_file(jobs_xml)?;
    let mut rng = StdRng::from_entropy();
    let experiment = bootstrap::generate_experiment(&jobs, n_jobs, &mut rng)?;

    std::fs::write(output, experiment.to_xml()?)
        .with_context(|| format!("cannot write {}", output.display()))?;
    info!(output = %output.display(), n_jobs, "experiment generated");
    Ok(())
}

async fn estimations(
    config_yaml: &std::path::Path,
    jobs_xml: &std::path::Path,
    experiment_xml: &std::path::Path,
) -> Result<()> {
    let config = ClusterConfig::load(config_yaml)?;
    let jobs = Jobs::from_xml_file(jobs_xml)?;
    let experiment = Experiment::from_xml_file(experiment_xml, &jobs)?;
    let groups = bootstrap::job_groups(&config)?;

    // Every estimator consumes the same usage ticks; the round-robin policy
    // keeps the placement independent of any of them.
    let estimators = vec![
        bootstrap::estimator(EstimatorKind::Gradient, &jobs, groups.as_ref())?,
        bootstrap::estimator(EstimatorKind::EpsilonGreedy, &jobs, groups.as_ref())?,
    ];

    execute(
        &config,
        &jobs,
        &experiment,
        estimators,
        Policy::RoundRobin,
        groups,
        "estimations",
        "expData",
        7,
        60,
        false,
        None,
        std::path::Path::new("estimation"),
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    config: &ClusterConfig,
    jobs: &Jobs,
    experiment: &Experiment,
    estimators: Vec<Box<dyn ComplementarityEstimator>>,
    policy: Policy,
    groups: Option<tandem_sched::groups::JobGroups>,
    experiment_name: &str,
    export_root: &str,
    jobs_to_peek: usize,
    update_interval: u64,
    pcmd: bool,
    estimation_parameters: Option<&std::path::Path>,
    estimation_folder: &std::path::Path,
) -> Result<()> {
    let rm = bootstrap::resource_manager(config).await?;
    let stats = bootstrap::stat_collector(config)?;
    let cluster = bootstrap::cluster(config, &rm).await?;

    let context = ExperimentContext::new(experiment_name, export_root);
    info!(folder = %context.name, experiment = %experiment.name, "starting experiment");
    let launcher = Arc::new(FlinkLauncher::new(context, pcmd));

    let opts = SchedulerOpts {
        jobs_to_peek,
        ..SchedulerOpts::default()
    };
    let (scheduler, events) = Scheduler::new(
        cluster,
        estimators,
        rm,
        launcher,
        policy,
        groups,
        config.slot_labels(),
        opts,
    );

    if let Some(folder) = estimation_parameters {
        scheduler.load_estimator(folder)?;
    }
    scheduler.add_all(experiment.instantiate(jobs)?);

    let updater = UsageUpdater::new(
        Arc::clone(&scheduler),
        stats,
        Duration::from_secs(update_interval),
        DEFAULT_WINDOW_SECS,
    );
    let updater_handle = updater.spawn();

    Arc::clone(&scheduler).run(events).await?;
    let _ = updater_handle.await;

    scheduler.save_estimators(estimation_folder)?;
    Ok(())
}
