/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The scheduling loop.
//!
//! [`Scheduler::run`] drives a pending queue of applications through
//! queued → placed → running → finished.  A drain pass
//! ([`schedule`](Scheduler::schedule)) launches applications until none of
//! the peeked candidates fits the free capacity; every completion event then
//! releases capacity and re-enters the drain.  Completion events arrive on a
//! channel and are consumed one at a time, so removal, the stop check and the
//! re-drain are atomic with respect to other completions.
//!
//! Four placement policies share the same capacity bookkeeping:
//!
//! * `RoundRobin` — head of the queue, spread over empty nodes first.
//! * `Random` — head of the queue, every container on a random non-full node.
//! * `Adaptive` — peeks a bounded queue prefix and asks the complementarity
//!   estimator which candidate to admit and where to co-locate it.
//! * `GroupAdaptive` — group-space estimator plus slot-aware placement; when
//!   the estimator abstains, the fleet partitions (slots) are filled
//!   first-fit.

pub mod error;

pub use error::SchedulerError;

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::app::launch::Launcher;
use crate::app::{AppEvent, Application, LifecycleOpts};
use crate::cluster::Cluster;
use crate::estimator::{AppChoice, ComplementarityEstimator};
use crate::groups::JobGroups;
use crate::rm::ResourceManager;
use crate::updater::leave_one_out;
use crate::usage::Usage;

/// Placement policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    Random,
    Adaptive,
    GroupAdaptive,
}

/// Tunables of the scheduling loop.
#[derive(Debug, Clone)]
pub struct SchedulerOpts {
    /// Queue prefix length the adaptive policies may inspect.
    pub jobs_to_peek: usize,
    /// Containers placed per node while filling empty nodes.
    pub placement_stride: usize,
    /// Delay between launches so the RM admits them in order.
    pub launch_delay: Duration,
    pub lifecycle: LifecycleOpts,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        Self {
            jobs_to_peek: 7,
            placement_stride: 4,
            launch_delay: Duration::from_secs(1),
            lifecycle: LifecycleOpts::default(),
        }
    }
}

struct Inner {
    queue: VecDeque<Arc<Application>>,
    cluster: Cluster,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    estimators: Mutex<Vec<Box<dyn ComplementarityEstimator>>>,
    rm: Arc<dyn ResourceManager>,
    launcher: Arc<dyn Launcher>,
    policy: Policy,
    groups: Option<JobGroups>,
    slot_labels: Vec<String>,
    opts: SchedulerOpts,
    events: UnboundedSender<AppEvent>,
    placement_rng: Mutex<StdRng>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Cluster,
        estimators: Vec<Box<dyn ComplementarityEstimator>>,
        rm: Arc<dyn ResourceManager>,
        launcher: Arc<dyn Launcher>,
        policy: Policy,
        groups: Option<JobGroups>,
        slot_labels: Vec<String>,
        opts: SchedulerOpts,
    ) -> (Arc<Self>, UnboundedReceiver<AppEvent>) {
        Self::with_rng(
            cluster,
            estimators,
            rm,
            launcher,
            policy,
            groups,
            slot_labels,
            opts,
            StdRng::from_entropy(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_rng(
        cluster: Cluster,
        estimators: Vec<Box<dyn ComplementarityEstimator>>,
        rm: Arc<dyn ResourceManager>,
        launcher: Arc<dyn Launcher>,
        policy: Policy,
        groups: Option<JobGroups>,
        slot_labels: Vec<String>,
        opts: SchedulerOpts,
        rng: StdRng,
    ) -> (Arc<Self>, UnboundedReceiver<AppEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let scheduler = Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                cluster,
            }),
            estimators: Mutex::new(estimators),
            rm,
            launcher,
            policy,
            groups,
            slot_labels,
            opts,
            events,
            placement_rng: Mutex::new(rng),
            shutdown,
        });
        (scheduler, receiver)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler state lock poisoned")
    }

    fn lock_estimators(&self) -> MutexGuard<'_, Vec<Box<dyn ComplementarityEstimator>>> {
        self.estimators.lock().expect("estimator lock poisoned")
    }

    pub fn add(&self, app: Arc<Application>) {
        self.lock_inner().queue.push_back(app);
    }

    pub fn add_all(&self, apps: impl IntoIterator<Item = Arc<Application>>) {
        let mut inner = self.lock_inner();
        inner.queue.extend(apps);
    }

    pub fn queue_len(&self) -> usize {
        self.lock_inner().queue.len()
    }

    /// Read-only access to the cluster model under the scheduler lock.
    pub fn with_cluster<R>(&self, read: impl FnOnce(&Cluster) -> R) -> R {
        read(&self.lock_inner().cluster)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Drive the queue until it is empty and every launched application has
    /// finished.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<AppEvent>) -> Result<()> {
        let started = Instant::now();
        self.schedule().await?;

        while !self.is_done() {
            if !self.with_cluster(Cluster::has_application_scheduled) {
                warn!("queue is not empty but nothing can be scheduled, giving up");
                break;
            }
            let Some(AppEvent::Finished(app)) = events.recv().await else {
                break;
            };
            info!(app = %app, "application finished");
            {
                let mut inner = self.lock_inner();
                inner.cluster.remove_application(&app);
            }
            if self.is_done() {
                break;
            }
            self.schedule().await?;
        }

        let _ = self.shutdown.send(true);
        info!(
            elapsed_secs = started.elapsed().as_secs(),
            "all applications finished"
        );
        Ok(())
    }

    fn is_done(&self) -> bool {
        let inner = self.lock_inner();
        inner.queue.is_empty() && !inner.cluster.has_application_scheduled()
    }

    /// One drain pass: launch applications until the policy reports that no
    /// peeked candidate fits.
    pub async fn schedule(&self) -> Result<(), SchedulerError> {
        loop {
            let app = match self.schedule_application() {
                Ok(app) => app,
                Err(SchedulerError::NoApplicationCanBeScheduled) => break,
                Err(other) => return Err(other),
            };
            app.start(
                Arc::clone(&self.rm),
                Arc::clone(&self.launcher),
                self.events.clone(),
                self.opts.lifecycle.clone(),
            )?;
            // Give the RM a moment so submissions are admitted in order.
            tokio::time::sleep(self.opts.launch_delay).await;
        }
        Ok(())
    }

    /// Pick the next application according to the policy and place all of its
    /// containers.  The chosen application is popped from the queue.
    pub fn schedule_application(&self) -> Result<Arc<Application>, SchedulerError> {
        let mut inner = self.lock_inner();
        if inner.queue.is_empty() {
            return Err(SchedulerError::NoApplicationCanBeScheduled);
        }
        let app = match self.policy {
            Policy::RoundRobin => self.schedule_head(&mut inner, false)?,
            Policy::Random => self.schedule_head(&mut inner, true)?,
            Policy::Adaptive => self.schedule_adaptive(&mut inner)?,
            Policy::GroupAdaptive => self.schedule_group_adaptive(&mut inner)?,
        };
        info!(app = %app, policy = ?self.policy, "application placed");
        Ok(app)
    }

    // ── RoundRobin / Random ───────────────────────────────────────────────────

    fn schedule_head(
        &self,
        inner: &mut Inner,
        random_only: bool,
    ) -> Result<Arc<Application>, SchedulerError> {
        let app = inner
            .queue
            .front()
            .cloned()
            .ok_or(SchedulerError::NoApplicationCanBeScheduled)?;
        if app.n_containers() > inner.cluster.available_containers() {
            return Err(SchedulerError::NoApplicationCanBeScheduled);
        }
        inner.queue.pop_front();

        if random_only {
            while app.next_unplaced().is_some() {
                let address = self
                    .random_non_full(inner, &app, None)
                    .ok_or(SchedulerError::NoApplicationCanBeScheduled)?;
                inner.cluster.place(&address, &app, 1)?;
            }
            Ok(app)
        } else {
            self.place_spread(inner, &app, None, false)?;
            Ok(app)
        }
    }

    // ── Adaptive ──────────────────────────────────────────────────────────────

    fn schedule_adaptive(&self, inner: &mut Inner) -> Result<Arc<Application>, SchedulerError> {
        let mut window: Vec<Arc<Application>> = inner
            .queue
            .iter()
            .take(self.opts.jobs_to_peek)
            .cloned()
            .collect();

        // Candidates that do not fit are dropped from the peek window only;
        // the queue itself is untouched until a candidate is admitted.
        loop {
            if window.is_empty() {
                return Err(SchedulerError::NoApplicationCanBeScheduled);
            }

            let (on_cluster, weights) = inner.cluster.applications(true, true);
            let pick = {
                let mut estimators = self.lock_estimators();
                match estimators[0].best_app_index(&on_cluster, &window, Some(&weights)) {
                    AppChoice::App(index) => index.min(window.len() - 1),
                    AppChoice::Groups { .. } | AppChoice::Abstain => 0,
                }
            };

            let app = Arc::clone(&window[pick]);
            if app.n_containers() <= inner.cluster.available_containers() {
                Self::pop_from_queue(inner, &app);
                self.place_spread(inner, &app, None, true)?;
                return Ok(app);
            }
            window.remove(pick);
        }
    }

    // ── GroupAdaptive ─────────────────────────────────────────────────────────

    fn schedule_group_adaptive(
        &self,
        inner: &mut Inner,
    ) -> Result<Arc<Application>, SchedulerError> {
        let window: Vec<Arc<Application>> = inner
            .queue
            .iter()
            .take(self.opts.jobs_to_peek)
            .cloned()
            .collect();
        if window.is_empty() {
            return Err(SchedulerError::NoApplicationCanBeScheduled);
        }

        let (on_cluster, weights) = inner.cluster.applications(true, true);
        let choice = {
            let mut estimators = self.lock_estimators();
            estimators[0].best_app_index(&on_cluster, &window, Some(&weights))
        };

        if let (AppChoice::Groups {
            next_group,
            host_group,
        }, Some(groups)) = (choice, self.groups.as_ref())
        {
            let matching = window
                .iter()
                .find(|a| groups.group_index(&a.name) == Some(next_group))
                .cloned();
            let host_slot = on_cluster
                .iter()
                .find(|a| groups.group_index(&a.name) == Some(host_group))
                .and_then(|a| a.slot());

            if let (Some(app), Some(slot)) = (matching, host_slot) {
                if app.n_containers() <= inner.cluster.available_containers_in_slot(&slot) {
                    info!(
                        app = %app,
                        next_group,
                        host_group,
                        slot = %slot,
                        "co-locating by group preference"
                    );
                    Self::pop_from_queue(inner, &app);
                    app.set_slot(&slot);
                    self.place_spread(inner, &app, Some(&slot), false)?;
                    return Ok(app);
                }
            }
        }

        self.slot_first_fit(inner, &window)
    }

    /// Fallback when the group estimator abstains: the first slot takes the
    /// first application while the cluster is quiet, the second slot takes
    /// everything admitted alongside it.
    fn slot_first_fit(
        &self,
        inner: &mut Inner,
        window: &[Arc<Application>],
    ) -> Result<Arc<Application>, SchedulerError> {
        let slot = if inner.cluster.has_application_running() {
            self.slot_labels.get(1)
        } else {
            self.slot_labels.first()
        }
        .ok_or(SchedulerError::NoApplicationCanBeScheduled)?
        .clone();

        for app in window {
            if app.n_containers() <= inner.cluster.available_containers_in_slot(&slot) {
                Self::pop_from_queue(inner, app);
                app.set_slot(&slot);
                self.place_spread(inner, app, Some(&slot), false)?;
                return Ok(Arc::clone(app));
            }
        }
        Err(SchedulerError::NoApplicationCanBeScheduled)
    }

    // ── Shared placement ──────────────────────────────────────────────────────

    /// Fill empty nodes evenly up to the placement stride, then hand the
    /// remaining containers to random non-full nodes, one at a time,
    /// preferring nodes that do not already host the application.  With
    /// `consult_estimator`, the estimator proposes the co-location node for
    /// each remaining container instead.
    fn place_spread(
        &self,
        inner: &mut Inner,
        app: &Arc<Application>,
        slot: Option<&str>,
        consult_estimator: bool,
    ) -> Result<(), SchedulerError> {
        let empty: Vec<String> = inner
            .cluster
            .empty_nodes()
            .filter(|n| slot.is_none() || n.slot() == slot)
            .map(|n| n.address().to_string())
            .collect();

        if !empty.is_empty() {
            let per_node = app
                .n_containers()
                .div_ceil(empty.len())
                .min(self.opts.placement_stride)
                .max(1);
            for address in &empty {
                if app.next_unplaced().is_none() {
                    break;
                }
                inner.cluster.place(address, app, per_node)?;
            }
        }

        while app.next_unplaced().is_some() {
            let proposed = if consult_estimator {
                self.estimator_node(inner, app, slot)
            } else {
                None
            };
            let address = proposed
                .or_else(|| self.random_non_full(inner, app, slot))
                .ok_or(SchedulerError::NoApplicationCanBeScheduled)?;
            inner.cluster.place(&address, app, 1)?;
        }
        Ok(())
    }

    /// Ask the estimator for a co-location node among the non-full ones.
    fn estimator_node(
        &self,
        inner: &Inner,
        app: &Arc<Application>,
        slot: Option<&str>,
    ) -> Option<String> {
        let mut node_apps: BTreeMap<String, Vec<Arc<Application>>> =
            inner.cluster.node_running_apps(false);
        if let Some(slot) = slot {
            let allowed = inner.cluster.slot_addresses(slot);
            node_apps.retain(|address, _| allowed.contains(address));
        }
        if node_apps.is_empty() {
            return None;
        }
        let mut estimators = self.lock_estimators();
        estimators[0].best_node(&node_apps, app)
    }

    /// A random non-full node, preferring nodes that do not already host
    /// `app`.
    fn random_non_full(
        &self,
        inner: &Inner,
        app: &Arc<Application>,
        slot: Option<&str>,
    ) -> Option<String> {
        let mut fresh = Vec::new();
        let mut any = Vec::new();
        for node in inner.cluster.non_full_nodes() {
            if slot.is_some() && node.slot() != slot {
                continue;
            }
            let address = node.address().to_string();
            if !node.hosts_application(app) {
                fresh.push(address.clone());
            }
            any.push(address);
        }

        let mut rng = self
            .placement_rng
            .lock()
            .expect("placement rng lock poisoned");
        fresh
            .choose(&mut *rng)
            .or_else(|| any.choose(&mut *rng))
            .cloned()
    }

    fn pop_from_queue(inner: &mut Inner, app: &Arc<Application>) {
        if let Some(position) = inner.queue.iter().position(|q| Arc::ptr_eq(q, app)) {
            inner.queue.remove(position);
        }
    }

    // ── Estimator plumbing ────────────────────────────────────────────────────

    /// Snapshot used by the periodic updater: fleet addresses and the running
    /// applications per node.
    pub(crate) fn usage_snapshot(
        &self,
    ) -> (Vec<String>, BTreeMap<String, Vec<Arc<Application>>>) {
        let inner = self.lock_inner();
        (inner.cluster.addresses(), inner.cluster.node_running_apps(true))
    }

    /// Attribute one usage tick to every estimator via leave-one-out.
    pub(crate) fn record_usage(
        &self,
        node_apps: &BTreeMap<String, Vec<Arc<Application>>>,
        usage: &BTreeMap<String, Usage>,
    ) {
        let mut estimators = self.lock_estimators();
        for (address, apps) in node_apps {
            let sample = usage.get(address).copied().unwrap_or_default();
            if apps.is_empty() || !sample.is_not_idle() {
                continue;
            }
            let rate = sample.rate();
            for (rest, out) in leave_one_out(apps) {
                for estimator in estimators.iter_mut() {
                    estimator.update_app(&out, &rest, rate);
                }
            }
        }
    }

    /// Load previously saved state into the decision estimator.
    pub fn load_estimator(&self, folder: &Path) -> Result<()> {
        let mut estimators = self.lock_estimators();
        estimators[0]
            .load(folder)
            .with_context(|| format!("cannot load estimator state from {}", folder.display()))
    }

    /// Persist every estimator under `root/<label>` and log its tables.
    pub fn save_estimators(&self, root: &Path) -> Result<()> {
        for estimator in self.lock_estimators().iter() {
            let folder = root.join(estimator.label());
            estimator
                .save(&folder)
                .with_context(|| format!("cannot save estimator state to {}", folder.display()))?;
            info!(estimator = estimator.label(), "learned state:\n{}", estimator.dump());
        }
        Ok(())
    }
}
