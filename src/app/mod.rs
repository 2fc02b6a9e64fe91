/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Application model and lifecycle.
//!
//! An [`Application`] is one pending or running unit of work: a fixed list of
//! task containers plus, for jobs submitted through the external runner, one
//! application-master container that coordinates but does negligible work.
//! Containers acquire node back-references at placement and share them with
//! the cluster model; everything else on the application is either immutable
//! or guarded for access from the lifecycle worker.
//!
//! [`Application::start`] runs the lifecycle on its own tokio task: launch the
//! external process fire-and-forget, wait out the warmup, then poll the
//! resource manager until it reports a terminal state.  Completion is
//! delivered to the scheduler as an [`AppEvent`] on a channel; the scheduler
//! drains those events one at a time, which is what makes completion handling
//! atomic.

pub mod launch;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::rm::ResourceManager;
use crate::scheduler::SchedulerError;
use crate::workload::JobSpec;
use launch::Launcher;

/// The two container roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Does the actual work; counted in usage attribution.
    Task,
    /// Coordinates the application; excluded from usage accounting.
    Master,
}

/// One scheduling unit of an application.
#[derive(Debug)]
pub struct Container {
    pub kind: ContainerKind,
    /// Address of the node this container is placed on; `None` while queued.
    pub node: Option<String>,
}

impl Container {
    pub fn is_negligible(&self) -> bool {
        self.kind == ContainerKind::Master
    }
}

/// Completion notification sent from a lifecycle worker to the scheduler.
#[derive(Debug)]
pub enum AppEvent {
    Finished(Arc<Application>),
}

/// Timing knobs for the lifecycle poll loop.
#[derive(Debug, Clone)]
pub struct LifecycleOpts {
    /// Sleep between resource-manager polls.
    pub poll_sleep: Duration,
    /// Extra delay before the first poll, letting the RM register the launch.
    pub warmup: Duration,
}

impl Default for LifecycleOpts {
    fn default() -> Self {
        Self {
            poll_sleep: Duration::from_secs(2),
            warmup: Duration::from_secs(10),
        }
    }
}

/// A pending or running unit of work.
#[derive(Debug)]
pub struct Application {
    /// Job class name, the key under which complementarity is learned.
    pub name: String,
    /// Dataset tag substituted into launch arguments.
    pub data_set: Option<String>,
    pub jar: String,
    pub args: Vec<String>,
    pub main_class: Option<String>,
    pub task_memory_mb: Option<u32>,

    n_tasks: usize,
    has_master: bool,
    id: OnceLock<String>,
    slot: OnceLock<String>,
    is_running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    ended_at: Mutex<Option<DateTime<Utc>>>,
    containers: Mutex<Vec<Container>>,
}

impl Application {
    /// A bare application without a master container.
    pub fn new(name: impl Into<String>, n_tasks: usize) -> Self {
        Self::build(name.into(), n_tasks, false, String::new(), Vec::new(), None, None, None)
    }

    /// Instantiate a catalog entry for one experiment run.  Runner-submitted
    /// jobs always carry an application-master container.
    pub fn from_spec(spec: &JobSpec, data_set: Option<String>) -> Self {
        Self::build(
            spec.name.clone(),
            spec.n_tasks,
            true,
            spec.jar.clone(),
            spec.args.clone(),
            spec.main_class.clone(),
            spec.task_memory_mb,
            data_set,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: String,
        n_tasks: usize,
        has_master: bool,
        jar: String,
        args: Vec<String>,
        main_class: Option<String>,
        task_memory_mb: Option<u32>,
        data_set: Option<String>,
    ) -> Self {
        let mut containers: Vec<Container> = (0..n_tasks)
            .map(|_| Container {
                kind: ContainerKind::Task,
                node: None,
            })
            .collect();
        if has_master {
            // The master is the last container placed.
            containers.push(Container {
                kind: ContainerKind::Master,
                node: None,
            });
        }

        Self {
            name,
            data_set,
            jar,
            args,
            main_class,
            task_memory_mb,
            n_tasks,
            has_master,
            id: OnceLock::new(),
            slot: OnceLock::new(),
            is_running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            ended_at: Mutex::new(None),
            containers: Mutex::new(containers),
        }
    }

    pub fn n_tasks(&self) -> usize {
        self.n_tasks
    }

    pub fn n_containers(&self) -> usize {
        self.n_tasks + usize::from(self.has_master)
    }

    pub fn has_master(&self) -> bool {
        self.has_master
    }

    pub fn id(&self) -> Option<String> {
        self.id.get().cloned()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self) {
        self.is_running.store(true, Ordering::SeqCst);
    }

    /// Slot label adopted at placement, if any.
    pub fn slot(&self) -> Option<String> {
        self.slot.get().cloned()
    }

    pub fn set_slot(&self, label: &str) {
        let _ = self.slot.set(label.to_string());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock().expect("application clock lock poisoned")
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.lock().expect("application clock lock poisoned")
    }

    /// Index of the next container the placement cursor will hand out.
    pub fn next_unplaced(&self) -> Option<usize> {
        self.containers
            .lock()
            .expect("container lock poisoned")
            .iter()
            .position(|c| c.node.is_none())
    }

    pub fn placed_count(&self) -> usize {
        self.containers
            .lock()
            .expect("container lock poisoned")
            .iter()
            .filter(|c| c.node.is_some())
            .count()
    }

    fn all_tasks_placed(&self) -> bool {
        self.containers
            .lock()
            .expect("container lock poisoned")
            .iter()
            .filter(|c| c.kind == ContainerKind::Task)
            .all(|c| c.node.is_some())
    }

    /// Node addresses of the task containers, in container order.
    pub fn tasks_hosts(&self) -> Vec<String> {
        self.containers
            .lock()
            .expect("container lock poisoned")
            .iter()
            .filter(|c| c.kind == ContainerKind::Task)
            .filter_map(|c| c.node.clone())
            .collect()
    }

    /// Node hosting the application-master container, once placed.
    pub fn master_host(&self) -> Option<String> {
        self.containers
            .lock()
            .expect("container lock poisoned")
            .iter()
            .find(|c| c.kind == ContainerKind::Master)
            .and_then(|c| c.node.clone())
    }

    pub fn container_node(&self, index: usize) -> Option<String> {
        self.containers
            .lock()
            .expect("container lock poisoned")
            .get(index)
            .and_then(|c| c.node.clone())
    }

    /// Set the node back-reference of one container.  Returns whether the
    /// container is negligible, or `None` if it already has a node.
    pub(crate) fn place_container(&self, index: usize, address: &str) -> Option<bool> {
        let mut containers = self.containers.lock().expect("container lock poisoned");
        let container = &mut containers[index];
        if container.node.is_some() {
            return None;
        }
        container.node = Some(address.to_string());
        Some(container.is_negligible())
    }

    /// Clear the node back-reference of one container.
    pub(crate) fn clear_container(&self, index: usize) {
        let mut containers = self.containers.lock().expect("container lock poisoned");
        if let Some(container) = containers.get_mut(index) {
            container.node = None;
        }
    }

    pub(crate) fn assign_id(&self, id: String) {
        let _ = self.id.set(id);
    }

    /// Launch the application and observe it until the resource manager
    /// reports a terminal state.
    ///
    /// The poll loop runs on its own tokio task; completion is delivered
    /// asynchronously through `events`.
    pub fn start(
        self: &Arc<Self>,
        rm: Arc<dyn ResourceManager>,
        launcher: Arc<dyn Launcher>,
        events: UnboundedSender<AppEvent>,
        opts: LifecycleOpts,
    ) -> Result<(), SchedulerError> {
        if !self.all_tasks_placed() {
            return Err(SchedulerError::NotCorrectlyScheduled {
                app: self.name.clone(),
            });
        }

        let id = rm.next_application_id();
        self.assign_id(id.clone());

        launcher
            .launch(self)
            .map_err(|source| SchedulerError::LaunchFailed {
                app: self.name.clone(),
                source,
            })?;

        *self.started_at.lock().expect("application clock lock poisoned") = Some(Utc::now());
        info!(app = %self, "application launched");

        let app = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(opts.poll_sleep + opts.warmup).await;
            loop {
                tokio::time::sleep(opts.poll_sleep).await;
                if rm.is_application_finished(&id).await {
                    break;
                }
                if !app.is_running() && rm.is_application_running(&id).await {
                    app.set_running();
                    info!(app = %app, "application is running");
                }
            }

            *app.ended_at.lock().expect("application clock lock poisoned") = Some(Utc::now());
            launcher.export_metrics(&app);

            if events.send(AppEvent::Finished(Arc::clone(&app))).is_err() {
                warn!(app = %app, "scheduler event channel closed before completion");
            }
        });

        Ok(())
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id.get() {
            Some(id) => write!(f, "{} : {}", self.name, id),
            None => write!(f, "{} : -", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::launch::NoopLauncher;
    use crate::rm::DummyRm;
    use tokio::sync::mpsc;

    fn fast_opts() -> LifecycleOpts {
        LifecycleOpts {
            poll_sleep: Duration::from_millis(10),
            warmup: Duration::ZERO,
        }
    }

    #[test]
    fn container_list_has_tasks_then_master() {
        let bare = Application::new("app", 8);
        assert_eq!(bare.n_tasks(), 8);
        assert_eq!(bare.n_containers(), 8);
        assert!(!bare.has_master());

        let spec = JobSpec {
            name: "app".into(),
            n_tasks: 3,
            task_memory_mb: None,
            main_class: None,
            jar: "x.jar".into(),
            args: vec![],
        };
        let submitted = Application::from_spec(&spec, None);
        assert_eq!(submitted.n_containers(), 4);
        assert!(submitted.has_master());

        // Cursor walks tasks first, master last.
        for i in 0..3 {
            let idx = submitted.next_unplaced().unwrap();
            assert_eq!(idx, i);
            let negligible = submitted.place_container(idx, "N0").unwrap();
            assert!(!negligible);
        }
        let master = submitted.next_unplaced().unwrap();
        assert!(submitted.place_container(master, "N1").unwrap());
        assert_eq!(submitted.master_host().as_deref(), Some("N1"));
        assert_eq!(submitted.tasks_hosts(), vec!["N0", "N0", "N0"]);
    }

    #[test]
    fn double_placement_is_rejected() {
        let app = Application::new("app", 1);
        app.place_container(0, "N0").unwrap();
        assert!(app.place_container(0, "N1").is_none());
    }

    #[tokio::test]
    async fn start_requires_every_task_placed() {
        let app = Arc::new(Application::new("app", 2));
        app.place_container(0, "N0").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = app
            .start(
                Arc::new(DummyRm::default()),
                Arc::new(NoopLauncher::default()),
                tx,
                fast_opts(),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotCorrectlyScheduled { .. }));
    }

    #[tokio::test]
    async fn lifecycle_flips_running_and_reports_completion() {
        let app = Arc::new(Application::new("app", 1));
        app.place_container(0, "N0").unwrap();

        let rm = Arc::new(DummyRm::default());
        let launcher = Arc::new(NoopLauncher::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        app.start(rm.clone(), launcher.clone(), tx, fast_opts())
            .unwrap();
        let id = app.id().unwrap();
        assert_eq!(id, "A1");
        assert_eq!(launcher.launched(), vec!["app"]);

        rm.set_running(&id, true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(app.is_running());

        rm.set_finished(&id, true);
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("lifecycle worker did not report completion")
            .unwrap();
        let AppEvent::Finished(done) = event;
        assert_eq!(done.name, "app");
        assert!(done.started_at().is_some());
        assert!(done.ended_at().is_some());
        assert_eq!(launcher.exported(), vec!["app"]);
    }

    #[test]
    fn display_includes_the_id_once_assigned() {
        let app = Application::new("WordCount", 1);
        assert_eq!(app.to_string(), "WordCount : -");
        app.assign_id("application_1_0001".into());
        assert_eq!(app.to_string(), "WordCount : application_1_0001");
    }
}
