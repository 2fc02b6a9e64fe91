//! Launching applications through the external runner.
//!
//! The scheduler core never shells out itself; it hands the application to a
//! [`Launcher`].  [`FlinkLauncher`] builds the runner invocation, spawns it
//! fire-and-forget through `sh -c`, and emits the post-run metrics-export
//! commands once the application finishes.  [`NoopLauncher`] records calls for
//! tests and dry runs.

use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use super::Application;

pub trait Launcher: Send + Sync {
    /// Start the external process for `app`.  Fire-and-forget: completion is
    /// detected through the resource manager, not the process.
    fn launch(&self, app: &Application) -> Result<()>;

    /// Emit the post-run metrics-export commands for a finished application.
    fn export_metrics(&self, app: &Application);
}

/// Names the per-run folder that post-run exports are collected into.
#[derive(Debug, Clone)]
pub struct ExperimentContext {
    pub name: String,
    pub export_root: String,
}

impl ExperimentContext {
    pub fn new(suffix: &str, export_root: impl Into<String>) -> Self {
        Self {
            name: format!("experiment_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), suffix),
            export_root: export_root.into(),
        }
    }
}

/// Builds and spawns `flink run` invocations against the YARN session.
pub struct FlinkLauncher {
    runner: String,
    context: ExperimentContext,
    print_command: bool,
}

impl FlinkLauncher {
    pub fn new(context: ExperimentContext, print_command: bool) -> Self {
        Self {
            // Left unexpanded so the shell resolves the installation.
            runner: "$FLINK_HOME/bin/flink".to_string(),
            context,
            print_command,
        }
    }

    fn post_run_commands(&self, app: &Application) -> Vec<String> {
        let Some(id) = app.id() else {
            return Vec::new();
        };
        let folder = format!("{}/{}", self.context.export_root, self.context.name);
        vec![
            format!("mkdir -p {folder}"),
            format!("mv {id}.log {folder}/{}_{id}.log", app.name),
        ]
    }
}

impl Launcher for FlinkLauncher {
    fn launch(&self, app: &Application) -> Result<()> {
        let command = command_line(&self.runner, app)?.join(" ");
        if self.print_command {
            info!(app = %app, %command, "launch command");
        }

        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .spawn()
            .with_context(|| format!("cannot spawn runner for application {app}"))?;
        Ok(())
    }

    fn export_metrics(&self, app: &Application) {
        for command in self.post_run_commands(app) {
            if self.print_command {
                info!(app = %app, %command, "export command");
            }
            if let Err(error) = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .spawn()
            {
                warn!(app = %app, %command, %error, "export command failed to spawn");
            }
        }
    }
}

/// Build the full runner command for a placed, id-carrying application.
pub fn command_line(runner: &str, app: &Application) -> Result<Vec<String>> {
    let id = app
        .id()
        .with_context(|| format!("application {} has no id yet", app.name))?;

    let mut cmd = vec![
        runner.to_string(),
        "run".to_string(),
        "-m yarn-cluster".to_string(),
        format!("-ynm {}", app.name),
        format!("-yn {}", app.n_tasks()),
    ];
    if let Some(tm) = app.task_memory_mb {
        cmd.push(format!("-ytm {tm}"));
    }
    if let Some(class) = &app.main_class {
        cmd.push(format!("-c {class}"));
    }

    let mut hosts = format!("-yD fix.container.hosts={}", app.tasks_hosts().join(","));
    if let Some(am_host) = app.master_host() {
        hosts.push_str(&format!("@@fix.am.host={am_host}"));
    }
    cmd.push(hosts);

    cmd.push(app.jar.clone());
    for (position, arg) in app.args.iter().enumerate() {
        cmd.push(substitute_placeholders(arg, app, &id, position));
    }
    cmd.push(format!("1> {id}.log"));

    Ok(cmd)
}

/// Resolve `TEMP` and `DATASET` placeholders in a jar argument.
fn substitute_placeholders(arg: &str, app: &Application, id: &str, position: usize) -> String {
    let mut resolved = arg.to_string();
    if resolved.contains("TEMP") {
        let temp = format!("hdfs:///tmp/{}_{id}_{position}", app.name);
        resolved = resolved.replace("TEMP", &temp);
    }
    if resolved.contains("DATASET") {
        resolved = resolved.replace("DATASET", app.data_set.as_deref().unwrap_or(""));
    }
    resolved
}

/// Records launches instead of spawning anything.
#[derive(Debug, Default)]
pub struct NoopLauncher {
    launched: Mutex<Vec<String>>,
    exported: Mutex<Vec<String>>,
}

impl NoopLauncher {
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().expect("noop launcher lock poisoned").clone()
    }

    pub fn exported(&self) -> Vec<String> {
        self.exported.lock().expect("noop launcher lock poisoned").clone()
    }
}

impl Launcher for NoopLauncher {
    fn launch(&self, app: &Application) -> Result<()> {
        self.launched
            .lock()
            .expect("noop launcher lock poisoned")
            .push(app.name.clone());
        Ok(())
    }

    fn export_metrics(&self, app: &Application) {
        self.exported
            .lock()
            .expect("noop launcher lock poisoned")
            .push(app.name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::JobSpec;

    fn placed_app() -> Application {
        let spec = JobSpec {
            name: "app".into(),
            n_tasks: 3,
            task_memory_mb: Some(2048),
            main_class: Some("org.example.Main".into()),
            jar: "job.jar".into(),
            args: vec!["--input DATASET".into(), "--work TEMP".into()],
        };
        let app = Application::from_spec(&spec, Some("1T".into()));
        for i in 0..3 {
            app.place_container(i, &format!("N{i}")).unwrap();
        }
        app.place_container(3, "N_APP_M").unwrap();
        app.assign_id("flink".into());
        app
    }

    #[test]
    fn command_line_matches_the_runner_convention() {
        let app = placed_app();
        let cmd = command_line("$FLINK_HOME/bin/flink", &app).unwrap();

        assert_eq!(
            cmd,
            vec![
                "$FLINK_HOME/bin/flink",
                "run",
                "-m yarn-cluster",
                "-ynm app",
                "-yn 3",
                "-ytm 2048",
                "-c org.example.Main",
                "-yD fix.container.hosts=N0,N1,N2@@fix.am.host=N_APP_M",
                "job.jar",
                "--input 1T",
                "--work hdfs:///tmp/app_flink_1",
                "1> flink.log",
            ]
        );
    }

    #[test]
    fn command_line_requires_an_id() {
        let app = Application::new("app", 1);
        app.place_container(0, "N0").unwrap();
        assert!(command_line("flink", &app).is_err());
    }

    #[test]
    fn optional_runner_arguments_are_omitted() {
        let spec = JobSpec {
            name: "plain".into(),
            n_tasks: 1,
            task_memory_mb: None,
            main_class: None,
            jar: "plain.jar".into(),
            args: vec![],
        };
        let app = Application::from_spec(&spec, None);
        app.place_container(0, "N0").unwrap();
        app.place_container(1, "N1").unwrap();
        app.assign_id("id1".into());

        let cmd = command_line("flink", &app).unwrap();
        assert!(!cmd.iter().any(|c| c.starts_with("-ytm")));
        assert!(!cmd.iter().any(|c| c.starts_with("-c ")));
        assert_eq!(cmd[5], "-yD fix.container.hosts=N0@@fix.am.host=N1");
    }

    #[test]
    fn dataset_placeholder_resolves_to_empty_without_a_tag() {
        let spec = JobSpec {
            name: "x".into(),
            n_tasks: 1,
            task_memory_mb: None,
            main_class: None,
            jar: "x.jar".into(),
            args: vec!["DATASET".into()],
        };
        let app = Application::from_spec(&spec, None);
        app.place_container(0, "N0").unwrap();
        app.place_container(1, "N0").unwrap();
        app.assign_id("id2".into());

        let cmd = command_line("flink", &app).unwrap();
        // The placeholder collapses to an empty argument.
        assert_eq!(cmd[cmd.len() - 2], "");
    }
}
