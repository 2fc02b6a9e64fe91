/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Complementarity estimation.
//!
//! Every estimator treats a job name (or job group) as a bandit arm and
//! learns, from the usage rates observed while applications run together,
//! which arms benefit from co-location.  The scheduler consults the estimator
//! through the [`ComplementarityEstimator`] capability trait both to reorder
//! the queue ([`best_app_index`](ComplementarityEstimator::best_app_index))
//! and to choose a co-location target
//! ([`best_node`](ComplementarityEstimator::best_node)).
//!
//! Three implementations exist: [`EpsilonGreedy`] over running averages,
//! [`Gradient`] over softmax preferences, and [`GroupGradient`] over the
//! smaller job-group space.

pub mod epsilon_greedy;
pub mod gradient;
pub mod group_gradient;
pub mod matrix;

pub use epsilon_greedy::EpsilonGreedy;
pub use gradient::Gradient;
pub use group_gradient::GroupGradient;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::app::Application;

/// Result of asking an estimator which candidate to schedule next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppChoice {
    /// Position of the chosen candidate in the candidate list.
    App(usize),
    /// Group-space answer: which group to schedule next and which on-cluster
    /// group to co-locate it with.
    Groups {
        next_group: usize,
        host_group: usize,
    },
    /// The estimator has no preference; the caller should fall back.
    Abstain,
}

pub trait ComplementarityEstimator: Send {
    /// Short stable name, used for log lines and persistence folders.
    fn label(&self) -> &'static str;

    /// Incorporate one observation: `app` ran alongside `concurrent` while
    /// `rate` was measured on their shared node.
    fn update_app(&mut self, app: &Application, concurrent: &[Arc<Application>], rate: f64);

    /// Pick which of `candidates` to schedule next given the applications
    /// already on the cluster and, optionally, their node-presence weights.
    fn best_app_index(
        &mut self,
        scheduled: &[Arc<Application>],
        candidates: &[Arc<Application>],
        weights: Option<&[f64]>,
    ) -> AppChoice;

    /// Pick a node to co-locate `app` on, given the running applications per
    /// candidate node.
    fn best_node(
        &mut self,
        node_apps: &BTreeMap<String, Vec<Arc<Application>>>,
        app: &Application,
    ) -> Option<String>;

    /// Persist the estimator state into `folder`.
    fn save(&self, folder: &Path) -> Result<()>;

    /// Replace the estimator state with a previously saved one.
    fn load(&mut self, folder: &Path) -> Result<()>;

    /// Render the learned state as text tables for the log.
    fn dump(&self) -> String;
}

/// Stable job-name → arm-index assignment.
///
/// Names are sorted on construction, so the same catalog always produces the
/// same index regardless of insertion order.
#[derive(Debug, Clone)]
pub struct JobIndex {
    index: BTreeMap<String, usize>,
    names: Vec<String>,
}

impl JobIndex {
    pub fn new(job_names: impl IntoIterator<Item = String>) -> Self {
        let names: Vec<String> = job_names
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Self { index, names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, job_name: &str) -> Option<usize> {
        self.index.get(job_name).copied()
    }

    /// Distinct arm indices of `apps`, in ascending order.  Names outside the
    /// catalog are skipped.
    pub fn indices(&self, apps: &[Arc<Application>]) -> BTreeSet<usize> {
        apps.iter()
            .filter_map(|a| self.index_of(&a.name))
            .collect()
    }
}

/// Row softmax used by the gradient estimators.
pub(crate) fn softmax(row: &[f64]) -> Vec<f64> {
    let total: f64 = row.iter().map(|h| h.exp()).sum();
    row.iter().map(|h| h.exp() / total).collect()
}

/// Render a pipe table, tabulate-style.
pub(crate) fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
    let columns = header.len();
    let mut widths: Vec<usize> = header.iter().map(String::len).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(columns) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let format_row = |cells: &[String]| {
        let mut line = String::from("|");
        for (i, width) in widths.iter().enumerate() {
            let empty = String::new();
            let cell = cells.get(i).unwrap_or(&empty);
            line.push_str(&format!(" {cell:width$} |"));
        }
        line
    };

    let mut out = format_row(header);
    out.push('\n');
    out.push('|');
    for width in &widths {
        out.push_str(&format!("{:-<w$}|", "", w = width + 2));
    }
    for row in rows {
        out.push('\n');
        out.push_str(&format_row(row));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_index_is_sorted_and_stable() {
        let a = JobIndex::new(["WordCount".to_string(), "KMeans".to_string(), "Sort".to_string()]);
        let b = JobIndex::new(["Sort".to_string(), "WordCount".to_string(), "KMeans".to_string()]);

        assert_eq!(a.names(), b.names());
        assert_eq!(a.index_of("KMeans"), Some(0));
        assert_eq!(a.index_of("Sort"), Some(1));
        assert_eq!(a.index_of("WordCount"), Some(2));
        assert_eq!(a.index_of("PageRank"), None);
    }

    #[test]
    fn indices_deduplicate_shared_names() {
        let index = JobIndex::new(["A".to_string(), "B".to_string()]);
        let apps = vec![
            Arc::new(Application::new("A", 1)),
            Arc::new(Application::new("A", 1)),
            Arc::new(Application::new("B", 1)),
        ];
        let set = index.indices(&apps);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[0.0, 5.0, 1.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[1] > p[2] && p[2] > p[0]);
    }

    #[test]
    fn table_rendering_aligns_columns() {
        let header = vec!["Preferences".to_string(), "A".to_string()];
        let rows = vec![vec!["A".to_string(), "1.25".to_string()]];
        let table = render_table(&header, &rows);
        assert!(table.contains("| Preferences | A"));
        assert!(table.contains("| A"));
    }
}
