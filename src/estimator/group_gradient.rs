//! Gradient-bandit estimation over the job-group space.
//!
//! Identical math to [`Gradient`](super::Gradient), but the arm index maps a
//! job name to its configured group, so the preference matrix is
//! `|groups| x |groups|` and observations from different jobs of the same
//! group accumulate in one row.
//!
//! Unlike the name-space estimators, `best_app_index` answers with a pair:
//! the group to schedule next and the on-cluster group to co-locate it with.
//! With zero or exactly two distinct scheduled applications it abstains and
//! the scheduler falls back to its slot-aware placement.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::app::Application;
use crate::groups::JobGroups;

use super::matrix::{expect_shape, load_json, save_axes, save_json, Tensor};
use super::{render_table, softmax, AppChoice, ComplementarityEstimator};

pub struct GroupGradient {
    groups: JobGroups,
    alpha: f64,
    average: Vec<f64>,
    update_count: Vec<u64>,
    preferences: Tensor<f64>,
    rng: StdRng,
}

impl GroupGradient {
    pub fn new(groups: JobGroups, alpha: f64, initial_average: f64) -> Self {
        Self::with_rng(groups, alpha, initial_average, StdRng::from_entropy())
    }

    pub fn with_rng(groups: JobGroups, alpha: f64, initial_average: f64, rng: StdRng) -> Self {
        let k = groups.len();
        let initial_count = u64::from(initial_average != 0.0);
        Self {
            alpha,
            average: vec![initial_average; k],
            update_count: vec![initial_count; k],
            preferences: Tensor::filled(k, k, 0.0),
            groups,
            rng,
        }
    }

    fn group_indices(&self, apps: &[Arc<Application>]) -> BTreeSet<usize> {
        apps.iter()
            .filter_map(|a| self.groups.group_index(&a.name))
            .collect()
    }

    fn sample(rng: &mut StdRng, mass: &[f64]) -> usize {
        match WeightedIndex::new(mass) {
            Ok(distribution) => distribution.sample(rng),
            Err(_) => rng.gen_range(0..mass.len()),
        }
    }
}

impl ComplementarityEstimator for GroupGradient {
    fn label(&self) -> &'static str {
        "group_gradient"
    }

    fn update_app(&mut self, app: &Application, concurrent: &[Arc<Application>], rate: f64) {
        let Some(i) = self.groups.group_index(&app.name) else {
            return;
        };
        let concurrent_groups = self.group_indices(concurrent);
        debug!(
            app = %app.name,
            group = i,
            concurrent_groups = ?concurrent_groups,
            rate,
            "group estimator update"
        );

        self.update_count[i] += 1;
        self.average[i] += (rate - self.average[i]) / self.update_count[i] as f64;

        let pi = softmax(self.preferences.row(i));
        let constant = self.alpha * (rate - self.average[i]);

        for j in 0..self.groups.len() {
            let h = self.preferences.get(i, j);
            if concurrent_groups.contains(&j) {
                self.preferences.set(i, j, h + constant * (1.0 - pi[j]));
            } else {
                self.preferences.set(i, j, h - constant * pi[j]);
            }
        }
    }

    fn best_app_index(
        &mut self,
        scheduled: &[Arc<Application>],
        candidates: &[Arc<Application>],
        _weights: Option<&[f64]>,
    ) -> AppChoice {
        if scheduled.is_empty() || scheduled.len() == 2 {
            return AppChoice::Abstain;
        }

        let scheduled_groups = self.group_indices(scheduled);
        let candidate_groups: Vec<usize> = self.group_indices(candidates).into_iter().collect();
        if scheduled_groups.is_empty() || candidate_groups.is_empty() {
            return AppChoice::Abstain;
        }

        let mut mass = vec![0.0; candidate_groups.len()];
        for &s in &scheduled_groups {
            let pi = softmax(self.preferences.row(s));
            for (m, &candidate_group) in mass.iter_mut().zip(&candidate_groups) {
                *m += pi[candidate_group];
            }
        }
        let next_group = candidate_groups[Self::sample(&mut self.rng, &mass)];

        // Among the groups actually on the cluster, co-locate with the one
        // whose preference for the new group is strongest.
        let mut host_group = None;
        let mut best = f64::NEG_INFINITY;
        for &g in &scheduled_groups {
            let preference = self.preferences.get(g, next_group);
            if preference > best {
                best = preference;
                host_group = Some(g);
            }
        }

        match host_group {
            Some(host_group) => AppChoice::Groups {
                next_group,
                host_group,
            },
            None => AppChoice::Abstain,
        }
    }

    fn best_node(
        &mut self,
        node_apps: &BTreeMap<String, Vec<Arc<Application>>>,
        app: &Application,
    ) -> Option<String> {
        if node_apps.is_empty() {
            return None;
        }
        let Some(candidate_group) = self.groups.group_index(&app.name) else {
            return node_apps.keys().next().cloned();
        };

        let addresses: Vec<String> = node_apps.keys().cloned().collect();
        let mass: Vec<f64> = addresses
            .iter()
            .map(|address| {
                self.group_indices(&node_apps[address])
                    .into_iter()
                    .map(|g| softmax(self.preferences.row(g))[candidate_group])
                    .sum()
            })
            .collect();

        let pick = Self::sample(&mut self.rng, &mass);
        addresses.into_iter().nth(pick)
    }

    fn save(&self, folder: &Path) -> Result<()> {
        save_json(folder, "average", &self.average)?;
        save_json(folder, "ucount", &self.update_count)?;
        save_json(folder, "preferences", &self.preferences)?;
        save_axes(folder, self.groups.group_names())
    }

    fn load(&mut self, folder: &Path) -> Result<()> {
        let average: Vec<f64> = load_json(folder, "average")?;
        let update_count: Vec<u64> = load_json(folder, "ucount")?;
        let preferences: Tensor<f64> = load_json(folder, "preferences")?;

        let k = self.groups.len();
        expect_shape(&preferences, k, k)?;
        if average.len() != k || update_count.len() != k {
            anyhow::bail!("vector length does not match the group table ({k})");
        }

        self.average = average;
        self.update_count = update_count;
        self.preferences = preferences;
        Ok(())
    }

    fn dump(&self) -> String {
        let names = self.groups.group_names();

        let mut header = vec![String::new()];
        header.extend(names.iter().cloned());
        let summary = render_table(
            &header,
            &[
                std::iter::once("Average".to_string())
                    .chain(self.average.iter().map(|v| format!("{v:.4}")))
                    .collect(),
                std::iter::once("Count".to_string())
                    .chain(self.update_count.iter().map(|v| v.to_string()))
                    .collect(),
            ],
        );

        let mut preference_header = vec!["Preferences".to_string()];
        preference_header.extend(names.iter().cloned());
        let rows: Vec<Vec<String>> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut row = vec![name.clone()];
                row.extend(self.preferences.row(i).iter().map(|v| format!("{v:.4}")));
                row
            })
            .collect();

        format!("{summary}\n{}", render_table(&preference_header, &rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobGroupConfig;

    fn app(name: &str) -> Arc<Application> {
        Arc::new(Application::new(name, 1))
    }

    fn groups() -> JobGroups {
        JobGroups::from_config(&[
            JobGroupConfig {
                name: "g0".into(),
                jobs: vec!["WordCount".into(), "KMeans".into()],
            },
            JobGroupConfig {
                name: "g1".into(),
                jobs: vec!["PageRank".into()],
            },
            JobGroupConfig {
                name: "g2".into(),
                jobs: vec!["Sort".into()],
            },
        ])
        .unwrap()
    }

    fn seeded(initial_average: f64) -> GroupGradient {
        GroupGradient::with_rng(groups(), 0.1, initial_average, StdRng::seed_from_u64(3))
    }

    #[test]
    fn jobs_of_one_group_share_an_arm() {
        let mut est = seeded(0.0);

        est.update_app(&app("WordCount"), &[app("PageRank")], 4.0);
        est.update_app(&app("KMeans"), &[app("PageRank")], 2.0);

        // Both updates landed on group 0.
        assert_eq!(est.update_count[0], 2);
        assert!((est.average[0] - 3.0).abs() < 1e-12);
        assert_eq!(est.update_count[1], 0);
    }

    #[test]
    fn abstains_with_zero_or_two_scheduled_apps() {
        let mut est = seeded(0.0);
        let candidates = [app("Sort")];

        let none = est.best_app_index(&[], &candidates, None);
        assert_eq!(none, AppChoice::Abstain);

        let two = est.best_app_index(&[app("WordCount"), app("PageRank")], &candidates, None);
        assert_eq!(two, AppChoice::Abstain);
    }

    #[test]
    fn one_scheduled_app_yields_a_group_pair() {
        let mut est = seeded(0.0);
        // Group 0 overwhelmingly prefers group 1.
        est.preferences.set(0, 1, 50.0);

        let choice = est.best_app_index(
            &[app("WordCount")],
            &[app("PageRank"), app("Sort")],
            None,
        );
        assert_eq!(
            choice,
            AppChoice::Groups {
                next_group: 1,
                host_group: 0
            }
        );
    }

    #[test]
    fn host_group_is_the_strongest_preference_among_scheduled() {
        let mut est = seeded(0.0);
        // Three scheduled apps in groups 0, 1 and 2; candidate group 1 wins
        // the sampling, and group 2 prefers it most.
        est.preferences.set(0, 1, 50.0);
        est.preferences.set(1, 1, 50.0);
        est.preferences.set(2, 1, 60.0);

        let choice = est.best_app_index(
            &[app("WordCount"), app("PageRank"), app("Sort")],
            &[app("PageRank")],
            None,
        );
        assert_eq!(
            choice,
            AppChoice::Groups {
                next_group: 1,
                host_group: 2
            }
        );
    }

    #[test]
    fn best_node_prefers_nodes_hosting_complementary_groups() {
        let mut est = seeded(0.0);
        est.preferences.set(0, 1, 50.0);
        // Group 2 mass concentrates away from the candidate group.
        est.preferences.set(2, 0, 50.0);

        let mut node_apps = BTreeMap::new();
        node_apps.insert("N0".to_string(), vec![app("Sort")]);
        node_apps.insert("N1".to_string(), vec![app("WordCount")]);

        for _ in 0..16 {
            assert_eq!(
                est.best_node(&node_apps, &app("PageRank")),
                Some("N1".to_string())
            );
        }
    }

    #[test]
    fn save_and_load_reproduce_the_group_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let mut est = seeded(1.0);
        est.update_app(&app("WordCount"), &[app("Sort")], 5.0);
        est.save(dir.path()).unwrap();

        let content = std::fs::read_to_string(dir.path().join("axes.txt")).unwrap();
        assert_eq!(content, "g0\ng1\ng2\n");

        let mut fresh = seeded(0.0);
        fresh.load(dir.path()).unwrap();
        assert_eq!(fresh.average, est.average);
        assert_eq!(fresh.update_count, est.update_count);
        assert_eq!(fresh.preferences, est.preferences);
    }
}
