//! Gradient-bandit complementarity estimation.
//!
//! Keeps one running-average baseline per arm and a `K x K` preference matrix
//! `H`.  An observation moves the preferences of the arms that were actually
//! co-located toward (or away from) the baseline-relative reward through the
//! row softmax, and candidate selection samples from the resulting
//! distribution instead of maximising it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::app::Application;

use super::matrix::{expect_shape, load_json, save_axes, save_json, Tensor};
use super::{render_table, softmax, AppChoice, ComplementarityEstimator, JobIndex};

pub struct Gradient {
    index: JobIndex,
    alpha: f64,
    average: Vec<f64>,
    update_count: Vec<u64>,
    preferences: Tensor<f64>,
    rng: StdRng,
}

impl Gradient {
    pub const DEFAULT_ALPHA: f64 = 0.01;

    pub fn new(job_names: impl IntoIterator<Item = String>, alpha: f64, initial_average: f64) -> Self {
        Self::with_rng(job_names, alpha, initial_average, StdRng::from_entropy())
    }

    pub fn with_rng(
        job_names: impl IntoIterator<Item = String>,
        alpha: f64,
        initial_average: f64,
        rng: StdRng,
    ) -> Self {
        let index = JobIndex::new(job_names);
        let k = index.len();
        let initial_count = u64::from(initial_average != 0.0);
        Self {
            alpha,
            average: vec![initial_average; k],
            update_count: vec![initial_count; k],
            preferences: Tensor::filled(k, k, 0.0),
            index,
            rng,
        }
    }

    /// Softmax mass each candidate receives from the scheduled arms,
    /// optionally weighted by node presence.
    fn summed_probabilities(
        &self,
        scheduled: &[Arc<Application>],
        candidates: &[Arc<Application>],
        weights: Option<&[f64]>,
    ) -> Vec<f64> {
        let candidate_indices: Vec<Option<usize>> = candidates
            .iter()
            .map(|c| self.index.index_of(&c.name))
            .collect();

        let mut mass = vec![0.0; candidates.len()];
        for (position, scheduled_app) in scheduled.iter().enumerate() {
            let Some(s) = self.index.index_of(&scheduled_app.name) else {
                continue;
            };
            let weight = weights.and_then(|w| w.get(position)).copied().unwrap_or(1.0);
            let pi = softmax(self.preferences.row(s));
            for (m, candidate) in mass.iter_mut().zip(&candidate_indices) {
                if let Some(c) = candidate {
                    *m += pi[*c] * weight;
                }
            }
        }
        mass
    }

    /// Sample an index proportionally to `mass`, uniformly when the mass is
    /// degenerate.
    fn sample(rng: &mut StdRng, mass: &[f64]) -> usize {
        match WeightedIndex::new(mass) {
            Ok(distribution) => distribution.sample(rng),
            Err(_) => rng.gen_range(0..mass.len()),
        }
    }
}

impl ComplementarityEstimator for Gradient {
    fn label(&self) -> &'static str {
        "gradient"
    }

    fn update_app(&mut self, app: &Application, concurrent: &[Arc<Application>], rate: f64) {
        let Some(i) = self.index.index_of(&app.name) else {
            return;
        };

        self.update_count[i] += 1;
        self.average[i] += (rate - self.average[i]) / self.update_count[i] as f64;

        let concurrent_indices = self.index.indices(concurrent);
        let pi = softmax(self.preferences.row(i));
        let constant = self.alpha * (rate - self.average[i]);

        for j in 0..self.index.len() {
            let h = self.preferences.get(i, j);
            if concurrent_indices.contains(&j) {
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
        weights: Option<&[f64]>,
    ) -> AppChoice {
        if candidates.is_empty() {
            return AppChoice::Abstain;
        }
        if scheduled.is_empty() {
            return AppChoice::App(self.rng.gen_range(0..candidates.len()));
        }

        let mass = self.summed_probabilities(scheduled, candidates, weights);
        AppChoice::App(Self::sample(&mut self.rng, &mass))
    }

    fn best_node(
        &mut self,
        node_apps: &BTreeMap<String, Vec<Arc<Application>>>,
        app: &Application,
    ) -> Option<String> {
        if node_apps.is_empty() {
            return None;
        }

        let candidate = [Arc::new(Application::new(app.name.clone(), 0))];
        let addresses: Vec<String> = node_apps.keys().cloned().collect();
        let mass: Vec<f64> = addresses
            .iter()
            .map(|address| {
                self.summed_probabilities(&node_apps[address], &candidate, None)[0]
            })
            .collect();

        let pick = Self::sample(&mut self.rng, &mass);
        addresses.into_iter().nth(pick)
    }

    fn save(&self, folder: &Path) -> Result<()> {
        save_json(folder, "average", &self.average)?;
        save_json(folder, "ucount", &self.update_count)?;
        save_json(folder, "preferences", &self.preferences)?;
        save_axes(folder, self.index.names())
    }

    fn load(&mut self, folder: &Path) -> Result<()> {
        let average: Vec<f64> = load_json(folder, "average")?;
        let update_count: Vec<u64> = load_json(folder, "ucount")?;
        let preferences: Tensor<f64> = load_json(folder, "preferences")?;

        let k = self.index.len();
        expect_shape(&preferences, k, k)?;
        if average.len() != k || update_count.len() != k {
            anyhow::bail!("vector length does not match the current job index ({k})");
        }

        self.average = average;
        self.update_count = update_count;
        self.preferences = preferences;
        Ok(())
    }

    fn dump(&self) -> String {
        let names = self.index.names();

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

    fn app(name: &str) -> Arc<Application> {
        Arc::new(Application::new(name, 1))
    }

    fn jobs() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    fn seeded(alpha: f64, initial_average: f64) -> Gradient {
        Gradient::with_rng(jobs(), alpha, initial_average, StdRng::seed_from_u64(11))
    }

    fn preset_preferences(est: &mut Gradient) {
        let h = [[0.0, 5.0, 1.0], [5.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        for (i, row) in h.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                est.preferences.set(i, j, *value);
            }
        }
    }

    #[test]
    fn update_moves_preferences_through_the_softmax() {
        let mut est = seeded(0.1, 1.0);
        preset_preferences(&mut est);

        let pi = softmax(&[0.0, 5.0, 1.0]);
        est.update_app(&app("A"), &[app("B")], 2.0);

        // Baseline: prior counts as one observation, so 1 + (2 - 1) / 2.
        assert!((est.average[0] - 1.5).abs() < 1e-12);
        assert_eq!(est.update_count[0], 2);

        let delta = 0.1 * (2.0 - 1.5);
        assert!((est.preferences.get(0, 1) - (5.0 + delta * (1.0 - pi[1]))).abs() < 1e-12);
        assert!((est.preferences.get(0, 0) - (0.0 - delta * pi[0])).abs() < 1e-12);
        assert!((est.preferences.get(0, 2) - (1.0 - delta * pi[2])).abs() < 1e-12);

        // Other rows stay put.
        assert_eq!(est.preferences.get(1, 0), 5.0);
        assert_eq!(est.preferences.get(2, 0), 1.0);
    }

    #[test]
    fn summed_probabilities_carry_softmax_mass() {
        let mut est = seeded(0.1, 0.0);
        preset_preferences(&mut est);

        let mass = est.summed_probabilities(&[app("A")], &[app("B"), app("C")], None);
        let pi = softmax(&[0.0, 5.0, 1.0]);
        assert!((mass[0] - pi[1]).abs() < 1e-12);
        assert!((mass[1] - pi[2]).abs() < 1e-12);
    }

    #[test]
    fn empty_cluster_samples_uniformly() {
        let mut est = seeded(0.1, 0.0);
        for _ in 0..8 {
            match est.best_app_index(&[], &[app("A"), app("B")], None) {
                AppChoice::App(i) => assert!(i < 2),
                other => panic!("unexpected choice {other:?}"),
            }
        }
    }

    #[test]
    fn sampling_follows_overwhelming_preference_mass() {
        let mut est = seeded(0.1, 0.0);
        est.preferences.set(0, 1, 50.0);

        for _ in 0..16 {
            let choice = est.best_app_index(&[app("A")], &[app("B"), app("C")], None);
            assert_eq!(choice, AppChoice::App(0));
        }
    }

    #[test]
    fn best_node_weighs_each_nodes_running_apps() {
        let mut est = seeded(0.1, 0.0);
        // Arm A overwhelmingly prefers B; arm C concentrates its mass away
        // from B, so a node running A should win for B.
        est.preferences.set(0, 1, 50.0);
        est.preferences.set(2, 0, 50.0);

        let mut node_apps = BTreeMap::new();
        node_apps.insert("N0".to_string(), vec![app("C")]);
        node_apps.insert("N1".to_string(), vec![app("A")]);

        for _ in 0..16 {
            assert_eq!(est.best_node(&node_apps, &app("B")), Some("N1".to_string()));
        }
        assert_eq!(est.best_node(&BTreeMap::new(), &app("B")), None);
    }

    #[test]
    fn empty_nodes_fall_back_to_a_uniform_pick() {
        let mut est = seeded(0.1, 0.0);
        let mut node_apps = BTreeMap::new();
        node_apps.insert("N0".to_string(), Vec::new());
        node_apps.insert("N1".to_string(), Vec::new());

        let pick = est.best_node(&node_apps, &app("B"));
        assert!(pick.is_some());
    }

    #[test]
    fn save_and_load_reproduce_all_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let mut est = seeded(0.1, 1.0);
        preset_preferences(&mut est);
        est.update_app(&app("A"), &[app("B")], 2.0);
        est.save(dir.path()).unwrap();

        let mut fresh = seeded(0.1, 0.0);
        fresh.load(dir.path()).unwrap();

        assert_eq!(fresh.average, est.average);
        assert_eq!(fresh.update_count, est.update_count);
        assert_eq!(fresh.preferences, est.preferences);
    }
}
