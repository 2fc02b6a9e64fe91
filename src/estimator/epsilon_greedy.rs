//! Epsilon-greedy complementarity estimation.
//!
//! Keeps a `K x K` running average `average[s][c]`: the mean rate observed
//! while arm `c` ran alongside arm `s`.  Selection is greedy over expected
//! rates with probability `1 - epsilon` and explores a uniformly random
//! non-best candidate otherwise.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::app::Application;

use super::matrix::{expect_shape, load_json, save_axes, save_json, Tensor};
use super::{render_table, AppChoice, ComplementarityEstimator, JobIndex};

pub struct EpsilonGreedy {
    index: JobIndex,
    epsilon: f64,
    average: Tensor<f64>,
    update_count: Tensor<u64>,
    rng: StdRng,
}

impl EpsilonGreedy {
    pub const DEFAULT_EPSILON: f64 = 0.1;

    pub fn new(job_names: impl IntoIterator<Item = String>, initial_average: f64, epsilon: f64) -> Self {
        Self::with_rng(job_names, initial_average, epsilon, StdRng::from_entropy())
    }

    pub fn with_rng(
        job_names: impl IntoIterator<Item = String>,
        initial_average: f64,
        epsilon: f64,
        rng: StdRng,
    ) -> Self {
        let index = JobIndex::new(job_names);
        let k = index.len();
        // A non-zero prior counts as one observation, otherwise the first
        // real sample would be averaged against it.
        let initial_count = u64::from(initial_average != 0.0);
        Self {
            average: Tensor::filled(k, k, initial_average),
            update_count: Tensor::filled(k, k, initial_count),
            index,
            epsilon,
            rng,
        }
    }

    /// Expected rate of each candidate when placed alongside `scheduled`.
    fn expected_rates(
        &self,
        scheduled: &[Arc<Application>],
        candidates: &[Arc<Application>],
        weights: Option<&[f64]>,
    ) -> Vec<f64> {
        let candidate_indices: Vec<Option<usize>> = candidates
            .iter()
            .map(|c| self.index.index_of(&c.name))
            .collect();

        let mut rates = vec![0.0; candidates.len()];
        for (position, scheduled_app) in scheduled.iter().enumerate() {
            let Some(s) = self.index.index_of(&scheduled_app.name) else {
                continue;
            };
            let weight = weights.and_then(|w| w.get(position)).copied().unwrap_or(1.0);
            for (rate, candidate) in rates.iter_mut().zip(&candidate_indices) {
                if let Some(c) = candidate {
                    *rate += self.average.get(s, *c) * weight;
                }
            }
        }
        rates
    }

    /// Greedy pick over an ascending-preference order: the last item with
    /// probability `1 - epsilon`, otherwise a uniformly random other item.
    fn greedy<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        if items.len() > 1 && self.rng.gen::<f64>() < self.epsilon {
            &items[self.rng.gen_range(0..items.len() - 1)]
        } else {
            &items[items.len() - 1]
        }
    }
}

impl ComplementarityEstimator for EpsilonGreedy {
    fn label(&self) -> &'static str {
        "epsilon_greedy"
    }

    fn update_app(&mut self, app: &Application, concurrent: &[Arc<Application>], rate: f64) {
        let Some(i) = self.index.index_of(&app.name) else {
            return;
        };
        for j in self.index.indices(concurrent) {
            let count = self.update_count.get(i, j) + 1;
            self.update_count.set(i, j, count);
            let average = self.average.get(i, j);
            self.average
                .set(i, j, average + (rate - average) / count as f64);
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
            return AppChoice::App(0);
        }

        let rates = self.expected_rates(scheduled, candidates, weights);
        let all_equal = rates.iter().all(|r| *r == rates[0]);

        // Under complete ignorance the order is reversed, which biases the
        // exploration branch toward later queue entries.
        let order: Vec<usize> = if all_equal {
            (0..candidates.len()).rev().collect()
        } else {
            let mut order: Vec<usize> = (0..candidates.len()).collect();
            order.sort_by(|&a, &b| {
                rates[a]
                    .partial_cmp(&rates[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            order
        };

        AppChoice::App(*self.greedy(&order))
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
        let mut scored: Vec<(String, f64)> = node_apps
            .iter()
            .map(|(address, apps)| {
                (
                    address.clone(),
                    self.expected_rates(apps, &candidate, None)[0],
                )
            })
            .collect();

        if scored.iter().all(|(_, r)| *r == scored[0].1) {
            return node_apps.keys().next().cloned();
        }

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let addresses: Vec<String> = scored.into_iter().map(|(address, _)| address).collect();
        Some(self.greedy(&addresses).clone())
    }

    fn save(&self, folder: &Path) -> Result<()> {
        save_json(folder, "average", &self.average)?;
        save_json(folder, "ucount", &self.update_count)?;
        save_axes(folder, self.index.names())
    }

    fn load(&mut self, folder: &Path) -> Result<()> {
        let average: Tensor<f64> = load_json(folder, "average")?;
        let update_count: Tensor<u64> = load_json(folder, "ucount")?;
        let k = self.index.len();
        expect_shape(&average, k, k)?;
        expect_shape(&update_count, k, k)?;
        self.average = average;
        self.update_count = update_count;
        Ok(())
    }

    fn dump(&self) -> String {
        let names = self.index.names();
        let mut header = vec!["Preferences".to_string()];
        header.extend(names.iter().cloned());

        let rows: Vec<Vec<String>> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut row = vec![name.clone()];
                row.extend(self.average.row(i).iter().map(|v| format!("{v:.4}")));
                row
            })
            .collect();

        render_table(&header, &rows)
    }
}
