//! Job-name → group-index table.
//!
//! Groups cluster jobs that behave alike so the group estimator can learn in
//! a space much smaller than the job-name space.  The table is built from the
//! `job_groups` configuration section; every job name of a workload must
//! belong to exactly one group before a group-aware policy may run.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::config::JobGroupConfig;

#[derive(Debug, Clone)]
pub struct JobGroups {
    group_of: BTreeMap<String, usize>,
    names: Vec<String>,
}

impl JobGroups {
    /// Build the table from configuration, rejecting job names that appear in
    /// more than one group.
    pub fn from_config(groups: &[JobGroupConfig]) -> Result<Self> {
        let mut group_of = BTreeMap::new();
        let mut names = Vec::with_capacity(groups.len());

        for (index, group) in groups.iter().enumerate() {
            names.push(group.name.clone());
            for job in &group.jobs {
                if group_of.insert(job.clone(), index).is_some() {
                    bail!("job '{job}' appears in more than one job group");
                }
            }
        }

        if names.is_empty() {
            bail!("job_groups configuration is empty");
        }

        Ok(Self { group_of, names })
    }

    /// Ensure every workload job name is covered by the table.
    pub fn validate_workload<'a>(&self, job_names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for name in job_names {
            if !self.group_of.contains_key(name) {
                bail!("job '{name}' is not assigned to any job group");
            }
        }
        Ok(())
    }

    pub fn group_index(&self, job_name: &str) -> Option<usize> {
        self.group_of.get(job_name).copied()
    }

    pub fn group_name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn group_names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Vec<JobGroupConfig> {
        vec![
            JobGroupConfig {
                name: "WC,KM".into(),
                jobs: vec!["WordCount".into(), "KMeans".into()],
            },
            JobGroupConfig {
                name: "PR".into(),
                jobs: vec!["PageRank".into()],
            },
        ]
    }

    #[test]
    fn maps_each_job_to_its_group() {
        let groups = JobGroups::from_config(&config()).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups.group_index("WordCount"), Some(0));
        assert_eq!(groups.group_index("KMeans"), Some(0));
        assert_eq!(groups.group_index("PageRank"), Some(1));
        assert_eq!(groups.group_index("Sort"), None);
        assert_eq!(groups.group_name(1), Some("PR"));
    }

    #[test]
    fn duplicate_membership_is_rejected() {
        let mut cfg = config();
        cfg.push(JobGroupConfig {
            name: "dup".into(),
            jobs: vec!["KMeans".into()],
        });

        assert!(JobGroups::from_config(&cfg).is_err());
    }

    #[test]
    fn workload_validation_requires_full_coverage() {
        let groups = JobGroups::from_config(&config()).unwrap();

        assert!(groups.validate_workload(["WordCount", "PageRank"]).is_ok());
        assert!(groups.validate_workload(["WordCount", "Sort"]).is_err());
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(JobGroups::from_config(&[]).is_err());
    }
}
