use crate::config::Config;
use crate::plan::ClusterPlan;
use anyhow::{Context, Result};
use facesort_core::{Assignment, ClusterId, SimilarityMatcher};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// What the file mover needs for one target directory.
#[derive(Debug, Serialize)]
pub struct DirectoryReport {
    pub directory: PathBuf,
    /// `cluster_id → person number`.
    pub assignments: BTreeMap<ClusterId, u32>,
    /// Per-cluster detail, in plan order.
    pub clusters: Vec<Assignment>,
    pub created: Vec<u32>,
    pub skipped: Vec<ClusterId>,
    pub persons_total: usize,
    /// Every source image referenced by the plan.
    pub processed_sources: BTreeSet<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DirectoryOutcome {
    Ok(DirectoryReport),
    Failed { directory: PathBuf, error: String },
}

impl DirectoryOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Match one directory's cluster plan against its registry and persist it.
///
/// The registry is read once before matching and written once after. A
/// failed write fails the whole directory.
pub fn process_directory(dir: &Path, config: &Config) -> Result<DirectoryReport> {
    let plan_path = dir.join(&config.plan_file);
    let plan = ClusterPlan::load(&plan_path)?;
    let candidates = plan.candidates();

    let store = config.store(dir);
    let mut registry = store.load();
    let disk_max = store.existing_max_number();
    tracing::info!(
        dir = %dir.display(),
        candidates = candidates.len(),
        persons = registry.len(),
        disk_max,
        lock_policy = ?store.lock_policy(),
        "matching cluster plan"
    );

    let matcher = SimilarityMatcher::new(config.matching);
    let report = matcher.assign(&mut registry, &candidates, disk_max);

    store
        .save(&mut registry)
        .with_context(|| format!("saving registry {}", store.path().display()))?;

    Ok(DirectoryReport {
        directory: dir.to_path_buf(),
        assignments: report.assignment_map(),
        created: report.created(),
        clusters: report.assignments,
        skipped: report.skipped,
        persons_total: registry.len(),
        processed_sources: plan.processed_sources(),
    })
}

/// Process each directory independently; one failure never stops the rest.
pub fn process_all(dirs: &[PathBuf], config: &Config) -> Vec<DirectoryOutcome> {
    dirs.iter()
        .map(|dir| match process_directory(dir, config) {
            Ok(report) => DirectoryOutcome::Ok(report),
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %format!("{e:#}"), "directory failed");
                DirectoryOutcome::Failed {
                    directory: dir.clone(),
                    error: format!("{e:#}"),
                }
            }
        })
        .collect()
}
