use anyhow::{Context, Result};
use facesort_core::MatchConfig;
use facesort_store::{LockPolicy, RegistryStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default name of the cluster plan file inside each target directory.
pub const DEFAULT_PLAN_FILE: &str = "cluster_plan.json";

/// CLI configuration: built-in defaults, then the TOML file, then
/// `FACESORT_*` environment variables. Command-line flags are applied last
/// by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster plan file name, relative to each target directory.
    pub plan_file: String,
    /// Behavior when the registry write lock cannot be taken.
    pub lock_policy: LockPolicy,
    pub matching: MatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plan_file: DEFAULT_PLAN_FILE.to_string(),
            lock_policy: LockPolicy::default(),
            matching: MatchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when it
    /// exists, then apply environment overrides.
    ///
    /// An explicitly named file must exist. A file that fails to parse is
    /// an error either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(p) => Self::from_file(&p)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.matching = config.matching.clamped();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Override fields from `FACESORT_*` variables resolved by `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let m = &mut self.matching;
        m.match_threshold = env_f32(&lookup, "FACESORT_MATCH_THRESHOLD", m.match_threshold);
        m.top2_margin = env_f32(&lookup, "FACESORT_TOP2_MARGIN", m.top2_margin);
        m.k_max = env_usize(&lookup, "FACESORT_K_MAX", m.k_max);
        m.ema_alpha = env_f32(&lookup, "FACESORT_EMA_ALPHA", m.ema_alpha);

        if let Some(v) = lookup("FACESORT_PLAN_FILE") {
            self.plan_file = v;
        }
        if let Some(v) = lookup("FACESORT_LOCK_POLICY") {
            match v.parse() {
                Ok(policy) => self.lock_policy = policy,
                Err(e) => tracing::warn!(error = %e, "ignoring FACESORT_LOCK_POLICY"),
            }
        }
    }

    /// Registry store for `dir` under the configured lock policy.
    pub fn store(&self, dir: &Path) -> RegistryStore {
        RegistryStore::new(dir).with_lock_policy(self.lock_policy)
    }

    /// Apply command-line overrides and re-clamp.
    pub fn with_overrides(mut self, threshold: Option<f32>, margin: Option<f32>) -> Self {
        if let Some(t) = threshold {
            self.matching.match_threshold = t;
        }
        if let Some(m) = margin {
            self.matching.top2_margin = m;
        }
        self.matching = self.matching.clamped();
        self
    }
}

/// `$XDG_CONFIG_HOME/facesort/config.toml`, falling back to `~/.config`.
fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(base.join("facesort").join("config.toml"))
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
