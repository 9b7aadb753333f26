//! Per-directory person registry on disk.
//!
//! The registry lives at `<dir>/person_index.json`. Reads are fail-open: a
//! missing or unparsable file yields an empty registry. Older layouts are
//! upgraded once at load time and written back. Writes go to a temporary
//! file that is fsynced and renamed over the target, under the advisory lock.

use crate::lock::{LockPolicy, RegistryLock};
use chrono::{DateTime, Utc};
use facesort_core::{PersonRecord, Registry, REGISTRY_SCHEMA_VERSION};
use serde::{Deserialize, Deserializer};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REGISTRY_FILE: &str = "person_index.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("could not lock {path}: {reason}")]
    LockUnavailable { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Registry file access for one target directory.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
    lock_policy: LockPolicy,
}

impl RegistryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn lock_policy(&self) -> LockPolicy {
        self.lock_policy
    }

    /// Full path of the registry file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    /// Load the registry, upgrading older layouts.
    ///
    /// Never fails: a missing file gives an empty registry, and so does one
    /// that cannot be read or parsed (logged as a warning). When migration
    /// had to default any field, the upgraded registry is written back on a
    /// best-effort basis.
    pub fn load(&self) -> Registry {
        let path = self.path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no registry yet; starting empty");
                return Registry::new();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "registry unreadable; starting empty");
                return Registry::new();
            }
        };

        let (mut registry, migrated) = match parse_registry(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "registry corrupt; starting empty");
                return Registry::new();
            }
        };

        if migrated {
            tracing::info!(
                path = %path.display(),
                persons = registry.len(),
                "registry migrated to schema v{REGISTRY_SCHEMA_VERSION}"
            );
            if let Err(e) = self.save(&mut registry) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write back migrated registry");
            }
        }

        tracing::debug!(path = %path.display(), persons = registry.len(), "registry loaded");
        registry
    }

    /// Persist the registry atomically.
    ///
    /// Stamps `updated_at` and the current schema version. The change is
    /// durable only once this returns `Ok`.
    pub fn save(&self, registry: &mut Registry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        let path = self.path();
        let _guard = self.lock(&path)?;

        registry.version = REGISTRY_SCHEMA_VERSION;
        registry.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(registry)?;
        write_atomic(&path, json.as_bytes())?;

        tracing::debug!(path = %path.display(), persons = registry.len(), "registry saved");
        Ok(())
    }

    fn lock(&self, path: &Path) -> Result<Option<RegistryLock>, StoreError> {
        let unavailable = |reason: String| -> Result<Option<RegistryLock>, StoreError> {
            match self.lock_policy {
                LockPolicy::Required => Err(StoreError::LockUnavailable {
                    path: RegistryLock::lock_path(path),
                    reason,
                }),
                LockPolicy::BestEffort => {
                    tracing::warn!(
                        path = %path.display(),
                        reason = %reason,
                        "writing registry without lock; concurrent writers may lose updates"
                    );
                    Ok(None)
                }
            }
        };

        match RegistryLock::acquire(path) {
            Ok(Some(guard)) => Ok(Some(guard)),
            Ok(None) => unavailable("advisory locking not supported on this platform".into()),
            Err(e) => unavailable(e.to_string()),
        }
    }

    /// Highest all-digit subdirectory name under the target directory, or 0.
    ///
    /// Seeds new person numbers so a folder re-created by hand never
    /// collides with a freshly minted person.
    pub fn existing_max_number(&self) -> u32 {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "cannot scan person folders");
                }
                return 0;
            }
        };

        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                    name.parse::<u32>().ok()
                } else {
                    None
                }
            })
            .max()
            .unwrap_or(0)
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(&tmp, e));
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

/// On-disk registry in any historical layout.
#[derive(Deserialize)]
struct RawRegistry {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    persons: Vec<RawPerson>,
}

/// On-disk person in any historical layout. Short names are the first
/// unversioned field names.
#[derive(Deserialize)]
struct RawPerson {
    number: u32,
    #[serde(default, alias = "protos")]
    prototypes: Option<Vec<Vec<f32>>>,
    #[serde(default, alias = "proto")]
    prototype: Option<Vec<f32>>,
    #[serde(default, alias = "ema", deserialize_with = "present")]
    running_average: Option<Option<Vec<f32>>>,
    #[serde(default, alias = "count")]
    observation_count: Option<u64>,
    #[serde(default, alias = "thr", deserialize_with = "present")]
    custom_threshold: Option<Option<f32>>,
}

/// Distinguishes an explicit `null` (`Some(None)`) from a missing key (`None`).
fn present<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

impl RawPerson {
    /// Upgrade to the current record shape. The flag reports whether any
    /// field had to be defaulted.
    fn migrate(self) -> (PersonRecord, bool) {
        let mut changed = false;

        let prototypes = match (self.prototypes, self.prototype) {
            (Some(list), _) => list,
            (None, Some(single)) => {
                changed = true;
                vec![single]
            }
            (None, None) => {
                changed = true;
                Vec::new()
            }
        };

        let running_average = self.running_average.unwrap_or_else(|| {
            changed = true;
            prototypes.first().cloned()
        });

        let observation_count = self.observation_count.unwrap_or_else(|| {
            changed = true;
            prototypes.len().max(1) as u64
        });

        let custom_threshold = self.custom_threshold.unwrap_or_else(|| {
            changed = true;
            None
        });

        let record = PersonRecord {
            number: self.number,
            prototypes,
            running_average,
            observation_count,
            custom_threshold,
        };
        (record, changed)
    }
}

/// Parse registry JSON in any supported layout. The flag is true when the
/// result differs from what was on disk and should be written back.
fn parse_registry(text: &str) -> Result<(Registry, bool), serde_json::Error> {
    let raw: RawRegistry = serde_json::from_str(text)?;
    let mut migrated = raw.version.map_or(true, |v| v < REGISTRY_SCHEMA_VERSION);

    let persons = raw
        .persons
        .into_iter()
        .map(|p| {
            let (record, changed) = p.migrate();
            migrated |= changed;
            record
        })
        .collect();

    let registry = Registry {
        version: REGISTRY_SCHEMA_VERSION,
        updated_at: raw.updated_at,
        persons,
    };
    Ok((registry, migrated))
}
