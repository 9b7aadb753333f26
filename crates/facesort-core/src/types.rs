use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema version written by this release. Version 1 is the unversioned
/// layout with singular `proto` vectors and short field names.
pub const REGISTRY_SCHEMA_VERSION: u32 = 2;

/// One known person in a target directory's registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    /// Stable identifier, also the name of the person's output folder.
    pub number: u32,
    /// Unit vectors, one per visually distinct pose. At most `k_max` entries.
    pub prototypes: Vec<Vec<f32>>,
    /// Exponentially weighted mean of every accepted observation (unit length).
    pub running_average: Option<Vec<f32>>,
    /// Accepted observations folded into this record so far.
    pub observation_count: u64,
    /// Per-person acceptance floor. Can only raise the global threshold.
    pub custom_threshold: Option<f32>,
}

impl PersonRecord {
    /// A freshly minted person seeded from one normalized centroid.
    pub fn seeded(number: u32, centroid: Vec<f32>) -> Self {
        Self {
            number,
            prototypes: vec![centroid.clone()],
            running_average: Some(centroid),
            observation_count: 1,
            custom_threshold: None,
        }
    }

    /// Vectors this person is scored against.
    ///
    /// Falls back to the running average when no prototypes are stored.
    pub fn signatures(&self) -> &[Vec<f32>] {
        if self.prototypes.is_empty() {
            self.running_average.as_slice()
        } else {
            &self.prototypes
        }
    }
}

/// The persisted set of persons for one target directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub version: u32,
    /// Stamped by the store on every successful save.
    pub updated_at: Option<DateTime<Utc>>,
    pub persons: Vec<PersonRecord>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_SCHEMA_VERSION,
            updated_at: None,
            persons: Vec::new(),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest person number in the registry, 0 when empty.
    pub fn max_number(&self) -> u32 {
        self.persons.iter().map(|p| p.number).max().unwrap_or(0)
    }

    pub fn get(&self, number: u32) -> Option<&PersonRecord> {
        self.persons.iter().find(|p| p.number == number)
    }

    pub fn get_mut(&mut self, number: u32) -> Option<&mut PersonRecord> {
        self.persons.iter_mut().find(|p| p.number == number)
    }

    /// True if at least one person has a vector to be scored against.
    pub fn has_signatures(&self) -> bool {
        self.persons.iter().any(|p| !p.signatures().is_empty())
    }

    /// Dimension of the stored vectors, taken from the first signature found.
    pub fn dimension(&self) -> Option<usize> {
        self.persons
            .iter()
            .flat_map(|p| p.signatures().first())
            .map(Vec::len)
            .next()
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }
}

/// Opaque cluster identifier from the cluster planner.
///
/// Planners emit either integers or strings; integers are kept in their
/// decimal form so `3` and `"3"` name the same cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for ClusterId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

/// One face cluster observed in the current batch.
#[derive(Debug, Clone)]
pub struct ClusterCandidate {
    pub id: ClusterId,
    /// Raw centroid, not yet normalized. `None` when the planner supplied
    /// no usable vector for this cluster.
    pub centroid: Option<Vec<f32>>,
    pub image_paths: Vec<String>,
}
