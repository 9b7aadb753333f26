//! Cluster plan produced by the upstream detection/clustering step.
//!
//! The plan is untrusted: ids may be integers or strings and need not be
//! contiguous, centroids may be missing or malformed, and any section may be
//! absent or `null`. Individual ids or image paths of the wrong type are
//! dropped with a warning instead of rejecting the whole plan.

use anyhow::{Context, Result};
use facesort_core::{ClusterCandidate, ClusterId};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct ClusterPlan {
    /// Clusters to assign, in processing order.
    #[serde(default, deserialize_with = "null_as_default")]
    pub eligible_clusters: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cluster_centroids: HashMap<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cluster_images: HashMap<String, Value>,
    /// Images with faces too small or few to cluster.
    #[serde(default, deserialize_with = "null_as_default")]
    pub group_only_images: Value,
    /// Images without usable faces.
    #[serde(default, deserialize_with = "null_as_default")]
    pub unknown_images: Value,
}

/// Integer ids of any width and strings are accepted; anything else is not
/// a cluster id.
fn cluster_id(value: &Value) -> Option<ClusterId> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(ClusterId::from(n.to_string())),
        Value::String(s) => Some(ClusterId::from(s.trim())),
        other => {
            tracing::warn!(value = %other, "ignoring eligible cluster with invalid id");
            None
        }
    }
}

/// Strings of a path list; other entries are dropped.
fn path_list(value: &Value, section: &str) -> Vec<String> {
    let items: &[Value] = match value {
        Value::Array(items) => items.as_slice(),
        Value::Null => &[],
        other => {
            tracing::warn!(section, value = %other, "ignoring image list that is not an array");
            &[]
        }
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            other => {
                tracing::warn!(section, value = %other, "ignoring non-string image path");
                None
            }
        })
        .collect()
}

fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

impl ClusterPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading cluster plan {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing cluster plan {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Eligible clusters as match candidates, in plan order.
    ///
    /// Repeated ids are dropped after their first occurrence. A centroid
    /// that is not an array of numbers becomes `None`.
    pub fn candidates(&self) -> Vec<ClusterCandidate> {
        let mut seen = HashSet::new();
        self.eligible_clusters
            .iter()
            .filter_map(cluster_id)
            .filter(|id| {
                let fresh = seen.insert(id.clone());
                if !fresh {
                    tracing::warn!(cluster = %id, "duplicate eligible cluster ignored");
                }
                fresh
            })
            .map(|id| ClusterCandidate {
                centroid: self.cluster_centroids.get(id.as_str()).and_then(parse_vector),
                image_paths: self
                    .cluster_images
                    .get(id.as_str())
                    .map(|v| path_list(v, id.as_str()))
                    .unwrap_or_default(),
                id,
            })
            .collect()
    }

    /// Every source image referenced by this plan.
    pub fn processed_sources(&self) -> BTreeSet<PathBuf> {
        self.cluster_images
            .iter()
            .flat_map(|(id, v)| path_list(v, id))
            .chain(path_list(&self.group_only_images, "group_only_images"))
            .chain(path_list(&self.unknown_images, "unknown_images"))
            .map(PathBuf::from)
            .collect()
    }
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|x| x.as_f64().map(|f| f as f32))
        .collect()
}
