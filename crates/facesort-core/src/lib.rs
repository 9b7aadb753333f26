//! facesort-core — Incremental identity matching for face clusters.
//!
//! Matches cluster centroids against a registry of known persons using
//! best-prototype cosine similarity with a top-2 margin, and maintains each
//! person's bounded, diversity-preserving prototype set.

pub mod config;
pub mod matcher;
pub mod prototypes;
pub mod types;
pub mod vector;

pub use config::MatchConfig;
pub use matcher::{Assignment, MatchOutcome, MatchReport, SimilarityMatcher};
pub use types::{ClusterCandidate, ClusterId, PersonRecord, Registry, REGISTRY_SCHEMA_VERSION};
