use serde::{Deserialize, Serialize};

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.52;
pub const DEFAULT_TOP2_MARGIN: f32 = 0.08;
pub const DEFAULT_K_MAX: usize = 5;
pub const DEFAULT_EMA_ALPHA: f32 = 0.9;

/// Upper bound on stored prototypes per person.
pub const MAX_K_MAX: usize = 64;

/// Tuning for one matching pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Global cosine similarity required to accept a match (0–1).
    pub match_threshold: f32,
    /// Minimum gap between the best and second-best person scores (0–1).
    pub top2_margin: f32,
    /// Maximum prototypes kept per person.
    pub k_max: usize,
    /// Weight of the previous running average in each EMA update.
    pub ema_alpha: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            top2_margin: DEFAULT_TOP2_MARGIN,
            k_max: DEFAULT_K_MAX,
            ema_alpha: DEFAULT_EMA_ALPHA,
        }
    }
}

impl MatchConfig {
    /// Clamp every field into its valid range. Non-finite floats revert to
    /// their defaults.
    pub fn clamped(self) -> Self {
        Self {
            match_threshold: clamp_f32(self.match_threshold, 0.0, 1.0, DEFAULT_MATCH_THRESHOLD),
            top2_margin: clamp_f32(self.top2_margin, 0.0, 1.0, DEFAULT_TOP2_MARGIN),
            k_max: self.k_max.clamp(1, MAX_K_MAX),
            ema_alpha: clamp_f32(self.ema_alpha, 0.0, 1.0, DEFAULT_EMA_ALPHA),
        }
    }
}

/// Clamp `v` into `[lo, hi]`, or return `default` when `v` is not finite.
pub fn clamp_f32(v: f32, lo: f32, hi: f32, default: f32) -> f32 {
    if v.is_finite() {
        v.clamp(lo, hi)
    } else {
        default
    }
}
