use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Score;

/// Tunable constants for combination and confidence calibration.
///
/// The defaults are the empirically tuned values the ensemble has always
/// shipped with. None of them has a derivation; treat them as candidates for
/// recalibration against recorded outcomes rather than as ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Prefer the stacking model when it reports itself trained.
    pub use_meta_learner: bool,

    /// `1 + (confidence - 0.5) * slope` scales each model's weight.
    pub confidence_boost_slope: f64,

    /// Agreement bonus reaches zero once the probability span hits this value.
    pub agreement_span: f64,
    pub agreement_max_bonus: f64,

    /// Average processing time at which the latency factor would reach zero.
    pub latency_reference_ms: f64,
    pub latency_floor: f64,

    /// Largest relative move any single game context may apply to a weight.
    pub context_cap: f64,

    pub richness_boost_neural: f64,
    pub richness_boost_statistical: f64,
    pub richness_boost_gradient: f64,
    pub richness_damp_simple: f64,

    pub toss_up_margin: f64,
    pub toss_up_score_margin: f64,
    pub blowout_margin: f64,
    pub blowout_score_margin: f64,

    /// Winner must trail the loser's win percentage by more than this to count as an upset.
    pub upset_gap: f64,

    pub default_score: Score,

    pub stacking_variance_scale: f64,
    pub stacking_variance_cap: f64,
    pub stacking_min_confidence: f64,
    pub stacking_max_confidence: f64,

    pub min_confidence: f64,
    pub max_confidence: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            use_meta_learner: true,
            confidence_boost_slope: 0.4,
            agreement_span: 0.3,
            agreement_max_bonus: 0.2,
            latency_reference_ms: 5000.0,
            latency_floor: 0.8,
            context_cap: 0.20,
            richness_boost_neural: 1.15,
            richness_boost_statistical: 1.10,
            richness_boost_gradient: 1.12,
            richness_damp_simple: 0.95,
            toss_up_margin: 0.10,
            toss_up_score_margin: 1.0,
            blowout_margin: 0.25,
            blowout_score_margin: 2.5,
            upset_gap: 0.10,
            default_score: Score { home: 3, away: 2 },
            stacking_variance_scale: 2.0,
            stacking_variance_cap: 0.6,
            stacking_min_confidence: 0.40,
            stacking_max_confidence: 0.95,
            min_confidence: 0.1,
            max_confidence: 1.0,
        }
    }
}

impl EnsembleConfig {
    /// Defaults overlaid with any `ENSEMBLE_*` environment overrides.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            use_meta_learner: env_bool("ENSEMBLE_USE_META_LEARNER", d.use_meta_learner),
            confidence_boost_slope: env_f64("ENSEMBLE_CONFIDENCE_BOOST_SLOPE", d.confidence_boost_slope)
                .clamp(0.0, 2.0),
            agreement_span: env_f64("ENSEMBLE_AGREEMENT_SPAN", d.agreement_span).clamp(0.01, 1.0),
            agreement_max_bonus: env_f64("ENSEMBLE_AGREEMENT_MAX_BONUS", d.agreement_max_bonus)
                .clamp(0.0, 0.5),
            latency_reference_ms: env_f64("ENSEMBLE_LATENCY_REFERENCE_MS", d.latency_reference_ms)
                .max(1.0),
            latency_floor: env_f64("ENSEMBLE_LATENCY_FLOOR", d.latency_floor).clamp(0.0, 1.0),
            context_cap: env_f64("ENSEMBLE_CONTEXT_CAP", d.context_cap).clamp(0.0, 1.0),
            ..d
        }
    }
}

/// Limits applied whenever accuracy feedback rebalances the weight map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightConstraints {
    pub min_weight: f64,
    pub max_weight: f64,
    pub max_shift_per_update: f64,
    /// Records a model needs before its score departs from neutral.
    pub min_sample_size: usize,
    /// Share of the freshly computed weight kept by exponential smoothing.
    pub smoothing: f64,
    /// Per-position decay applied to older outcome records.
    pub recency_decay: f64,
    pub history_len: usize,
}

impl Default for WeightConstraints {
    fn default() -> Self {
        Self {
            min_weight: 0.02,
            max_weight: 0.60,
            max_shift_per_update: 0.03,
            min_sample_size: 15,
            smoothing: 0.3,
            recency_decay: 0.95,
            history_len: 100,
        }
    }
}

impl WeightConstraints {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_weight: env_f64("ENSEMBLE_MIN_WEIGHT", d.min_weight).clamp(0.0, 0.5),
            max_weight: env_f64("ENSEMBLE_MAX_WEIGHT", d.max_weight).clamp(0.1, 1.0),
            max_shift_per_update: env_f64("ENSEMBLE_MAX_WEIGHT_SHIFT", d.max_shift_per_update)
                .clamp(0.001, 1.0),
            min_sample_size: env_parse("ENSEMBLE_MIN_SAMPLE_SIZE", d.min_sample_size).clamp(1, 1000),
            ..d
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossValidationSettings {
    pub k_folds: usize,
    pub min_history: usize,
    pub window: Duration,
    /// Split folds by game date instead of shuffling.
    pub temporal: bool,
    pub calibration_bins: usize,
    pub update_frequency: Duration,
}

impl Default for CrossValidationSettings {
    fn default() -> Self {
        Self {
            k_folds: 5,
            min_history: 50,
            window: Duration::from_secs(365 * 24 * 3600),
            temporal: true,
            calibration_bins: 10,
            update_frequency: Duration::from_secs(24 * 3600),
        }
    }
}

impl CrossValidationSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            k_folds: env_parse("CV_K_FOLDS", d.k_folds).clamp(2, 20),
            min_history: env_parse("CV_MIN_HISTORY", d.min_history).clamp(5, 100_000),
            calibration_bins: env_parse("CV_CALIBRATION_BINS", d.calibration_bins).clamp(2, 50),
            update_frequency: Duration::from_secs(
                env_parse("CV_UPDATE_SECS", d.update_frequency.as_secs()).max(60),
            ),
            ..d
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    let v = env_parse(key, default);
    if v.is_finite() { v } else { default }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key).map(|v| v.trim().to_ascii_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_constants() {
        let cfg = EnsembleConfig::default();
        assert_eq!(cfg.confidence_boost_slope, 0.4);
        assert_eq!(cfg.latency_reference_ms, 5000.0);
        assert_eq!(cfg.default_score, Score { home: 3, away: 2 });
        let cv = CrossValidationSettings::default();
        assert_eq!(cv.k_folds, 5);
        assert_eq!(cv.min_history, 50);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        assert_eq!(env_parse("ENSEMBLE_TEST_UNSET_KEY_XYZ", 7usize), 7);
        assert!(env_bool("ENSEMBLE_TEST_UNSET_KEY_XYZ", true));
    }
}
