use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{EnsembleConfig, WeightConstraints};
use crate::context::{self, GameContext};
use crate::features::FeatureVector;
use crate::model::{ModelFamily, Predictor};

/// Model name to share of the ensemble. Always sums to one when non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightMap(BTreeMap<String, f64>);

impl WeightMap {
    /// Builds a map from raw weights, dropping negative or non-finite
    /// entries to zero and renormalizing. A zero total becomes uniform.
    pub fn normalized(entries: impl IntoIterator<Item = (String, f64)>) -> Self {
        let mut map: BTreeMap<String, f64> = entries
            .into_iter()
            .map(|(k, v)| (k, if v.is_finite() && v > 0.0 { v } else { 0.0 }))
            .collect();
        let total: f64 = map.values().sum();
        if map.is_empty() {
            return Self(map);
        }
        if total <= 0.0 {
            let even = 1.0 / map.len() as f64;
            map.values_mut().for_each(|v| *v = even);
        } else {
            map.values_mut().for_each(|v| *v /= total);
        }
        Self(map)
    }

    pub fn from_predictors(predictors: &[Arc<dyn Predictor>]) -> Self {
        Self::normalized(
            predictors
                .iter()
                .map(|p| (p.name().to_string(), p.static_weight())),
        )
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }
}

/// Shifts weight toward models that consume per-player data when both sides
/// carry it. Pure; the output always sums to one.
pub fn boost_for_data_richness(
    weights: &WeightMap,
    home: &FeatureVector,
    away: &FeatureVector,
    cfg: &EnsembleConfig,
) -> WeightMap {
    if !(home.has_player_signals() && away.has_player_signals()) {
        return weights.clone();
    }
    debug!("player-level signals present on both sides, boosting rich-feature models");
    WeightMap::normalized(weights.iter().map(|(name, w)| {
        let factor = match ModelFamily::from_name(name) {
            ModelFamily::NeuralNetwork => cfg.richness_boost_neural,
            ModelFamily::Statistical => cfg.richness_boost_statistical,
            ModelFamily::GradientBoosting => cfg.richness_boost_gradient,
            ModelFamily::Bayesian | ModelFamily::MonteCarlo => cfg.richness_damp_simple,
            _ => 1.0,
        };
        (name.clone(), w * factor)
    }))
}

#[derive(Debug, Clone, Copy)]
struct OutcomeMark {
    correct: bool,
    confidence: f64,
}

/// Rolling outcome history for one model. Newest entries are at the back.
#[derive(Debug, Clone, Default)]
pub struct PerformanceTracker {
    history: VecDeque<OutcomeMark>,
}

impl PerformanceTracker {
    pub fn push(&mut self, correct: bool, confidence: f64, limit: usize) {
        self.history.push_back(OutcomeMark {
            correct,
            confidence: confidence.clamp(0.0, 1.0),
        });
        while self.history.len() > limit.max(1) {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Recency-weighted, calibration-adjusted accuracy times a trend factor.
    pub fn score(&self, c: &WeightConstraints) -> f64 {
        if self.history.len() < c.min_sample_size {
            return 1.0;
        }
        let mut score = 0.0;
        let mut weight_sum = 0.0;
        for (pos, mark) in self.history.iter().rev().enumerate() {
            let w = c.recency_decay.powi(pos as i32);
            let hit = if mark.correct { 1.0 } else { 0.0 };
            let calibration = 1.0 - (mark.confidence - hit).abs();
            score += hit * calibration * w;
            weight_sum += w;
        }
        if weight_sum <= 0.0 {
            return 1.0;
        }
        let velocity_adj = 1.0 + self.velocity() * 0.1;
        (score / weight_sum * velocity_adj).max(0.1)
    }

    /// Recent-half accuracy minus older-half accuracy, capped at +-0.5.
    pub fn velocity(&self) -> f64 {
        if self.history.len() < 10 {
            return 0.0;
        }
        let mid = self.history.len() / 2;
        let older = window_accuracy(self.history.iter().take(mid));
        let recent = window_accuracy(self.history.iter().skip(mid));
        (recent - older).clamp(-0.5, 0.5)
    }
}

fn window_accuracy<'a>(marks: impl Iterator<Item = &'a OutcomeMark>) -> f64 {
    let (hits, n) = marks.fold((0usize, 0usize), |(h, n), m| (h + m.correct as usize, n + 1));
    if n == 0 { 0.0 } else { hits as f64 / n as f64 }
}

/// Holds the live weight snapshot plus the accuracy feedback that moves it.
///
/// Readers clone an `Arc` to the current map; every update builds a fresh
/// map and swaps the pointer, so a request never sees a half-written map.
pub struct WeightingEngine {
    snapshot: RwLock<Arc<WeightMap>>,
    baseline: WeightMap,
    trackers: Mutex<BTreeMap<String, PerformanceTracker>>,
    constraints: WeightConstraints,
    config: EnsembleConfig,
}

impl WeightingEngine {
    pub fn new(baseline: WeightMap, constraints: WeightConstraints, config: EnsembleConfig) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(baseline.clone())),
            baseline,
            trackers: Mutex::new(BTreeMap::new()),
            constraints,
            config,
        }
    }

    pub fn for_predictors(
        predictors: &[Arc<dyn Predictor>],
        constraints: WeightConstraints,
        config: EnsembleConfig,
    ) -> Self {
        Self::new(WeightMap::from_predictors(predictors), constraints, config)
    }

    pub fn current_weights(&self) -> Arc<WeightMap> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn baseline(&self) -> &WeightMap {
        &self.baseline
    }

    /// Replaces the live snapshot wholesale.
    pub fn publish(&self, weights: WeightMap) {
        let weights = WeightMap::normalized(weights.0);
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(weights);
    }

    /// Adds externally computed deltas to the current snapshot.
    pub fn apply_deltas(&self, deltas: &BTreeMap<String, f64>) -> Arc<WeightMap> {
        let current = self.current_weights();
        let mut raw = current.0.clone();
        for (name, delta) in deltas {
            let entry = raw.entry(name.clone()).or_insert(0.0);
            *entry = (*entry + delta).max(0.0);
        }
        let next = Arc::new(WeightMap::normalized(raw));
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&next);
        next
    }

    /// Per-request weights for this matchup. Does not touch the snapshot.
    pub fn adjust_for_context(&self, home: &FeatureVector, away: &FeatureVector) -> WeightMap {
        let ctx = GameContext::detect(home, away);
        let kinds = ctx.kinds();
        if !kinds.is_empty() {
            let labels: Vec<&str> = kinds.iter().map(|k| k.label()).collect();
            debug!(contexts = ?labels, "game context detected");
        }
        let current = self.current_weights();
        context::adjust_for_context(&current, &ctx, self.config.context_cap)
    }

    pub fn boost_for_data_richness(
        &self,
        weights: &WeightMap,
        home: &FeatureVector,
        away: &FeatureVector,
    ) -> WeightMap {
        boost_for_data_richness(weights, home, away, &self.config)
    }

    pub fn record_performance(&self, model: &str, correct: bool, confidence: f64) {
        let mut trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        trackers
            .entry(model.to_string())
            .or_default()
            .push(correct, confidence, self.constraints.history_len);
    }

    pub fn performance_scores(&self) -> BTreeMap<String, f64> {
        let trackers = self.trackers.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current_weights();
        current
            .iter()
            .map(|(name, _)| {
                let score = trackers
                    .get(name)
                    .map(|t| t.score(&self.constraints))
                    .unwrap_or(1.0);
                (name.clone(), score)
            })
            .collect()
    }

    /// Turns tracked performance into a new snapshot and publishes it.
    pub fn rebalance(&self) -> Arc<WeightMap> {
        let scores = self.performance_scores();
        let current = self.current_weights();
        let next = Arc::new(constrain(&current, &scores, &self.constraints));
        info!(models = next.len(), "weights rebalanced from accuracy feedback");
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&next);
        next
    }
}

fn constrain(current: &WeightMap, scores: &BTreeMap<String, f64>, c: &WeightConstraints) -> WeightMap {
    let proposed = WeightMap::normalized(scores.iter().map(|(k, v)| (k.clone(), *v)));
    let adjusted = proposed.iter().map(|(name, w)| {
        let old = current.get(name).unwrap_or(*w);
        let bounded = w.clamp(c.min_weight, c.max_weight);
        let shifted = bounded.clamp(old - c.max_shift_per_update, old + c.max_shift_per_update);
        let smoothed = c.smoothing * shifted + (1.0 - c.smoothing) * old;
        (name.clone(), smoothed)
    });
    WeightMap::normalized(adjusted)
}
