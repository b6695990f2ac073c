use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::confidence::ConfidenceCalibrator;
use crate::config::EnsembleConfig;
use crate::context::GameContext;
use crate::error::{EnsembleError, PredictorFailure};
use crate::features::FeatureVector;
use crate::meta_learner::{MetaFeatures, MetaLearner};
use crate::model::{ModelResult, Predictor, Score};
use crate::weighting::{WeightMap, WeightingEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameType {
    TossUp,
    Close,
    Blowout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnsembleMethod {
    WeightedAverage,
    MetaLearner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub winner: String,
    /// Relative to `winner`, always in 0.5..=1.0.
    pub win_probability: f64,
    pub predicted_score: Score,
    pub confidence: f64,
    /// Confidence before the cross-validation remap. This is what the
    /// calibration curve is fit on once the game is graded.
    pub raw_confidence: f64,
    pub game_type: GameType,
    pub is_upset: bool,
    pub ensemble_method: EnsembleMethod,
    /// Sorted by model name.
    pub model_results: Vec<ModelResult>,
}

impl EnsembleResult {
    /// Probability the home side wins, whichever side was declared.
    pub fn home_win_probability(&self, home: &str) -> f64 {
        if self.winner == home {
            self.win_probability
        } else {
            1.0 - self.win_probability
        }
    }
}

/// Runs every predictor for one game and reconciles their answers.
pub struct Ensemble {
    predictors: Vec<Arc<dyn Predictor>>,
    weights: Arc<WeightingEngine>,
    meta_learner: Option<Arc<dyn MetaLearner>>,
    calibrator: ConfidenceCalibrator,
    config: EnsembleConfig,
}

impl Ensemble {
    pub fn new(
        predictors: Vec<Arc<dyn Predictor>>,
        weights: Arc<WeightingEngine>,
        calibrator: ConfidenceCalibrator,
        config: EnsembleConfig,
    ) -> Self {
        Self {
            predictors,
            weights,
            meta_learner: None,
            calibrator,
            config,
        }
    }

    pub fn with_meta_learner(mut self, meta_learner: Arc<dyn MetaLearner>) -> Self {
        self.meta_learner = Some(meta_learner);
        self
    }

    pub fn model_names(&self) -> Vec<String> {
        self.predictors.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn weights(&self) -> &Arc<WeightingEngine> {
        &self.weights
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// The method the next request would use. Re-evaluated per request.
    pub fn active_method(&self) -> EnsembleMethod {
        match &self.meta_learner {
            Some(m) if self.config.use_meta_learner && m.is_trained() => EnsembleMethod::MetaLearner,
            _ => EnsembleMethod::WeightedAverage,
        }
    }

    pub fn predict_game(
        &self,
        home: &FeatureVector,
        away: &FeatureVector,
    ) -> Result<EnsembleResult, EnsembleError> {
        let (results, failures) = self.run_predictors(home, away);
        if results.is_empty() {
            return Err(EnsembleError::AllModelsFailed { failures });
        }

        let weights = self.weights.adjust_for_context(home, away);
        let weights = self.weights.boost_for_data_richness(&weights, home, away);

        let mut outcome = match (self.active_method(), &self.meta_learner) {
            (EnsembleMethod::MetaLearner, Some(meta)) => {
                let ctx = GameContext::detect(home, away);
                match stack(results.clone(), &weights, meta.as_ref(), &ctx, home, away, &self.config) {
                    Ok(r) => r,
                    Err(err) => {
                        warn!(error = %err, "stacking failed, falling back to weighted average");
                        combine(results, &weights, home, away, &self.config)?
                    }
                }
            }
            _ => combine(results, &weights, home, away, &self.config)?,
        };

        let breakdown =
            self.calibrator
                .breakdown(outcome.raw_confidence, &outcome.model_results, home, away);
        outcome.raw_confidence = breakdown.combined;
        outcome.confidence = breakdown
            .value
            .clamp(self.config.min_confidence, self.config.max_confidence);

        info!(
            home = %home.team_code,
            away = %away.team_code,
            winner = %outcome.winner,
            probability = outcome.win_probability,
            confidence = outcome.confidence,
            score = %outcome.predicted_score,
            method = ?outcome.ensemble_method,
            models = outcome.model_results.len(),
            "ensemble prediction"
        );
        Ok(outcome)
    }

    /// Fans out to every predictor. Each result leaves carrying its static weight.
    fn run_predictors(
        &self,
        home: &FeatureVector,
        away: &FeatureVector,
    ) -> (Vec<ModelResult>, Vec<PredictorFailure>) {
        let outcomes: Vec<Result<ModelResult, PredictorFailure>> = self
            .predictors
            .par_iter()
            .map(|predictor| {
                let started = Instant::now();
                predictor
                    .predict(home, away)
                    .map(|mut r| {
                        if r.processing_time.is_zero() {
                            r.processing_time = started.elapsed();
                        }
                        r.weight = predictor.static_weight();
                        r
                    })
                    .map_err(|err| PredictorFailure {
                        model: predictor.name().to_string(),
                        reason: format!("{err:#}"),
                    })
            })
            .collect();

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(r) => results.push(r),
                Err(f) => {
                    warn!(model = %f.model, reason = %f.reason, "predictor failed");
                    failures.push(f);
                }
            }
        }
        results.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        (results, failures)
    }
}

/// Overwrites each result's weight from `weights`, keeping the weight it
/// already carries when the map has no entry for it.
fn assign_weights(results: &mut [ModelResult], weights: &WeightMap) {
    for r in results.iter_mut() {
        match weights.get(&r.model_name) {
            Some(w) => r.weight = w,
            None => debug!(model = %r.model_name, fallback = r.weight, "no dynamic weight, using static"),
        }
    }
}

/// Per-result share of the total weight. Uniform when the total is zero.
fn normalized_weights(results: &[ModelResult]) -> Vec<f64> {
    let total: f64 = results.iter().map(|r| r.weight.max(0.0)).sum();
    if total > 0.0 && total.is_finite() {
        results.iter().map(|r| r.weight.max(0.0) / total).collect()
    } else {
        vec![1.0 / results.len() as f64; results.len()]
    }
}

/// Weighted-average reduction. Confidence is left uncalibrated.
pub fn combine(
    mut results: Vec<ModelResult>,
    weights: &WeightMap,
    home: &FeatureVector,
    away: &FeatureVector,
    cfg: &EnsembleConfig,
) -> Result<EnsembleResult, EnsembleError> {
    if results.is_empty() {
        return Err(EnsembleError::AllModelsFailed { failures: Vec::new() });
    }
    results.sort_by(|a, b| a.model_name.cmp(&b.model_name));
    assign_weights(&mut results, weights);
    let shares = normalized_weights(&results);

    let mut home_bucket = 0.0;
    let mut away_bucket = 0.0;
    let mut raw_confidence = 0.0;
    let mut goals = (0.0, 0.0);
    let mut scored_share = 0.0;
    for (r, share) in results.iter().zip(&shares) {
        let boost = 1.0 + (r.confidence - 0.5) * cfg.confidence_boost_slope;
        let adjusted = share * boost;
        home_bucket += r.win_probability * adjusted;
        away_bucket += (1.0 - r.win_probability) * adjusted;
        raw_confidence += r.confidence * share;

        match r.score() {
            Ok(s) => {
                goals.0 += s.home as f64 * share;
                goals.1 += s.away as f64 * share;
                scored_share += share;
            }
            Err(err) => debug!(model = %r.model_name, error = %err, "unparseable score skipped"),
        }
    }

    let home_wins = home_bucket >= away_bucket;
    let bucket_total = home_bucket + away_bucket;
    let win_probability = if bucket_total > 0.0 {
        home_bucket.max(away_bucket) / bucket_total
    } else {
        0.5
    };

    let (predicted_score, goals) = if scored_share > 0.0 {
        let (h, a) = (goals.0 / scored_share, goals.1 / scored_share);
        (
            Score {
                home: h.round() as u32,
                away: a.round() as u32,
            },
            (h, a),
        )
    } else {
        let d = cfg.default_score;
        (d, (d.home as f64, d.away as f64))
    };

    let winner_fv = if home_wins { home } else { away };
    let loser_fv = if home_wins { away } else { home };

    Ok(EnsembleResult {
        winner: winner_fv.team_code.clone(),
        win_probability,
        predicted_score,
        confidence: raw_confidence.clamp(cfg.min_confidence, cfg.max_confidence),
        raw_confidence,
        game_type: classify(win_probability, (goals.0 - goals.1).abs(), cfg),
        is_upset: is_upset(winner_fv, loser_fv, cfg),
        ensemble_method: EnsembleMethod::WeightedAverage,
        model_results: results,
    })
}

/// Stacking reduction through a trained meta-learner.
pub fn stack(
    mut results: Vec<ModelResult>,
    weights: &WeightMap,
    meta: &dyn MetaLearner,
    ctx: &GameContext,
    home: &FeatureVector,
    away: &FeatureVector,
    cfg: &EnsembleConfig,
) -> Result<EnsembleResult, EnsembleError> {
    if results.is_empty() {
        return Err(EnsembleError::AllModelsFailed { failures: Vec::new() });
    }
    results.sort_by(|a, b| a.model_name.cmp(&b.model_name));
    assign_weights(&mut results, weights);

    let (features, unrecognized) = MetaFeatures::from_results(&results, ctx);
    if !unrecognized.is_empty() {
        debug!(models = ?unrecognized, "no stacking slot for these models");
    }
    let stacked = meta
        .predict(&features)
        .map_err(|err| EnsembleError::Stacking(format!("{err:#}")))?;
    if !(0.0..=1.0).contains(&stacked) {
        return Err(EnsembleError::Stacking(format!("probability {stacked} out of range")));
    }

    let n = results.len() as f64;
    let variance = results
        .iter()
        .map(|r| (r.win_probability - stacked).powi(2))
        .sum::<f64>()
        / n;
    let raw_confidence = (1.0 - (variance * cfg.stacking_variance_scale).min(cfg.stacking_variance_cap))
        .clamp(cfg.stacking_min_confidence, cfg.stacking_max_confidence);

    let home_wins = stacked >= 0.5;
    let scores: Vec<Score> = results.iter().filter_map(|r| r.score().ok()).collect();
    let (predicted_score, margin) = if scores.is_empty() {
        let d = cfg.default_score;
        (d, d.margin().unsigned_abs() as f64)
    } else {
        let k = scores.len() as f64;
        let h = scores.iter().map(|s| s.home as f64).sum::<f64>() / k;
        let a = scores.iter().map(|s| s.away as f64).sum::<f64>() / k;
        let mut score = Score {
            home: h.round() as u32,
            away: a.round() as u32,
        };
        if home_wins && score.home <= score.away {
            score.home = score.away + 1;
        } else if !home_wins && score.away <= score.home {
            score.away = score.home + 1;
        }
        (score, (h - a).abs())
    };

    let win_probability = if home_wins { stacked } else { 1.0 - stacked };
    let winner_fv = if home_wins { home } else { away };
    let loser_fv = if home_wins { away } else { home };

    Ok(EnsembleResult {
        winner: winner_fv.team_code.clone(),
        win_probability,
        predicted_score,
        confidence: raw_confidence,
        raw_confidence,
        game_type: classify(win_probability, margin, cfg),
        is_upset: is_upset(winner_fv, loser_fv, cfg),
        ensemble_method: EnsembleMethod::MetaLearner,
        model_results: results,
    })
}

fn classify(win_probability: f64, goal_margin: f64, cfg: &EnsembleConfig) -> GameType {
    let edge = (win_probability - 0.5).abs();
    if edge < cfg.toss_up_margin || goal_margin <= cfg.toss_up_score_margin {
        GameType::TossUp
    } else if edge > cfg.blowout_margin || goal_margin > cfg.blowout_score_margin {
        GameType::Blowout
    } else {
        GameType::Close
    }
}

fn is_upset(winner: &FeatureVector, loser: &FeatureVector, cfg: &EnsembleConfig) -> bool {
    winner.win_percentage < loser.win_percentage - cfg.upset_gap
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sides() -> (FeatureVector, FeatureVector) {
        let mut home = FeatureVector::new("BOS");
        home.win_percentage = 0.6;
        let mut away = FeatureVector::new("NYR");
        away.win_percentage = 0.55;
        (home, away)
    }

    fn result(name: &str, p: f64, conf: f64, score: &str) -> ModelResult {
        ModelResult {
            predicted_score: score.to_string(),
            ..ModelResult::new(name, p, conf, Score { home: 0, away: 0 })
        }
    }

    fn equal(names: &[&str]) -> WeightMap {
        WeightMap::normalized(names.iter().map(|n| (n.to_string(), 1.0)))
    }

    #[test]
    fn two_home_leaning_models_average_between_them() {
        let (home, away) = sides();
        let cfg = EnsembleConfig::default();
        let results = vec![result("a", 0.70, 0.5, "4-2"), result("b", 0.60, 0.5, "3-2")];
        let r = combine(results, &equal(&["a", "b"]), &home, &away, &cfg).unwrap();
        assert_eq!(r.winner, "BOS");
        assert!(r.win_probability > 0.60 && r.win_probability < 0.70);
        assert!((r.win_probability - 0.65).abs() < 1e-12);
        assert_eq!(r.ensemble_method, EnsembleMethod::WeightedAverage);
    }

    #[test]
    fn even_probabilities_are_a_toss_up_for_home() {
        let (home, away) = sides();
        let cfg = EnsembleConfig::default();
        let results = vec![result("a", 0.5, 0.6, "5-1"), result("b", 0.5, 0.4, "6-0")];
        let r = combine(results, &equal(&["a", "b"]), &home, &away, &cfg).unwrap();
        assert_eq!(r.winner, "BOS");
        assert_eq!(r.win_probability, 0.5);
        assert_eq!(r.game_type, GameType::TossUp);
    }

    #[test]
    fn away_favourite_flips_the_winner_and_flags_upsets() {
        let (mut home, away) = sides();
        home.win_percentage = 0.7;
        let cfg = EnsembleConfig::default();
        let results = vec![result("a", 0.2, 0.8, "1-4"), result("b", 0.25, 0.7, "2-5")];
        let r = combine(results, &equal(&["a", "b"]), &home, &away, &cfg).unwrap();
        assert_eq!(r.winner, "NYR");
        assert!(r.win_probability > 0.75);
        assert!(r.is_upset);
        assert_eq!(r.game_type, GameType::Blowout);
        assert_eq!(r.predicted_score, Score { home: 2, away: 5 });
    }

    #[test]
    fn unparseable_scores_drop_out_of_the_score_only() {
        let (home, away) = sides();
        let cfg = EnsembleConfig::default();
        let results = vec![result("a", 0.7, 0.6, "garbage"), result("b", 0.6, 0.6, "4-1")];
        let r = combine(results, &equal(&["a", "b"]), &home, &away, &cfg).unwrap();
        assert_eq!(r.predicted_score, Score { home: 4, away: 1 });
        assert!((r.win_probability - 0.65).abs() < 1e-12);

        let none = vec![result("a", 0.7, 0.6, "")];
        let r = combine(none, &equal(&["a"]), &home, &away, &cfg).unwrap();
        assert_eq!(r.predicted_score, cfg.default_score);
    }

    #[test]
    fn missing_weight_keeps_the_carried_weight() {
        let (home, away) = sides();
        let cfg = EnsembleConfig::default();
        let mut a = result("a", 0.9, 0.5, "3-1");
        a.weight = 0.0;
        let mut b = result("b", 0.4, 0.5, "2-3");
        b.weight = 0.3;
        let weights = WeightMap::normalized([("a".to_string(), 0.0), ("c".to_string(), 1.0)]);
        let r = combine(vec![a, b], &weights, &home, &away, &cfg).unwrap();
        // only b has weight
        assert_eq!(r.winner, "NYR");
        assert!((r.win_probability - 0.6).abs() < 1e-12);
        assert_eq!(r.model_results[1].weight, 0.3);
    }

    #[test]
    fn empty_input_is_all_models_failed() {
        let (home, away) = sides();
        let err = combine(Vec::new(), &WeightMap::default(), &home, &away, &EnsembleConfig::default()).unwrap_err();
        assert!(matches!(err, EnsembleError::AllModelsFailed { .. }));
    }

    struct Fixed(f64);

    impl MetaLearner for Fixed {
        fn is_trained(&self) -> bool {
            true
        }

        fn predict(&self, _features: &MetaFeatures) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    #[test]
    fn stacking_reexpresses_probability_for_the_winner() {
        let (home, away) = sides();
        let cfg = EnsembleConfig::default();
        let ctx = GameContext::detect(&home, &away);
        let results = vec![
            result("Elo Rating", 0.45, 0.6, "3-3"),
            result("LSTM", 0.35, 0.6, "2-3"),
        ];
        let r = stack(results, &WeightMap::default(), &Fixed(0.4), &ctx, &home, &away, &cfg).unwrap();
        assert_eq!(r.winner, "NYR");
        assert!((r.win_probability - 0.6).abs() < 1e-12);
        assert_eq!(r.ensemble_method, EnsembleMethod::MetaLearner);
        // average 2.5-3 rounds to 3-3, nudged toward the away side
        assert_eq!(r.predicted_score, Score { home: 3, away: 4 });
        // variance 0.0025 -> 1 - 0.005
        assert!((r.raw_confidence - 0.995_f64.min(0.95)).abs() < 1e-12);
    }

    #[test]
    fn stacking_confidence_falls_with_disagreement() {
        let (home, away) = sides();
        let cfg = EnsembleConfig::default();
        let ctx = GameContext::default();
        let results = vec![result("Elo Rating", 0.05, 0.6, "1-5"), result("LSTM", 0.1, 0.6, "1-4")];
        let r = stack(results, &WeightMap::default(), &Fixed(0.9), &ctx, &home, &away, &cfg).unwrap();
        assert_eq!(r.raw_confidence, 0.40);
    }

    #[test]
    fn out_of_range_stacked_probability_is_a_stacking_error() {
        let (home, away) = sides();
        let results = vec![result("Elo Rating", 0.6, 0.6, "3-2")];
        let err = stack(
            results,
            &WeightMap::default(),
            &Fixed(f64::NAN),
            &GameContext::default(),
            &home,
            &away,
            &EnsembleConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EnsembleError::Stacking(_)));
    }
}
