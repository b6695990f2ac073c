use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::accuracy::{AccuracyRecord, AccuracyTracker};
use crate::context::GameContext;
use crate::cross_validation::{CrossValidation, HistoricalPrediction, RefitWorker};
use crate::ensemble::EnsembleResult;
use crate::error::EnsembleError;
use crate::features::FeatureVector;
use crate::meta_learner::{LogisticStacker, MetaFeatures, TrainingExample};
use crate::model::Score;
use crate::weighting::WeightingEngine;

/// Rebalance the live weights after this many graded games.
const REBALANCE_EVERY: usize = 10;

/// Feeds finished games back into every learner the ensemble owns.
pub struct OutcomeRecorder {
    accuracy: Arc<dyn AccuracyTracker>,
    cross_validation: Arc<dyn CrossValidation>,
    weights: Arc<WeightingEngine>,
    stacker: Option<Arc<LogisticStacker>>,
    refit: RefitWorker,
    model_names: Vec<String>,
    graded: AtomicUsize,
}

impl OutcomeRecorder {
    pub fn new(
        accuracy: Arc<dyn AccuracyTracker>,
        cross_validation: Arc<dyn CrossValidation>,
        weights: Arc<WeightingEngine>,
        model_names: Vec<String>,
    ) -> Self {
        Self {
            refit: RefitWorker::new(Arc::clone(&cross_validation)),
            accuracy,
            cross_validation,
            weights,
            stacker: None,
            model_names,
            graded: AtomicUsize::new(0),
        }
    }

    pub fn with_stacker(mut self, stacker: Arc<LogisticStacker>) -> Self {
        self.stacker = Some(stacker);
        self
    }

    /// Logs the real result for every registered model, without a prediction to grade.
    pub fn record_outcome(
        &self,
        home_team: &str,
        away_team: &str,
        date: NaiveDate,
        actual_winner: &str,
        actual_score: Score,
    ) -> Result<(), EnsembleError> {
        for model in &self.model_names {
            let record = AccuracyRecord {
                home_team: home_team.to_string(),
                away_team: away_team.to_string(),
                date,
                predicted_winner: None,
                win_probability: None,
                confidence: None,
                predicted_score: None,
                actual_winner: actual_winner.to_string(),
                actual_score,
            };
            if let Err(err) = self.accuracy.record_outcome(model, record) {
                warn!(model = %model, error = %err, "failed to record outcome");
            }
        }
        Ok(())
    }

    /// Grades a finished game without side context; stacking examples get a neutral context.
    pub fn record_historical_prediction(
        &self,
        home_team: &str,
        away_team: &str,
        date: NaiveDate,
        prediction: &EnsembleResult,
        actual_winner: &str,
        actual_score: Score,
    ) -> Result<(), EnsembleError> {
        self.grade(
            home_team,
            away_team,
            date,
            prediction,
            actual_winner,
            actual_score,
            &GameContext::default(),
        )
    }

    /// Same as `record_historical_prediction`, with the game context rebuilt from both sides.
    pub fn record_game(
        &self,
        home: &FeatureVector,
        away: &FeatureVector,
        date: NaiveDate,
        prediction: &EnsembleResult,
        actual_winner: &str,
        actual_score: Score,
    ) -> Result<(), EnsembleError> {
        let ctx = GameContext::detect(home, away);
        self.grade(
            &home.team_code,
            &away.team_code,
            date,
            prediction,
            actual_winner,
            actual_score,
            &ctx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn grade(
        &self,
        home_team: &str,
        away_team: &str,
        date: NaiveDate,
        prediction: &EnsembleResult,
        actual_winner: &str,
        actual_score: Score,
        ctx: &GameContext,
    ) -> Result<(), EnsembleError> {
        self.cross_validation.add_historical_prediction(HistoricalPrediction {
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
            date,
            predicted_winner: prediction.winner.clone(),
            win_probability: prediction.win_probability,
            raw_confidence: prediction.raw_confidence,
            predicted_score: prediction.predicted_score,
            actual_winner: actual_winner.to_string(),
            actual_score,
            model_results: prediction.model_results.clone(),
        });

        for r in &prediction.model_results {
            let home_pick = r.win_probability >= 0.5;
            let (winner, p) = if home_pick {
                (home_team, r.win_probability)
            } else {
                (away_team, 1.0 - r.win_probability)
            };
            let record = AccuracyRecord {
                home_team: home_team.to_string(),
                away_team: away_team.to_string(),
                date,
                predicted_winner: Some(winner.to_string()),
                win_probability: Some(p),
                confidence: Some(r.confidence),
                predicted_score: r.score().ok(),
                actual_winner: actual_winner.to_string(),
                actual_score,
            };
            if let Err(err) = self.accuracy.record_outcome(&r.model_name, record) {
                warn!(model = %r.model_name, error = %err, "failed to record outcome");
            }
            self.weights
                .record_performance(&r.model_name, winner == actual_winner, r.confidence);
        }

        let graded = self.graded.fetch_add(1, Ordering::SeqCst) + 1;
        if graded % REBALANCE_EVERY == 0 {
            self.weights.rebalance();
        }

        if let Some(stacker) = &self.stacker {
            let (features, _) = MetaFeatures::from_results(&prediction.model_results, ctx);
            stacker.record_example(TrainingExample {
                features,
                home_won: actual_winner == home_team,
            });
            match stacker.auto_train() {
                Some(Ok(report)) => info!(
                    examples = report.examples,
                    val_accuracy = report.val_accuracy,
                    "stacker retrained"
                ),
                Some(Err(err)) => warn!(error = %err, "stacker retrain failed"),
                None => {}
            }
        }

        if self.refit.trigger_if_due() {
            debug!(graded, "cross-validation refit started");
        }
        Ok(())
    }

    /// Waits for any in-flight refit to finish.
    pub fn wait_for_refit(&self) {
        self.refit.join();
    }

    pub fn shutdown(&self) {
        self.refit.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accuracy::AccuracyLedger;
    use crate::config::{CrossValidationSettings, EnsembleConfig, WeightConstraints};
    use crate::cross_validation::CrossValidator;
    use crate::ensemble::{EnsembleMethod, GameType};
    use crate::meta_learner::{MetaLearner, StackerSettings};
    use crate::model::ModelResult;
    use crate::weighting::WeightMap;

    fn prediction(home_prob: f64) -> EnsembleResult {
        EnsembleResult {
            winner: if home_prob >= 0.5 { "SEA" } else { "VAN" }.to_string(),
            win_probability: home_prob.max(1.0 - home_prob),
            predicted_score: Score { home: 3, away: 2 },
            confidence: 0.6,
            raw_confidence: 0.6,
            game_type: GameType::Close,
            is_upset: false,
            ensemble_method: EnsembleMethod::WeightedAverage,
            model_results: vec![
                ModelResult {
                    weight: 0.5,
                    ..ModelResult::new("Elo Rating", home_prob, 0.7, Score { home: 3, away: 2 })
                },
                ModelResult {
                    weight: 0.5,
                    ..ModelResult::new("Poisson Regression", 1.0 - home_prob, 0.55, Score { home: 2, away: 3 })
                },
            ],
        }
    }

    fn recorder() -> (OutcomeRecorder, Arc<AccuracyLedger>, Arc<CrossValidator>, Arc<WeightingEngine>) {
        let ledger = Arc::new(AccuracyLedger::new());
        let cv = Arc::new(CrossValidator::new(CrossValidationSettings::default()));
        let baseline = WeightMap::normalized([
            ("Elo Rating".to_string(), 0.5),
            ("Poisson Regression".to_string(), 0.5),
        ]);
        let engine = Arc::new(WeightingEngine::new(
            baseline,
            WeightConstraints::default(),
            EnsembleConfig::default(),
        ));
        let rec = OutcomeRecorder::new(
            ledger.clone(),
            cv.clone(),
            engine.clone(),
            vec!["Elo Rating".to_string(), "Poisson Regression".to_string()],
        );
        (rec, ledger, cv, engine)
    }

    fn day(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 1).unwrap() + chrono::Duration::days(n)
    }

    #[test]
    fn outcome_only_records_reach_every_model() {
        let (rec, ledger, cv, _) = recorder();
        rec.record_outcome("SEA", "VAN", day(0), "SEA", Score { home: 4, away: 1 })
            .unwrap();
        let snap = ledger.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["Elo Rating"][0].predicted_winner, None);
        assert_eq!(cv.history_len(), 0);
    }

    #[test]
    fn graded_game_updates_ledger_and_history() {
        let (rec, ledger, cv, _) = recorder();
        rec.record_historical_prediction("SEA", "VAN", day(0), &prediction(0.65), "SEA", Score { home: 3, away: 1 })
            .unwrap();
        assert_eq!(cv.history_len(), 1);
        assert_eq!(ledger.stats("Elo Rating").unwrap().correct, 1);
        assert_eq!(ledger.stats("Poisson Regression").unwrap().correct, 0);
        let rec0 = &ledger.snapshot()["Poisson Regression"][0];
        assert_eq!(rec0.predicted_winner.as_deref(), Some("VAN"));
        assert!((rec0.win_probability.unwrap() - 0.65).abs() < 1e-12);
    }

    #[test]
    fn steady_feedback_moves_weight_toward_the_better_model() {
        let (rec, _, _, engine) = recorder();
        for i in 0..40 {
            rec.record_historical_prediction("SEA", "VAN", day(i), &prediction(0.7), "SEA", Score { home: 3, away: 1 })
                .unwrap();
        }
        let w = engine.current_weights();
        assert!(w.get("Elo Rating").unwrap() > w.get("Poisson Regression").unwrap());
        assert!((w.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stacker_trains_once_enough_games_are_graded() {
        let (rec, _, _, _) = recorder();
        let stacker = Arc::new(LogisticStacker::new(StackerSettings::default()));
        let rec = rec.with_stacker(stacker.clone());
        for i in 0..20 {
            let home_prob = if i % 2 == 0 { 0.7 } else { 0.3 };
            let winner = if i % 2 == 0 { "SEA" } else { "VAN" };
            rec.record_historical_prediction("SEA", "VAN", day(i), &prediction(home_prob), winner, Score { home: 2, away: 1 })
                .unwrap();
        }
        assert!(stacker.is_trained());
        assert_eq!(stacker.examples().len(), 20);
    }

    #[test]
    fn enough_history_triggers_a_background_refit() {
        let (rec, _, cv, _) = recorder();
        for i in 0..50 {
            let winner = if i % 3 == 0 { "VAN" } else { "SEA" };
            rec.record_historical_prediction("SEA", "VAN", day(i), &prediction(0.62), winner, Score { home: 2, away: 1 })
                .unwrap();
        }
        rec.wait_for_refit();
        assert!(cv.is_calibrated());
    }
}
