use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::FeatureVector;
use crate::model::Score;

const RECENT_WINDOW: usize = 50;
const DEFAULT_ACCURACY: f64 = 0.75;
const MAX_RECORDS_PER_MODEL: usize = 2000;

/// One graded (or, for outcome-only records, ungraded) game for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRecord {
    pub home_team: String,
    pub away_team: String,
    pub date: NaiveDate,
    pub predicted_winner: Option<String>,
    /// Probability assigned to `predicted_winner`.
    pub win_probability: Option<f64>,
    pub confidence: Option<f64>,
    pub predicted_score: Option<Score>,
    pub actual_winner: String,
    pub actual_score: Score,
}

impl AccuracyRecord {
    pub fn is_correct(&self) -> Option<bool> {
        self.predicted_winner
            .as_ref()
            .map(|w| *w == self.actual_winner)
    }
}

/// Per-model multiplier and the signals that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceBoost {
    pub historical_accuracy: f64,
    pub data_quality: f64,
    pub situational_clarity: f64,
    pub factor_strength: f64,
    pub venue_advantage: f64,
    pub overall_confidence_boost: f64,
}

impl ConfidenceBoost {
    pub fn neutral() -> Self {
        Self {
            historical_accuracy: DEFAULT_ACCURACY,
            data_quality: 1.0,
            situational_clarity: 0.7,
            factor_strength: 0.6,
            venue_advantage: 0.7,
            overall_confidence_boost: 1.0,
        }
    }
}

pub trait AccuracyTracker: Send + Sync {
    fn confidence_boost(&self, model: &str, winning_side: &FeatureVector) -> ConfidenceBoost;

    fn record_outcome(&self, model: &str, record: AccuracyRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelAccuracyStats {
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub recent_accuracy: f64,
    pub mean_probability_error: f64,
}

/// In-memory accuracy tracker keyed by model name.
#[derive(Default)]
pub struct AccuracyLedger {
    records: Mutex<BTreeMap<String, VecDeque<AccuracyRecord>>>,
}

impl AccuracyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self, model: &str) -> Option<ModelAccuracyStats> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(model).map(summarize)
    }

    pub fn all_stats(&self) -> BTreeMap<String, ModelAccuracyStats> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().map(|(k, v)| (k.clone(), summarize(v))).collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<AccuracyRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect()
    }

    pub fn restore(&self, saved: BTreeMap<String, Vec<AccuracyRecord>>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        *records = saved
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();
    }
}

fn summarize(records: &VecDeque<AccuracyRecord>) -> ModelAccuracyStats {
    let graded: Vec<(bool, Option<f64>)> = records
        .iter()
        .filter_map(|r| r.is_correct().map(|c| (c, r.win_probability)))
        .collect();
    if graded.is_empty() {
        return ModelAccuracyStats::default();
    }
    let correct = graded.iter().filter(|(c, _)| *c).count();
    let recent = &graded[graded.len().saturating_sub(RECENT_WINDOW)..];
    let recent_correct = recent.iter().filter(|(c, _)| *c).count();
    let (err_sum, err_n) = graded.iter().fold((0.0, 0usize), |(s, n), (c, p)| match p {
        Some(p) => (s + ((if *c { 1.0 } else { 0.0 }) - p).abs(), n + 1),
        None => (s, n),
    });
    ModelAccuracyStats {
        total: graded.len(),
        correct,
        accuracy: correct as f64 / graded.len() as f64,
        recent_accuracy: recent_correct as f64 / recent.len() as f64,
        mean_probability_error: if err_n > 0 { err_sum / err_n as f64 } else { 0.0 },
    }
}

impl AccuracyTracker for AccuracyLedger {
    fn confidence_boost(&self, model: &str, side: &FeatureVector) -> ConfidenceBoost {
        let historical_accuracy = self
            .stats(model)
            .filter(|s| s.total > 0)
            .map(|s| s.recent_accuracy)
            .unwrap_or(DEFAULT_ACCURACY);

        let data_quality = input_quality(side);
        let situational_clarity = situational_clarity(side);
        let factor_strength = factor_strength(side);
        let venue_advantage = 0.7;
        // No cross-model consensus history or market data is tracked here.
        let consensus = 0.5;
        let market = 0.0;

        let total = consensus * 0.25
            + historical_accuracy * 0.30
            + data_quality * 0.15
            + situational_clarity * 0.10
            + factor_strength * 0.10
            + market * 0.05
            + venue_advantage * 0.05;
        let overall_confidence_boost = (0.8 + total * 0.5).clamp(0.8, 1.3);
        debug!(model, overall_confidence_boost, historical_accuracy, "confidence boost");

        ConfidenceBoost {
            historical_accuracy,
            data_quality,
            situational_clarity,
            factor_strength,
            venue_advantage,
            overall_confidence_boost,
        }
    }

    fn record_outcome(&self, model: &str, record: AccuracyRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let entry = records.entry(model.to_string()).or_default();
        entry.push_back(record);
        while entry.len() > MAX_RECORDS_PER_MODEL {
            entry.pop_front();
        }
        Ok(())
    }
}

fn input_quality(fv: &FeatureVector) -> f64 {
    let mut quality = 1.0_f64;
    if fv.rest_days < 1 {
        quality -= 0.15;
    }
    if fv.back_to_back {
        quality -= 0.1;
    }
    if fv.recent_form > 0.75 {
        quality += 0.05;
    }
    quality.clamp(0.3, 1.0)
}

fn situational_clarity(fv: &FeatureVector) -> f64 {
    let mut clarity = 0.7_f64;
    if fv.win_percentage > 0.65 || fv.win_percentage < 0.35 {
        clarity += 0.2;
    }
    if fv.recent_form > 0.8 || fv.recent_form < 0.6 {
        clarity += 0.1;
    }
    clarity.clamp(0.4, 1.0)
}

fn factor_strength(fv: &FeatureVector) -> f64 {
    let mut strength = 0.6_f64;
    if fv.win_percentage > 0.6 || fv.win_percentage < 0.4 {
        strength += 0.2;
    }
    if (fv.goals_for_per_game - fv.goals_against_per_game).abs() > 0.5 {
        strength += 0.15;
    }
    strength.clamp(0.3, 1.0)
}
