use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::{self, CalibrationBin, IsotonicCurve, Metrics};
use crate::config::CrossValidationSettings;
use crate::error::EnsembleError;
use crate::model::{ModelResult, Score};

const MIN_CONFIDENCE: f64 = 0.1;
const MAX_CONFIDENCE: f64 = 0.99;

/// A finished game together with what the ensemble said before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPrediction {
    pub home_team: String,
    pub away_team: String,
    pub date: NaiveDate,
    pub predicted_winner: String,
    /// Relative to `predicted_winner`.
    pub win_probability: f64,
    /// Confidence before any cross-validation remap.
    pub raw_confidence: f64,
    pub predicted_score: Score,
    pub actual_winner: String,
    pub actual_score: Score,
    pub model_results: Vec<ModelResult>,
}

impl HistoricalPrediction {
    pub fn is_correct(&self) -> bool {
        self.predicted_winner == self.actual_winner
    }

    pub fn home_won(&self) -> bool {
        self.actual_winner == self.home_team
    }

    /// Absolute difference in total goals.
    pub fn score_error(&self) -> f64 {
        let predicted = (self.predicted_score.home + self.predicted_score.away) as f64;
        let actual = (self.actual_score.home + self.actual_score.away) as f64;
        (predicted - actual).abs()
    }
}

pub trait CrossValidation: Send + Sync {
    fn is_calibrated(&self) -> bool;

    fn calibrated_confidence(&self, raw: f64, results: &[ModelResult]) -> f64;

    fn add_historical_prediction(&self, record: HistoricalPrediction);

    fn should_revalidate(&self) -> bool;

    /// Refits the calibration. Runs off the request path.
    fn run_cross_validation(&self) -> Result<(), EnsembleError>;

    /// Asks an in-flight `run_cross_validation` to stop early.
    fn request_cancel(&self) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoldResult {
    pub fold: usize,
    pub samples: usize,
    pub metrics: Metrics,
    /// Brier score of the confidence after remapping with a curve fit on the other folds.
    pub calibrated_brier: f64,
    pub mean_score_error: f64,
    pub accuracy_interval: (f64, f64),
    pub model_accuracy: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRanking {
    pub model: String,
    pub accuracy: f64,
    pub adjustment: f64,
    pub rank: usize,
}

/// Everything one refit produced. Published as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationFit {
    #[serde(skip)]
    pub curve: IsotonicCurve,
    pub bins: Vec<CalibrationBin>,
    /// One minus the mean gap between bin midpoints and observed accuracy.
    pub calibration_score: f64,
    pub overall_accuracy: f64,
    pub model_adjustments: BTreeMap<String, f64>,
    pub folds: Vec<FoldResult>,
    pub samples: usize,
    pub fitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub is_validated: bool,
    pub overall_accuracy: f64,
    pub calibration_score: f64,
    pub is_well_calibrated: bool,
    pub total_predictions: usize,
    pub validation_folds: usize,
    pub accuracy_interval: (f64, f64),
    pub mean_brier: f64,
    pub mean_log_loss: f64,
    pub mean_score_error: f64,
    pub model_rankings: Vec<ModelRanking>,
    pub calibration_bins: Vec<CalibrationBin>,
    pub last_validated: Option<DateTime<Utc>>,
    pub message: String,
}

pub struct CrossValidator {
    settings: CrossValidationSettings,
    history: Mutex<Vec<HistoricalPrediction>>,
    fit: RwLock<Option<Arc<CalibrationFit>>>,
    last_fit: Mutex<Option<Instant>>,
    cancel: AtomicBool,
}

impl CrossValidator {
    pub fn new(settings: CrossValidationSettings) -> Self {
        Self {
            settings,
            history: Mutex::new(Vec::new()),
            fit: RwLock::new(None),
            last_fit: Mutex::new(None),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn current_fit(&self) -> Option<Arc<CalibrationFit>> {
        let guard = self.fit.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn history(&self) -> Vec<HistoricalPrediction> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn validation_summary(&self) -> ValidationSummary {
        let total_predictions = self.history_len();
        let Some(fit) = self.current_fit() else {
            return ValidationSummary {
                is_validated: false,
                overall_accuracy: 0.0,
                calibration_score: 0.0,
                is_well_calibrated: false,
                total_predictions,
                validation_folds: 0,
                accuracy_interval: (0.0, 1.0),
                mean_brier: 0.0,
                mean_log_loss: 0.0,
                mean_score_error: 0.0,
                model_rankings: Vec::new(),
                calibration_bins: Vec::new(),
                last_validated: None,
                message: "cross-validation not yet performed".to_string(),
            };
        };

        let correct = (fit.overall_accuracy * fit.samples as f64).round() as usize;

        ValidationSummary {
            is_validated: true,
            overall_accuracy: fit.overall_accuracy,
            calibration_score: fit.calibration_score,
            is_well_calibrated: fit.calibration_score > 0.9,
            total_predictions,
            validation_folds: fit.folds.len(),
            accuracy_interval: calibration::wilson_interval(correct, fit.samples),
            mean_brier: fold_mean(&fit.folds, |r| r.metrics.brier),
            mean_log_loss: fold_mean(&fit.folds, |r| r.metrics.log_loss),
            mean_score_error: fold_mean(&fit.folds, |r| r.mean_score_error),
            model_rankings: rank_models(&fit),
            calibration_bins: fit.bins.clone(),
            last_validated: Some(fit.fitted_at),
            message: format!(
                "{} accuracy ({:.1}%), {} calibration ({:.1}%) across {} folds",
                grade(fit.overall_accuracy),
                fit.overall_accuracy * 100.0,
                grade(fit.calibration_score),
                fit.calibration_score * 100.0,
                fit.folds.len()
            ),
        }
    }

    fn windowed_history(&self) -> Vec<HistoricalPrediction> {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner()).clone();
        self.prune(&mut history);
        history
    }

    /// Drops records older than the window, measured back from the latest recorded date.
    fn prune(&self, history: &mut Vec<HistoricalPrediction>) {
        let Some(latest) = history.iter().map(|h| h.date).max() else {
            return;
        };
        let window = ChronoDuration::from_std(self.settings.window).unwrap_or(ChronoDuration::days(365));
        let cutoff = latest - window;
        history.retain(|h| h.date >= cutoff);
    }

    fn check_cancel(&self) -> Result<(), EnsembleError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(EnsembleError::Cancelled);
        }
        Ok(())
    }

    fn fit(&self) -> Result<CalibrationFit, EnsembleError> {
        let mut data = self.windowed_history();
        if data.len() < self.settings.min_history {
            return Err(EnsembleError::InsufficientHistory {
                have: data.len(),
                need: self.settings.min_history,
            });
        }
        if self.settings.temporal {
            data.sort_by(|a, b| a.date.cmp(&b.date));
        } else {
            let seed = data.len() as u64;
            data.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        let k = self.settings.k_folds.clamp(2, data.len());
        let fold_size = data.len().div_ceil(k);
        let mut folds = Vec::with_capacity(k);
        for (i, test) in data.chunks(fold_size).enumerate() {
            self.check_cancel()?;
            let start = i * fold_size;
            let train: Vec<&HistoricalPrediction> = data[..start]
                .iter()
                .chain(data[start + test.len()..].iter())
                .collect();
            folds.push(evaluate_fold(i, test, &train));
        }

        self.check_cancel()?;
        let confidences: Vec<f64> = data.iter().map(|h| h.raw_confidence).collect();
        let hits: Vec<bool> = data.iter().map(|h| h.is_correct()).collect();
        let curve = IsotonicCurve::fit(&confidences, &hits).ok_or(EnsembleError::InsufficientHistory {
            have: data.len(),
            need: self.settings.min_history,
        })?;
        let bins = calibration::reliability_bins(&confidences, &hits, self.settings.calibration_bins);
        let calibration_score = calibration_score(&bins);
        let overall_accuracy = hits.iter().filter(|h| **h).count() as f64 / hits.len() as f64;
        let model_adjustments = model_adjustments(&data, overall_accuracy);

        Ok(CalibrationFit {
            curve,
            bins,
            calibration_score,
            overall_accuracy,
            model_adjustments,
            folds,
            samples: data.len(),
            fitted_at: Utc::now(),
        })
    }
}

impl CrossValidation for CrossValidator {
    fn is_calibrated(&self) -> bool {
        self.fit.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn calibrated_confidence(&self, raw: f64, results: &[ModelResult]) -> f64 {
        let Some(fit) = self.current_fit() else {
            return raw;
        };
        let mapped = fit.curve.apply(raw);
        let adjustment = weighted_adjustment(&fit.model_adjustments, results);
        let out = (mapped * adjustment).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
        debug!(raw, mapped, adjustment, out, "confidence remapped");
        out
    }

    fn add_historical_prediction(&self, record: HistoricalPrediction) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(record);
        self.prune(&mut history);
    }

    fn should_revalidate(&self) -> bool {
        if self.history_len() < self.settings.min_history {
            return false;
        }
        if !self.is_calibrated() {
            return true;
        }
        let last = self.last_fit.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) => at.elapsed() > self.settings.update_frequency,
            None => true,
        }
    }

    fn run_cross_validation(&self) -> Result<(), EnsembleError> {
        // A cancel left over from an earlier shutdown request must not abort this run.
        self.cancel.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let fit = self.fit()?;
        info!(
            samples = fit.samples,
            folds = fit.folds.len(),
            accuracy = fit.overall_accuracy,
            calibration = fit.calibration_score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cross-validation complete"
        );
        {
            let mut guard = self.fit.write().unwrap_or_else(|e| e.into_inner());
            *guard = Some(Arc::new(fit));
        }
        *self.last_fit.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        Ok(())
    }

    fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

fn evaluate_fold(fold: usize, test: &[HistoricalPrediction], train: &[&HistoricalPrediction]) -> FoldResult {
    let probs: Vec<f64> = test.iter().map(|h| h.win_probability).collect();
    let hits: Vec<bool> = test.iter().map(|h| h.is_correct()).collect();
    let metrics = calibration::evaluate_binary(&probs, &hits);

    let train_conf: Vec<f64> = train.iter().map(|h| h.raw_confidence).collect();
    let train_hits: Vec<bool> = train.iter().map(|h| h.is_correct()).collect();
    let calibrated: Vec<f64> = match IsotonicCurve::fit(&train_conf, &train_hits) {
        Some(curve) => test.iter().map(|h| curve.apply(h.raw_confidence)).collect(),
        None => test.iter().map(|h| h.raw_confidence).collect(),
    };
    let calibrated_brier = calibration::evaluate_binary(&calibrated, &hits).brier;

    let mean_score_error = if test.is_empty() {
        0.0
    } else {
        test.iter().map(|h| h.score_error()).sum::<f64>() / test.len() as f64
    };
    let correct = hits.iter().filter(|h| **h).count();

    FoldResult {
        fold,
        samples: test.len(),
        metrics,
        calibrated_brier,
        mean_score_error,
        accuracy_interval: calibration::wilson_interval(correct, test.len()),
        model_accuracy: per_model_accuracy(test.iter()),
    }
}

fn fold_mean(folds: &[FoldResult], f: impl Fn(&FoldResult) -> f64) -> f64 {
    if folds.is_empty() {
        return 0.0;
    }
    folds.iter().map(f).sum::<f64>() / folds.len() as f64
}

fn per_model_accuracy<'a>(records: impl Iterator<Item = &'a HistoricalPrediction>) -> BTreeMap<String, f64> {
    let mut tally: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for h in records {
        let home_won = h.home_won();
        for r in &h.model_results {
            let entry = tally.entry(r.model_name.clone()).or_default();
            entry.1 += 1;
            if (r.win_probability > 0.5) == home_won {
                entry.0 += 1;
            }
        }
    }
    tally
        .into_iter()
        .map(|(name, (hits, n))| (name, hits as f64 / n.max(1) as f64))
        .collect()
}

fn model_adjustments(data: &[HistoricalPrediction], overall: f64) -> BTreeMap<String, f64> {
    if overall <= 0.0 {
        return BTreeMap::new();
    }
    per_model_accuracy(data.iter())
        .into_iter()
        .map(|(name, acc)| (name, acc / overall))
        .collect()
}

fn weighted_adjustment(adjustments: &BTreeMap<String, f64>, results: &[ModelResult]) -> f64 {
    let mut total = 0.0;
    let mut weight = 0.0;
    for r in results {
        if let Some(adj) = adjustments.get(&r.model_name) {
            total += adj * r.weight;
            weight += r.weight;
        }
    }
    if weight > 0.0 { total / weight } else { 1.0 }
}

fn calibration_score(bins: &[CalibrationBin]) -> f64 {
    let used: Vec<f64> = bins
        .iter()
        .filter(|b| b.count > 0)
        .map(|b| (b.actual_rate - (b.bucket_start + b.bucket_end) / 2.0).abs())
        .collect();
    if used.is_empty() {
        return 1.0;
    }
    (1.0 - used.iter().sum::<f64>() / used.len() as f64).max(0.0)
}

fn rank_models(fit: &CalibrationFit) -> Vec<ModelRanking> {
    let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for fold in &fit.folds {
        for (name, acc) in &fold.model_accuracy {
            let entry = sums.entry(name.as_str()).or_default();
            entry.0 += acc;
            entry.1 += 1;
        }
    }
    let mut rankings: Vec<ModelRanking> = sums
        .into_iter()
        .map(|(name, (sum, n))| ModelRanking {
            model: name.to_string(),
            accuracy: sum / n.max(1) as f64,
            adjustment: fit.model_adjustments.get(name).copied().unwrap_or(1.0),
            rank: 0,
        })
        .collect();
    rankings.sort_by(|a, b| b.accuracy.total_cmp(&a.accuracy).then_with(|| a.model.cmp(&b.model)));
    for (i, r) in rankings.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    rankings
}

fn grade(v: f64) -> &'static str {
    if v > 0.9 {
        "excellent"
    } else if v > 0.8 {
        "very good"
    } else if v > 0.7 {
        "good"
    } else if v > 0.6 {
        "fair"
    } else {
        "poor"
    }
}

/// Runs refits on a background thread, one at a time.
pub struct RefitWorker {
    validator: Arc<dyn CrossValidation>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RefitWorker {
    pub fn new(validator: Arc<dyn CrossValidation>) -> Self {
        Self {
            validator,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts a refit if one is due and none is in flight. Returns whether one started.
    pub fn trigger_if_due(&self) -> bool {
        if !self.validator.should_revalidate() {
            return false;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Reap the previous, already finished, thread before replacing its handle.
        self.join();

        let validator = Arc::clone(&self.validator);
        let running = Arc::clone(&self.running);
        let spawned = thread::Builder::new()
            .name("cv-refit".to_string())
            .spawn(move || {
                match validator.run_cross_validation() {
                    Ok(()) => {}
                    Err(EnsembleError::Cancelled) => info!("cross-validation refit cancelled"),
                    Err(err) => warn!(error = %err, "cross-validation refit failed"),
                }
                running.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => {
                *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                true
            }
            Err(err) => {
                warn!(error = %err, "could not spawn refit thread");
                self.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Waits for the in-flight refit, if any.
    pub fn join(&self) {
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("cross-validation refit thread panicked");
            }
        }
    }

    pub fn shutdown(&self) {
        if self.is_running() {
            self.validator.request_cancel();
        }
        self.join();
    }
}

impl Drop for RefitWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
