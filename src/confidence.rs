use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::accuracy::AccuracyTracker;
use crate::config::EnsembleConfig;
use crate::cross_validation::CrossValidation;
use crate::data_quality::DataQuality;
use crate::features::FeatureVector;
use crate::model::ModelResult;

/// Every factor that went into one calibrated confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceBreakdown {
    pub raw: f64,
    pub agreement_bonus: f64,
    pub time_confidence: f64,
    pub accuracy_boost: f64,
    pub data_quality_boost: f64,
    /// After the clamp, before any cross-validation remap.
    pub combined: f64,
    pub calibrated: Option<f64>,
    pub value: f64,
}

impl ConfidenceBreakdown {
    fn pass_through(raw: f64) -> Self {
        Self {
            raw,
            agreement_bonus: 0.0,
            time_confidence: 1.0,
            accuracy_boost: 1.0,
            data_quality_boost: 1.0,
            combined: raw,
            calibrated: None,
            value: raw,
        }
    }
}

pub struct ConfidenceCalibrator {
    accuracy: Arc<dyn AccuracyTracker>,
    quality: Arc<dyn DataQuality>,
    cross_validation: Arc<dyn CrossValidation>,
    config: EnsembleConfig,
}

impl ConfidenceCalibrator {
    pub fn new(
        accuracy: Arc<dyn AccuracyTracker>,
        quality: Arc<dyn DataQuality>,
        cross_validation: Arc<dyn CrossValidation>,
        config: EnsembleConfig,
    ) -> Self {
        Self {
            accuracy,
            quality,
            cross_validation,
            config,
        }
    }

    pub fn calibrate(
        &self,
        raw: f64,
        results: &[ModelResult],
        home: &FeatureVector,
        away: &FeatureVector,
    ) -> f64 {
        self.breakdown(raw, results, home, away).value
    }

    pub fn breakdown(
        &self,
        raw: f64,
        results: &[ModelResult],
        home: &FeatureVector,
        away: &FeatureVector,
    ) -> ConfidenceBreakdown {
        if results.len() < 2 {
            return ConfidenceBreakdown::pass_through(raw);
        }
        let cfg = &self.config;

        let agreement_bonus = agreement_bonus(results, cfg);
        let time_confidence = time_confidence(results, cfg);

        let winning_side = if home.win_percentage >= away.win_percentage { home } else { away };
        let accuracy_boost = self.accuracy_boost(results, winning_side);

        let data_quality_boost = (self.quality.assess(home).confidence_impact
            + self.quality.assess(away).confidence_impact)
            / 2.0;

        let combined = ((raw + agreement_bonus) * time_confidence * accuracy_boost * data_quality_boost)
            .clamp(cfg.min_confidence, cfg.max_confidence);

        let calibrated = if self.cross_validation.is_calibrated() {
            Some(
                self.cross_validation
                    .calibrated_confidence(combined, results)
                    .clamp(cfg.min_confidence, cfg.max_confidence),
            )
        } else {
            None
        };
        let value = calibrated.unwrap_or(combined);

        debug!(
            raw,
            agreement_bonus,
            time_confidence,
            accuracy_boost,
            data_quality_boost,
            combined,
            value,
            "confidence calibrated"
        );

        ConfidenceBreakdown {
            raw,
            agreement_bonus,
            time_confidence,
            accuracy_boost,
            data_quality_boost,
            combined,
            calibrated,
            value,
        }
    }

    fn accuracy_boost(&self, results: &[ModelResult], side: &FeatureVector) -> f64 {
        let mut total = 0.0;
        let mut weight = 0.0;
        for r in results {
            let boost = self.accuracy.confidence_boost(&r.model_name, side);
            total += boost.overall_confidence_boost * r.weight;
            weight += r.weight;
        }
        if weight > 0.0 { total / weight } else { 1.0 }
    }
}

/// Up to `agreement_max_bonus` when the models' probabilities sit close together.
pub fn agreement_bonus(results: &[ModelResult], cfg: &EnsembleConfig) -> f64 {
    let probs = results.iter().map(|r| r.win_probability);
    let (min, max) = probs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p), hi.max(p)));
    if !min.is_finite() {
        return 0.0;
    }
    let span = max - min;
    ((cfg.agreement_span - span) / cfg.agreement_span * cfg.agreement_max_bonus).max(0.0)
}

pub fn time_confidence(results: &[ModelResult], cfg: &EnsembleConfig) -> f64 {
    if results.is_empty() {
        return 1.0;
    }
    let total: Duration = results.iter().map(|r| r.processing_time).sum();
    let avg_ms = total.as_secs_f64() * 1000.0 / results.len() as f64;
    (1.0 - avg_ms / cfg.latency_reference_ms).max(cfg.latency_floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accuracy::ConfidenceBoost;
    use crate::cross_validation::HistoricalPrediction;
    use crate::data_quality::QualityAssessment;
    use crate::error::EnsembleError;
    use crate::model::Score;

    struct FlatBoost(f64);

    impl AccuracyTracker for FlatBoost {
        fn confidence_boost(&self, _model: &str, _side: &FeatureVector) -> ConfidenceBoost {
            ConfidenceBoost {
                overall_confidence_boost: self.0,
                ..ConfidenceBoost::neutral()
            }
        }

        fn record_outcome(&self, _model: &str, _record: crate::accuracy::AccuracyRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FlatQuality(f64);

    impl DataQuality for FlatQuality {
        fn assess(&self, _features: &FeatureVector) -> QualityAssessment {
            QualityAssessment {
                overall_score: 50.0,
                confidence_impact: self.0,
                completeness: 100.0,
                plausibility: 100.0,
                consistency: 100.0,
                issues: Vec::new(),
            }
        }
    }

    struct FixedCurve(Option<f64>);

    impl CrossValidation for FixedCurve {
        fn is_calibrated(&self) -> bool {
            self.0.is_some()
        }

        fn calibrated_confidence(&self, raw: f64, _results: &[ModelResult]) -> f64 {
            self.0.unwrap_or(raw)
        }

        fn add_historical_prediction(&self, _record: HistoricalPrediction) {}

        fn should_revalidate(&self) -> bool {
            false
        }

        fn run_cross_validation(&self) -> Result<(), EnsembleError> {
            Ok(())
        }
    }

    fn calibrator(boost: f64, quality: f64, curve: Option<f64>) -> ConfidenceCalibrator {
        ConfidenceCalibrator::new(
            Arc::new(FlatBoost(boost)),
            Arc::new(FlatQuality(quality)),
            Arc::new(FixedCurve(curve)),
            EnsembleConfig::default(),
        )
    }

    fn result(name: &str, p: f64, ms: u64) -> ModelResult {
        ModelResult {
            weight: 0.5,
            processing_time: Duration::from_millis(ms),
            ..ModelResult::new(name, p, 0.6, Score { home: 3, away: 2 })
        }
    }

    #[test]
    fn single_result_passes_through() {
        let c = calibrator(1.3, 1.3, Some(0.99));
        let home = FeatureVector::new("H");
        let away = FeatureVector::new("A");
        assert_eq!(c.calibrate(0.42, &[result("a", 0.6, 10)], &home, &away), 0.42);
    }

    #[test]
    fn full_agreement_adds_the_whole_bonus() {
        let c = calibrator(1.0, 1.0, None);
        let home = FeatureVector::new("H");
        let away = FeatureVector::new("A");
        let results = [result("a", 0.6, 0), result("b", 0.6, 0)];
        let b = c.breakdown(0.5, &results, &home, &away);
        assert!((b.agreement_bonus - 0.2).abs() < 1e-12);
        assert_eq!(b.time_confidence, 1.0);
        assert!((b.value - 0.7).abs() < 1e-12);
        assert!(b.value >= 0.5);
    }

    #[test]
    fn wide_disagreement_and_slow_models_are_bounded() {
        let cfg = EnsembleConfig::default();
        let results = [result("a", 0.2, 9000), result("b", 0.9, 9000)];
        assert_eq!(agreement_bonus(&results, &cfg), 0.0);
        assert_eq!(time_confidence(&results, &cfg), 0.8);
        let half = [result("a", 0.5, 1000), result("b", 0.5, 1000)];
        assert!((time_confidence(&half, &cfg) - 0.8).abs() < 1e-12);
        let quick = [result("a", 0.5, 500), result("b", 0.5, 500)];
        assert!((time_confidence(&quick, &cfg) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn combined_confidence_is_clamped() {
        let home = FeatureVector::new("H");
        let away = FeatureVector::new("A");
        let results = [result("a", 0.6, 0), result("b", 0.6, 0)];
        assert_eq!(calibrator(1.3, 1.3, None).calibrate(0.95, &results, &home, &away), 1.0);
        assert_eq!(calibrator(0.8, 0.7, None).calibrate(0.0, &[result("a", 0.2, 9000), result("b", 0.9, 9000)], &home, &away), 0.1);
    }

    #[test]
    fn fitted_curve_replaces_the_combined_value() {
        let home = FeatureVector::new("H");
        let away = FeatureVector::new("A");
        let results = [result("a", 0.6, 0), result("b", 0.62, 0)];
        let uncalibrated = calibrator(1.0, 1.0, None).breakdown(0.5, &results, &home, &away);
        assert_eq!(uncalibrated.calibrated, None);
        assert_eq!(uncalibrated.value, uncalibrated.combined);

        let calibrated = calibrator(1.0, 1.0, Some(0.55)).breakdown(0.5, &results, &home, &away);
        assert_eq!(calibrated.combined, uncalibrated.combined);
        assert_eq!(calibrated.value, 0.55);
    }
}
