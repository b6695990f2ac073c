use std::sync::Arc;

use tracing::info;

use crate::accuracy::AccuracyLedger;
use crate::confidence::ConfidenceCalibrator;
use crate::config::{CrossValidationSettings, EnsembleConfig, WeightConstraints};
use crate::cross_validation::CrossValidator;
use crate::data_quality::SignalCoverage;
use crate::ensemble::Ensemble;
use crate::meta_learner::{LogisticStacker, StackerSettings};
use crate::model::Predictor;
use crate::persist;
use crate::predictors::{EloPredictor, FormPredictor, PoissonPredictor};
use crate::recorder::OutcomeRecorder;
use crate::weighting::WeightingEngine;

const STACKER_STATE_FILE: &str = "stacker.json";

/// Every long-lived piece, wired once at startup and shared by reference.
pub struct EnsembleService {
    pub ensemble: Ensemble,
    pub recorder: OutcomeRecorder,
    pub weights: Arc<WeightingEngine>,
    pub stacker: Arc<LogisticStacker>,
    pub cross_validation: Arc<CrossValidator>,
    pub accuracy: Arc<AccuracyLedger>,
}

impl EnsembleService {
    pub fn new(
        predictors: Vec<Arc<dyn Predictor>>,
        config: EnsembleConfig,
        constraints: WeightConstraints,
        cv_settings: CrossValidationSettings,
        stacker_settings: StackerSettings,
    ) -> Self {
        let accuracy = Arc::new(AccuracyLedger::new());
        let cross_validation = Arc::new(CrossValidator::new(cv_settings));
        let weights = Arc::new(WeightingEngine::for_predictors(
            &predictors,
            constraints,
            config.clone(),
        ));
        let stacker = Arc::new(LogisticStacker::load_or_new(stacker_settings));

        let calibrator = ConfidenceCalibrator::new(
            accuracy.clone(),
            Arc::new(SignalCoverage),
            cross_validation.clone(),
            config.clone(),
        );
        let model_names = predictors.iter().map(|p| p.name().to_string()).collect();
        let ensemble = Ensemble::new(predictors, Arc::clone(&weights), calibrator, config)
            .with_meta_learner(stacker.clone());
        let recorder = OutcomeRecorder::new(
            accuracy.clone(),
            cross_validation.clone(),
            Arc::clone(&weights),
            model_names,
        )
        .with_stacker(Arc::clone(&stacker));

        Self {
            ensemble,
            recorder,
            weights,
            stacker,
            cross_validation,
            accuracy,
        }
    }

    /// Reference predictors, configuration from the environment, and stacker
    /// state under the state directory when one can be resolved.
    pub fn from_env() -> Self {
        let stacker_settings = StackerSettings {
            state_file: persist::state_path(STACKER_STATE_FILE),
            ..StackerSettings::default()
        };
        let service = Self::new(
            reference_predictors(),
            EnsembleConfig::from_env(),
            WeightConstraints::from_env(),
            CrossValidationSettings::from_env(),
            stacker_settings,
        );
        info!(
            models = ?service.ensemble.model_names(),
            method = ?service.ensemble.active_method(),
            "ensemble ready"
        );
        service
    }
}

pub fn reference_predictors() -> Vec<Arc<dyn Predictor>> {
    vec![
        Arc::new(FormPredictor),
        Arc::new(EloPredictor::default()),
        Arc::new(PoissonPredictor::default()),
    ]
}
