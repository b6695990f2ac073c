use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::GameContext;
use crate::error::EnsembleError;
use crate::model::{FAMILY_SLOTS, ModelFamily, ModelResult};
use crate::persist;

pub const CONTEXT_FEATURES: usize = 10;
pub const META_INPUTS: usize = FAMILY_SLOTS + CONTEXT_FEATURES;

const OUTPUT_FLOOR: f64 = 0.30;
const OUTPUT_CEIL: f64 = 0.90;
/// Stand-in for a family that produced nothing this request.
const NEUTRAL_PROB: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetaContext {
    pub divisional: bool,
    pub playoff: bool,
    pub rivalry: bool,
    pub home_hot: bool,
    pub away_hot: bool,
    pub home_cold: bool,
    pub away_cold: bool,
    pub rest_advantage: f64,
    pub travel_distance: f64,
    pub back_to_back: bool,
}

impl From<&GameContext> for MetaContext {
    fn from(ctx: &GameContext) -> Self {
        Self {
            divisional: ctx.divisional,
            playoff: ctx.playoff,
            rivalry: ctx.rivalry,
            home_hot: ctx.home_hot,
            away_hot: ctx.away_hot,
            home_cold: ctx.home_cold,
            away_cold: ctx.away_cold,
            rest_advantage: ctx.rest_diff as f64,
            travel_distance: ctx.away_travel,
            back_to_back: ctx.back_to_back,
        }
    }
}

impl MetaContext {
    fn encode(&self) -> [f64; CONTEXT_FEATURES] {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        [
            flag(self.divisional),
            flag(self.playoff),
            flag(self.rivalry),
            flag(self.home_hot),
            flag(self.away_hot),
            flag(self.home_cold),
            flag(self.away_cold),
            self.rest_advantage / 5.0,
            self.travel_distance / 3000.0,
            flag(self.back_to_back),
        ]
    }
}

/// Fixed-schema stacking input: one home-win probability per family plus context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetaFeatures {
    pub model_probs: [f64; FAMILY_SLOTS],
    pub context: MetaContext,
}

impl MetaFeatures {
    /// Routes each result into its family slot. Returns the names that no
    /// slot accepted alongside the features.
    pub fn from_results(results: &[ModelResult], ctx: &GameContext) -> (Self, Vec<String>) {
        let mut model_probs = [NEUTRAL_PROB; FAMILY_SLOTS];
        let mut unrecognized = Vec::new();
        for r in results {
            match r.family().slot() {
                Some(slot) => model_probs[slot] = r.win_probability,
                None => unrecognized.push(r.model_name.clone()),
            }
        }
        (
            Self {
                model_probs,
                context: MetaContext::from(ctx),
            },
            unrecognized,
        )
    }

    pub fn inputs(&self) -> [f64; META_INPUTS] {
        let mut out = [0.0; META_INPUTS];
        out[..FAMILY_SLOTS].copy_from_slice(&self.model_probs);
        out[FAMILY_SLOTS..].copy_from_slice(&self.context.encode());
        out
    }
}

pub trait MetaLearner: Send + Sync {
    fn is_trained(&self) -> bool;

    /// Home-win probability for the stacked inputs.
    fn predict(&self, features: &MetaFeatures) -> anyhow::Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub features: MetaFeatures,
    pub home_won: bool,
}

#[derive(Debug, Clone)]
pub struct StackerSettings {
    pub learning_rate: f64,
    pub epochs: usize,
    pub min_examples: usize,
    pub first_train_after: usize,
    pub retrain_every: usize,
    pub max_examples: usize,
    pub seed: u64,
    pub state_file: Option<PathBuf>,
}

impl Default for StackerSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            epochs: 100,
            min_examples: 20,
            first_train_after: 20,
            retrain_every: 50,
            max_examples: 5000,
            seed: 0x5eed,
            state_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackerState {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub trained: bool,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
    pub examples_seen: usize,
    pub trained_at: Option<DateTime<Utc>>,
}

impl StackerState {
    fn untrained(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            weights: (0..META_INPUTS).map(|_| rng.gen_range(-0.1..0.1)).collect(),
            bias: 0.5,
            trained: false,
            train_accuracy: 0.0,
            val_accuracy: 0.0,
            examples_seen: 0,
            trained_at: None,
        }
    }

    fn logit(&self, inputs: &[f64; META_INPUTS]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(inputs.iter())
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }

    fn raw_probability(&self, inputs: &[f64; META_INPUTS]) -> f64 {
        sigmoid(self.logit(inputs))
    }

    fn accuracy(&self, data: &[TrainingExample]) -> f64 {
        if data.is_empty() {
            return 0.0;
        }
        let hits = data
            .iter()
            .filter(|e| (self.raw_probability(&e.features.inputs()) > 0.5) == e.home_won)
            .count();
        hits as f64 / data.len() as f64
    }

    /// One SGD step on binary cross-entropy; returns the example's loss.
    fn step(&mut self, example: &TrainingExample, lr: f64) -> f64 {
        let inputs = example.features.inputs();
        let p = self.raw_probability(&inputs);
        let y = if example.home_won { 1.0 } else { 0.0 };
        let loss = -y * p.max(1e-10).ln() - (1.0 - y) * (1.0 - p).max(1e-10).ln();
        let err = p - y;
        for (w, x) in self.weights.iter_mut().zip(inputs.iter()) {
            *w -= lr * err * x;
        }
        self.bias -= lr * err;
        loss
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainingReport {
    pub examples: usize,
    pub train_accuracy: f64,
    pub val_accuracy: f64,
}

#[derive(Default)]
struct Ledger {
    examples: Vec<TrainingExample>,
    games_processed: usize,
    games_at_last_train: Option<usize>,
}

/// Logistic-regression stacker over the per-family probabilities.
pub struct LogisticStacker {
    state: RwLock<Arc<StackerState>>,
    ledger: Mutex<Ledger>,
    settings: StackerSettings,
}

impl LogisticStacker {
    pub fn new(settings: StackerSettings) -> Self {
        Self {
            state: RwLock::new(Arc::new(StackerState::untrained(settings.seed))),
            ledger: Mutex::new(Ledger::default()),
            settings,
        }
    }

    /// Restores previously trained weights when the state file exists and is well-formed.
    pub fn load_or_new(settings: StackerSettings) -> Self {
        let stacker = Self::new(settings);
        let Some(path) = stacker.settings.state_file.clone() else {
            return stacker;
        };
        match persist::load_json::<StackerState>(&path) {
            Ok(Some(state)) if state.weights.len() == META_INPUTS => {
                info!(path = %path.display(), val_accuracy = state.val_accuracy, "stacker state restored");
                stacker.swap_state(state);
            }
            Ok(Some(_)) => warn!(path = %path.display(), "stacker state has wrong shape, ignoring"),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to load stacker state"),
        }
        stacker
    }

    pub fn state(&self) -> Arc<StackerState> {
        let guard = self.state.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn swap_state(&self, state: StackerState) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(state);
    }

    pub fn train(&self, data: &[TrainingExample]) -> Result<TrainingReport, EnsembleError> {
        if data.len() < self.settings.min_examples {
            return Err(EnsembleError::InsufficientHistory {
                have: data.len(),
                need: self.settings.min_examples,
            });
        }

        let split = ((data.len() as f64) * 0.8) as usize;
        let mut train_set = data[..split].to_vec();
        let val_set = &data[split..];

        let mut rng = StdRng::seed_from_u64(self.settings.seed ^ data.len() as u64);
        let mut state = StackerState::untrained(self.settings.seed);
        let mut best = state.clone();
        let mut best_val = f64::NEG_INFINITY;

        for epoch in 0..self.settings.epochs {
            train_set.shuffle(&mut rng);
            let loss: f64 = train_set
                .iter()
                .map(|e| state.step(e, self.settings.learning_rate))
                .sum();

            if (epoch + 1) % 10 == 0 || epoch + 1 == self.settings.epochs {
                let val = state.accuracy(val_set);
                debug!(
                    epoch = epoch + 1,
                    loss = loss / train_set.len().max(1) as f64,
                    val_accuracy = val,
                    "stacker epoch"
                );
                if val > best_val {
                    best_val = val;
                    best = state.clone();
                }
            }
        }

        best.trained = true;
        best.train_accuracy = best.accuracy(&train_set);
        best.val_accuracy = best_val.max(0.0);
        best.examples_seen = data.len();
        best.trained_at = Some(Utc::now());

        let report = TrainingReport {
            examples: data.len(),
            train_accuracy: best.train_accuracy,
            val_accuracy: best.val_accuracy,
        };
        info!(
            examples = report.examples,
            train_accuracy = report.train_accuracy,
            val_accuracy = report.val_accuracy,
            "stacker trained"
        );

        if let Some(path) = &self.settings.state_file {
            if let Err(err) = persist::save_json(path, &best) {
                warn!(error = %err, "failed to persist stacker state");
            }
        }
        self.swap_state(best);
        Ok(report)
    }

    pub fn record_example(&self, example: TrainingExample) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.examples.push(example);
        ledger.games_processed += 1;
        let overflow = ledger.examples.len().saturating_sub(self.settings.max_examples);
        if overflow > 0 {
            ledger.examples.drain(..overflow);
        }
    }

    pub fn should_auto_train(&self) -> bool {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        match ledger.games_at_last_train {
            None => ledger.games_processed >= self.settings.first_train_after,
            Some(at) => ledger.games_processed - at >= self.settings.retrain_every,
        }
    }

    /// Trains on the recorded examples when due. `None` when not due.
    pub fn auto_train(&self) -> Option<Result<TrainingReport, EnsembleError>> {
        if !self.should_auto_train() {
            return None;
        }
        let (examples, games) = {
            let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            (ledger.examples.clone(), ledger.games_processed)
        };
        let outcome = self.train(&examples);
        if outcome.is_ok() {
            let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
            ledger.games_at_last_train = Some(games);
        }
        Some(outcome)
    }

    pub fn examples(&self) -> Vec<TrainingExample> {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        ledger.examples.clone()
    }
}

impl MetaLearner for LogisticStacker {
    fn is_trained(&self) -> bool {
        self.state().trained
    }

    fn predict(&self, features: &MetaFeatures) -> anyhow::Result<f64> {
        let state = self.state();
        if !state.trained {
            return Err(anyhow!("stacker has not been trained"));
        }
        let p = state.raw_probability(&features.inputs());
        if !p.is_finite() {
            return Err(anyhow!("stacker produced a non-finite probability"));
        }
        Ok(p.clamp(OUTPUT_FLOOR, OUTPUT_CEIL))
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Canonical names in slot order, for reporting learned weights.
pub fn slot_names() -> [&'static str; FAMILY_SLOTS] {
    ModelFamily::ALL.map(|f| f.canonical_name())
}
