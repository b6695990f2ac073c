use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;

/// Families the stacking model knows about, each owning one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelFamily {
    Statistical,
    Bayesian,
    MonteCarlo,
    Elo,
    Poisson,
    NeuralNetwork,
    GradientBoosting,
    Lstm,
    RandomForest,
    Unrecognized,
}

pub const FAMILY_SLOTS: usize = 9;

impl ModelFamily {
    pub const ALL: [ModelFamily; FAMILY_SLOTS] = [
        ModelFamily::Statistical,
        ModelFamily::Bayesian,
        ModelFamily::MonteCarlo,
        ModelFamily::Elo,
        ModelFamily::Poisson,
        ModelFamily::NeuralNetwork,
        ModelFamily::GradientBoosting,
        ModelFamily::Lstm,
        ModelFamily::RandomForest,
    ];

    pub fn from_name(name: &str) -> Self {
        match name {
            "Enhanced Statistical" | "Statistical" => ModelFamily::Statistical,
            "Bayesian Inference" | "Bayesian" => ModelFamily::Bayesian,
            "Monte Carlo Simulation" | "Monte Carlo" => ModelFamily::MonteCarlo,
            "Elo Rating" | "Elo" => ModelFamily::Elo,
            "Poisson Regression" | "Poisson" => ModelFamily::Poisson,
            "Neural Network" => ModelFamily::NeuralNetwork,
            "Gradient Boosting" => ModelFamily::GradientBoosting,
            "LSTM" => ModelFamily::Lstm,
            "Random Forest" => ModelFamily::RandomForest,
            _ => ModelFamily::Unrecognized,
        }
    }

    /// Position in the stacking model's probability block.
    pub fn slot(self) -> Option<usize> {
        match self {
            ModelFamily::Statistical => Some(0),
            ModelFamily::Bayesian => Some(1),
            ModelFamily::MonteCarlo => Some(2),
            ModelFamily::Elo => Some(3),
            ModelFamily::Poisson => Some(4),
            ModelFamily::NeuralNetwork => Some(5),
            ModelFamily::GradientBoosting => Some(6),
            ModelFamily::Lstm => Some(7),
            ModelFamily::RandomForest => Some(8),
            ModelFamily::Unrecognized => None,
        }
    }

    pub fn canonical_name(self) -> &'static str {
        match self {
            ModelFamily::Statistical => "Enhanced Statistical",
            ModelFamily::Bayesian => "Bayesian Inference",
            ModelFamily::MonteCarlo => "Monte Carlo Simulation",
            ModelFamily::Elo => "Elo Rating",
            ModelFamily::Poisson => "Poisson Regression",
            ModelFamily::NeuralNetwork => "Neural Network",
            ModelFamily::GradientBoosting => "Gradient Boosting",
            ModelFamily::Lstm => "LSTM",
            ModelFamily::RandomForest => "Random Forest",
            ModelFamily::Unrecognized => "unrecognized",
        }
    }

    pub fn default_weight(self) -> f64 {
        match self {
            ModelFamily::Statistical => 0.28,
            ModelFamily::Bayesian => 0.11,
            ModelFamily::MonteCarlo => 0.08,
            ModelFamily::Elo => 0.16,
            ModelFamily::Poisson => 0.11,
            ModelFamily::NeuralNetwork => 0.06,
            ModelFamily::GradientBoosting => 0.07,
            ModelFamily::Lstm => 0.06,
            ModelFamily::RandomForest => 0.07,
            ModelFamily::Unrecognized => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub home: u32,
    pub away: u32,
}

impl Score {
    pub fn margin(&self) -> i64 {
        self.home as i64 - self.away as i64
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

impl FromStr for Score {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, a) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("score '{s}' is not of the form H-A"))?;
        let home = h
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("home goals in '{s}': {e}"))?;
        let away = a
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("away goals in '{s}': {e}"))?;
        Ok(Score { home, away })
    }
}

/// One predictor's answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub model_name: String,
    /// Probability that the home side wins.
    pub win_probability: f64,
    pub confidence: f64,
    /// Raw "H-A" text as the predictor produced it.
    pub predicted_score: String,
    pub weight: f64,
    pub processing_time: Duration,
}

impl ModelResult {
    pub fn new(model_name: impl Into<String>, win_probability: f64, confidence: f64, score: Score) -> Self {
        Self {
            model_name: model_name.into(),
            win_probability: win_probability.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            predicted_score: score.to_string(),
            weight: 0.0,
            processing_time: Duration::ZERO,
        }
    }

    pub fn score(&self) -> Result<Score, String> {
        self.predicted_score.parse()
    }

    pub fn family(&self) -> ModelFamily {
        ModelFamily::from_name(&self.model_name)
    }
}

/// A model that can be fanned out to by the ensemble.
///
/// Implementations must be pure functions of the two vectors; the ensemble
/// may call them from several threads at once.
pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    fn static_weight(&self) -> f64;

    fn predict(&self, home: &FeatureVector, away: &FeatureVector) -> anyhow::Result<ModelResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scores_with_whitespace() {
        assert_eq!("3-2".parse::<Score>().unwrap(), Score { home: 3, away: 2 });
        assert_eq!(" 4 - 1 ".parse::<Score>().unwrap(), Score { home: 4, away: 1 });
        assert!("3:2".parse::<Score>().is_err());
        assert!("x-2".parse::<Score>().is_err());
        assert!("-1-2".parse::<Score>().is_err());
    }

    #[test]
    fn family_slots_are_unique_and_dense() {
        let mut seen = [false; FAMILY_SLOTS];
        for family in ModelFamily::ALL {
            let slot = family.slot().unwrap();
            assert!(!seen[slot]);
            seen[slot] = true;
            assert_eq!(ModelFamily::from_name(family.canonical_name()), family);
        }
        assert!(seen.iter().all(|s| *s));
        assert_eq!(ModelFamily::from_name("Weather Oracle").slot(), None);
    }

    #[test]
    fn default_weights_sum_to_one() {
        let total: f64 = ModelFamily::ALL.iter().map(|f| f.default_weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
