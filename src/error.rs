use std::fmt;

use thiserror::Error;

/// One predictor that errored during a request.
#[derive(Debug, Clone)]
pub struct PredictorFailure {
    pub model: String,
    pub reason: String,
}

impl fmt::Display for PredictorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.model, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum EnsembleError {
    /// Nothing survived; no partial result is produced.
    #[error("all prediction models failed ({})", join_failures(.failures))]
    AllModelsFailed { failures: Vec<PredictorFailure> },

    #[error("stacking model failed: {0}")]
    Stacking(String),

    #[error("insufficient historical data: have {have}, need {need}")]
    InsufficientHistory { have: usize, need: usize },

    #[error("background task cancelled")]
    Cancelled,

    #[error("persistence error: {0}")]
    Persist(#[from] anyhow::Error),
}

fn join_failures(failures: &[PredictorFailure]) -> String {
    if failures.is_empty() {
        return "no predictors registered".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_failed_lists_every_model() {
        let err = EnsembleError::AllModelsFailed {
            failures: vec![
                PredictorFailure {
                    model: "Elo Rating".to_string(),
                    reason: "no rating".to_string(),
                },
                PredictorFailure {
                    model: "LSTM".to_string(),
                    reason: "short history".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Elo Rating: no rating"));
        assert!(msg.contains("LSTM: short history"));
    }

    #[test]
    fn empty_registry_is_explicit() {
        let err = EnsembleError::AllModelsFailed { failures: Vec::new() };
        assert!(err.to_string().contains("no predictors registered"));
    }
}
