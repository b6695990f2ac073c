use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use matchup_ensemble::cross_validation::CrossValidation;
use matchup_ensemble::meta_learner::slot_names;
use matchup_ensemble::service::EnsembleService;
use matchup_ensemble::{EnsembleError, FeatureVector, Score};

/// One finished game per line.
#[derive(Debug, Deserialize)]
struct FinishedGame {
    date: NaiveDate,
    home: FeatureVector,
    away: FeatureVector,
    home_goals: u32,
    away_goals: u32,
    /// Needed only when the score line is level (shootout or extra time).
    #[serde(default)]
    winner: Option<String>,
}

impl FinishedGame {
    fn winner(&self) -> Option<&str> {
        if let Some(w) = self.winner.as_deref() {
            return Some(w);
        }
        if self.home_goals > self.away_goals {
            Some(self.home.team_code.as_str())
        } else if self.away_goals > self.home_goals {
            Some(self.away.team_code.as_str())
        } else {
            None
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    init_tracing();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tests/fixtures/replay_games.jsonl"));
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

    let mut games = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let game: FinishedGame = serde_json::from_str(line)
            .with_context(|| format!("{}:{}", path.display(), idx + 1))?;
        games.push(game);
    }
    games.sort_by_key(|g| g.date);

    let service = EnsembleService::from_env();
    let mut graded = 0usize;
    let mut correct = 0usize;
    let mut skipped = 0usize;

    for game in &games {
        let Some(winner) = game.winner() else {
            warn!(home = %game.home.team_code, away = %game.away.team_code, "level score without winner, skipped");
            skipped += 1;
            continue;
        };
        let score = Score {
            home: game.home_goals,
            away: game.away_goals,
        };
        match service.ensemble.predict_game(&game.home, &game.away) {
            Ok(prediction) => {
                graded += 1;
                if prediction.winner == winner {
                    correct += 1;
                }
                service
                    .recorder
                    .record_game(&game.home, &game.away, game.date, &prediction, winner, score)?;
            }
            Err(err @ EnsembleError::AllModelsFailed { .. }) => {
                warn!(error = %err, "no prediction, recording outcome only");
                service.recorder.record_outcome(
                    &game.home.team_code,
                    &game.away.team_code,
                    game.date,
                    winner,
                    score,
                )?;
            }
            Err(err) => return Err(err.into()),
        }
    }
    service.recorder.wait_for_refit();

    if !service.cross_validation.is_calibrated() {
        if let Err(err) = service.cross_validation.run_cross_validation() {
            println!("Cross-validation: {err}");
        }
    }

    println!("Games: {} (graded {graded}, skipped {skipped})", games.len());
    if graded > 0 {
        println!("Ensemble accuracy: {:.1}%", correct as f64 / graded as f64 * 100.0);
    }

    let summary = service.cross_validation.validation_summary();
    println!("{}", summary.message);
    if summary.is_validated {
        println!(
            "Brier {:.3}  log loss {:.3}  score error {:.2}  95% interval {:.1}%..{:.1}%",
            summary.mean_brier,
            summary.mean_log_loss,
            summary.mean_score_error,
            summary.accuracy_interval.0 * 100.0,
            summary.accuracy_interval.1 * 100.0
        );
        for r in &summary.model_rankings {
            println!(
                "  #{} {:<24} {:>5.1}%  adj {:.3}",
                r.rank,
                r.model,
                r.accuracy * 100.0,
                r.adjustment
            );
        }
    }

    let state = service.stacker.state();
    if state.trained {
        println!(
            "Stacker: train {:.1}%  validation {:.1}%  ({} examples)",
            state.train_accuracy * 100.0,
            state.val_accuracy * 100.0,
            state.examples_seen
        );
        for (name, w) in slot_names().iter().zip(&state.weights) {
            println!("  {name:<24} {w:+.3}");
        }
    } else {
        println!("Stacker: not trained");
    }

    println!("Weights:");
    for (name, w) in service.weights.current_weights().iter() {
        println!("  {name:<24} {:.3}", w);
    }

    service.recorder.shutdown();
    Ok(())
}
