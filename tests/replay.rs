use std::fs;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::Deserialize;

use matchup_ensemble::config::{CrossValidationSettings, EnsembleConfig, WeightConstraints};
use matchup_ensemble::cross_validation::CrossValidation;
use matchup_ensemble::meta_learner::{MetaLearner, StackerSettings};
use matchup_ensemble::service::{EnsembleService, reference_predictors};
use matchup_ensemble::{EnsembleResult, FeatureVector, Score};

#[derive(Debug, Deserialize)]
struct FinishedGame {
    date: NaiveDate,
    home: FeatureVector,
    away: FeatureVector,
    home_goals: u32,
    away_goals: u32,
    #[serde(default)]
    winner: Option<String>,
}

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn games() -> Vec<FinishedGame> {
    read_fixture("replay_games.jsonl")
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("fixture line should parse"))
        .collect()
}

fn service(cv: CrossValidationSettings) -> EnsembleService {
    EnsembleService::new(
        reference_predictors(),
        EnsembleConfig::default(),
        WeightConstraints::default(),
        cv,
        StackerSettings::default(),
    )
}

fn replay(service: &EnsembleService) -> Vec<EnsembleResult> {
    let mut out = Vec::new();
    for g in games() {
        let winner = g.winner.clone().unwrap_or_else(|| {
            if g.home_goals > g.away_goals {
                g.home.team_code.clone()
            } else {
                g.away.team_code.clone()
            }
        });
        let prediction = service
            .ensemble
            .predict_game(&g.home, &g.away)
            .expect("reference predictors cover the fixture");
        service
            .recorder
            .record_game(
                &g.home,
                &g.away,
                g.date,
                &prediction,
                &winner,
                Score {
                    home: g.home_goals,
                    away: g.away_goals,
                },
            )
            .expect("recording never fails for in-memory collaborators");
        out.push(prediction);
    }
    service.recorder.wait_for_refit();
    out
}

#[test]
fn predict_case_fixture_parses_and_predicts() {
    #[derive(Deserialize)]
    struct Case {
        home: FeatureVector,
        away: FeatureVector,
    }
    let case: Case = serde_json::from_str(&read_fixture("predict_case.json")).unwrap();
    let s = service(CrossValidationSettings::default());
    let r = s.ensemble.predict_game(&case.home, &case.away).unwrap();
    assert_eq!(r.winner, "COL");
    assert_eq!(r.model_results.len(), 3);
    assert!((0.1..=1.0).contains(&r.confidence));
}

#[test]
fn replay_without_refits_is_deterministic() {
    let quiet = || CrossValidationSettings {
        min_history: 10_000,
        ..CrossValidationSettings::default()
    };
    let a = replay(&service(quiet()));
    let b = replay(&service(quiet()));
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.winner, y.winner);
        assert_eq!(x.win_probability, y.win_probability);
        assert_eq!(x.predicted_score, y.predicted_score);
        assert_eq!(x.ensemble_method, y.ensemble_method);
    }
}

#[test]
fn full_replay_trains_every_learner() {
    let s = service(CrossValidationSettings::default());
    let predictions = replay(&s);
    assert_eq!(predictions.len(), 90);
    for p in &predictions {
        assert!((0.5..=1.0).contains(&p.win_probability));
        assert!((0.1..=1.0).contains(&p.confidence));
    }

    assert!(s.stacker.is_trained());
    assert!(s.cross_validation.is_calibrated());

    let summary = s.cross_validation.validation_summary();
    assert!(summary.is_validated);
    // The first refit fires once the minimum history is reached.
    assert!((50..=90).contains(&summary.total_predictions));
    assert_eq!(summary.validation_folds, 5);
    assert_eq!(summary.model_rankings.len(), 3);
    assert!(summary.mean_brier >= 0.0 && summary.mean_brier <= 1.0);

    let weights = s.weights.current_weights();
    assert!((weights.sum() - 1.0).abs() < 1e-9);
    assert_eq!(s.accuracy.all_stats().len(), 3);
}
