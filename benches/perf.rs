use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use matchup_ensemble::calibration::IsotonicCurve;
use matchup_ensemble::config::{CrossValidationSettings, EnsembleConfig, WeightConstraints};
use matchup_ensemble::ensemble::combine;
use matchup_ensemble::meta_learner::StackerSettings;
use matchup_ensemble::service::{EnsembleService, reference_predictors};
use matchup_ensemble::weighting::WeightMap;
use matchup_ensemble::{FeatureVector, ModelResult, Score};

const MODELS: [&str; 10] = [
    "Enhanced Statistical",
    "Neural Network",
    "Bayesian Inference",
    "Monte Carlo Simulation",
    "Elo Rating",
    "Poisson Regression",
    "Gradient Boosting",
    "Random Forest",
    "Markov Chain",
    "Logistic Regression",
];

fn side(code: &str, win_pct: f64, rating: f64) -> FeatureVector {
    FeatureVector {
        win_percentage: win_pct,
        rest_days: 1,
        goals_for_per_game: 3.1,
        goals_against_per_game: 2.8,
        recent_form: win_pct,
        rating,
        talent_rating: win_pct,
        top_scorer_form: 0.6,
        depth_form: 0.5,
        ..FeatureVector::new(code)
    }
}

fn model_results() -> Vec<ModelResult> {
    MODELS
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let p = 0.45 + i as f64 * 0.02;
            ModelResult::new(*name, p, 0.55 + i as f64 * 0.03, Score { home: 3, away: 2 })
        })
        .collect()
}

fn bench_combine(c: &mut Criterion) {
    let home = side("COL", 0.62, 1580.0);
    let away = side("SEA", 0.51, 1510.0);
    let cfg = EnsembleConfig::default();
    let results = model_results();
    let weights = WeightMap::normalized(MODELS.iter().map(|m| (m.to_string(), 0.1)));
    c.bench_function("combine_ten_models", |b| {
        b.iter(|| {
            let r = combine(black_box(results.clone()), &weights, &home, &away, &cfg).unwrap();
            black_box(r.win_probability);
        })
    });
}

fn bench_predict_game(c: &mut Criterion) {
    let service = EnsembleService::new(
        reference_predictors(),
        EnsembleConfig::default(),
        WeightConstraints::default(),
        CrossValidationSettings::default(),
        StackerSettings::default(),
    );
    let home = side("COL", 0.62, 1580.0);
    let away = side("SEA", 0.51, 1510.0);
    c.bench_function("predict_game_reference", |b| {
        b.iter(|| {
            let r = service
                .ensemble
                .predict_game(black_box(&home), black_box(&away))
                .unwrap();
            black_box(r.confidence);
        })
    });
}

fn bench_isotonic_fit(c: &mut Criterion) {
    let scores: Vec<f64> = (0..500).map(|i| 0.3 + (i % 70) as f64 / 100.0).collect();
    let hits: Vec<bool> = (0..500).map(|i| (i * 7) % 10 < 6).collect();
    c.bench_function("isotonic_fit_500", |b| {
        b.iter(|| {
            let curve = IsotonicCurve::fit(black_box(&scores), black_box(&hits)).unwrap();
            black_box(curve.apply(0.7));
        })
    });
}

criterion_group!(benches, bench_combine, bench_predict_game, bench_isotonic_fit);
criterion_main!(benches);
