use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use matchup_ensemble::FeatureVector;
use matchup_ensemble::service::EnsembleService;

#[derive(Debug, Deserialize)]
struct PredictCase {
    home: FeatureVector,
    away: FeatureVector,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
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

    let mut json = false;
    let mut path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            other => path = Some(PathBuf::from(other)),
        }
    }
    let path = path.unwrap_or_else(|| PathBuf::from("tests/fixtures/predict_case.json"));

    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let case: PredictCase =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

    let service = EnsembleService::from_env();
    let result = service.ensemble.predict_game(&case.home, &case.away)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("{} vs {}", case.home.team_code, case.away.team_code);
    println!("Winner: {} ({:.1}%)", result.winner, result.win_probability * 100.0);
    println!("Score: {}", result.predicted_score);
    println!(
        "Confidence: {:.1}% (before remap {:.1}%)",
        result.confidence * 100.0,
        result.raw_confidence * 100.0
    );
    println!("Game type: {:?}", result.game_type);
    println!("Upset: {}", result.is_upset);
    println!("Method: {:?}", result.ensemble_method);
    for r in &result.model_results {
        println!(
            "  {:<24} home {:>5.1}%  conf {:>5.1}%  weight {:>5.1}%  {}",
            r.model_name,
            r.win_probability * 100.0,
            r.confidence * 100.0,
            r.weight * 100.0,
            r.predicted_score
        );
    }

    Ok(())
}
