//! Small predictors built only from `FeatureVector` fields.
//!
//! They give the binaries and benches something real to fan out to. Anything
//! implementing `Predictor` can replace them.

use anyhow::{Result, bail};

use crate::features::FeatureVector;
use crate::model::{ModelFamily, ModelResult, Predictor, Score};

const DEFAULT_RATING: f64 = 1500.0;
const MAX_GOALS: u32 = 10;
const LEAGUE_GOALS_PER_TEAM: f64 = 3.0;

/// Rating-difference model with a fixed home edge.
#[derive(Debug, Clone, Copy)]
pub struct EloPredictor {
    pub home_adv_pts: f64,
}

impl Default for EloPredictor {
    fn default() -> Self {
        Self { home_adv_pts: 60.0 }
    }
}

impl Predictor for EloPredictor {
    fn name(&self) -> &str {
        ModelFamily::Elo.canonical_name()
    }

    fn static_weight(&self) -> f64 {
        ModelFamily::Elo.default_weight()
    }

    fn predict(&self, home: &FeatureVector, away: &FeatureVector) -> Result<ModelResult> {
        if home.rating <= 0.0 && away.rating <= 0.0 {
            bail!("no ratings for {} or {}", home.team_code, away.team_code);
        }
        let rh = if home.rating > 0.0 { home.rating } else { DEFAULT_RATING };
        let ra = if away.rating > 0.0 { away.rating } else { DEFAULT_RATING };
        let p = expected_score(rh + self.home_adv_pts, ra);

        // One goal of margin for roughly every 150 rating points.
        let margin = ((rh + self.home_adv_pts - ra) / 150.0).round() as i64;
        let score = score_from_margin(margin);
        let confidence = 0.5 + (p - 0.5).abs();
        Ok(ModelResult::new(self.name(), p, confidence, score))
    }
}

fn expected_score(r_a: f64, r_b: f64) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf(-(r_a - r_b) / 400.0))
}

fn score_from_margin(margin: i64) -> Score {
    let base = 2u32;
    let m = margin.clamp(-4, 4);
    if m >= 0 {
        Score {
            home: base + m as u32,
            away: base,
        }
    } else {
        Score {
            home: base,
            away: base + m.unsigned_abs() as u32,
        }
    }
}

/// Independent Poisson goal model on attack/defence rates.
#[derive(Debug, Clone, Copy)]
pub struct PoissonPredictor {
    pub home_adv_goals: f64,
}

impl Default for PoissonPredictor {
    fn default() -> Self {
        Self { home_adv_goals: 0.15 }
    }
}

impl PoissonPredictor {
    fn expected_goals(&self, home: &FeatureVector, away: &FeatureVector) -> Result<(f64, f64)> {
        let have = |fv: &FeatureVector| fv.goals_for_per_game > 0.0 && fv.goals_against_per_game > 0.0;
        if !have(home) || !have(away) {
            bail!(
                "goal rates missing for {}",
                if have(home) { &away.team_code } else { &home.team_code }
            );
        }
        let lambda_home = home.goals_for_per_game * away.goals_against_per_game / LEAGUE_GOALS_PER_TEAM
            + self.home_adv_goals;
        let lambda_away = away.goals_for_per_game * home.goals_against_per_game / LEAGUE_GOALS_PER_TEAM;
        Ok((lambda_home.clamp(0.2, 8.0), lambda_away.clamp(0.2, 8.0)))
    }
}

impl Predictor for PoissonPredictor {
    fn name(&self) -> &str {
        ModelFamily::Poisson.canonical_name()
    }

    fn static_weight(&self) -> f64 {
        ModelFamily::Poisson.default_weight()
    }

    fn predict(&self, home: &FeatureVector, away: &FeatureVector) -> Result<ModelResult> {
        let (lh, la) = self.expected_goals(home, away)?;
        let (p_home, p_draw, _) = outcome_probs(lh, la, MAX_GOALS);
        // Ties are settled in extra time; split them evenly.
        let p = p_home + p_draw / 2.0;
        let score = Score {
            home: lh.round() as u32,
            away: la.round() as u32,
        };
        let confidence = (0.45 + (p - 0.5).abs() * 1.2 - p_draw * 0.2).clamp(0.3, 0.9);
        Ok(ModelResult::new(self.name(), p, confidence, score))
    }
}

fn outcome_probs(lambda_home: f64, lambda_away: f64, max_goals: u32) -> (f64, f64, f64) {
    let pmf_h = poisson_pmf(lambda_home, max_goals);
    let pmf_a = poisson_pmf(lambda_away, max_goals);

    let mut p_home = 0.0;
    let mut p_draw = 0.0;
    let mut p_away = 0.0;
    for (i, p_i) in pmf_h.iter().enumerate() {
        for (j, p_j) in pmf_a.iter().enumerate() {
            let p = p_i * p_j;
            if i > j {
                p_home += p;
            } else if i < j {
                p_away += p;
            } else {
                p_draw += p;
            }
        }
    }

    let sum = p_home + p_draw + p_away;
    if sum > 0.0 {
        (p_home / sum, p_draw / sum, p_away / sum)
    } else {
        (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)
    }
}

fn poisson_pmf(lambda: f64, max_k: u32) -> Vec<f64> {
    let max_k = max_k as usize;
    let mut out = vec![0.0; max_k + 1];
    let lambda = lambda.max(0.0);
    out[0] = (-lambda).exp();
    for k in 1..=max_k {
        out[k] = out[k - 1] * lambda / k as f64;
    }
    let sum: f64 = out.iter().sum();
    if sum < 1.0 {
        out[max_k] += 1.0 - sum;
    }
    out
}

/// Blend of record, recent form and streaks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormPredictor;

impl Predictor for FormPredictor {
    fn name(&self) -> &str {
        ModelFamily::Statistical.canonical_name()
    }

    fn static_weight(&self) -> f64 {
        ModelFamily::Statistical.default_weight()
    }

    fn predict(&self, home: &FeatureVector, away: &FeatureVector) -> Result<ModelResult> {
        if home.win_percentage <= 0.0 || away.win_percentage <= 0.0 {
            bail!("win percentage missing");
        }
        let strength = |fv: &FeatureVector| {
            let form = if fv.recent_form > 0.0 { fv.recent_form } else { fv.win_percentage };
            let streak = if fv.is_hot {
                0.03
            } else if fv.is_cold {
                -0.03
            } else {
                0.0
            };
            let fatigue = if fv.back_to_back { -0.03 } else { 0.0 };
            fv.win_percentage * 0.6 + form * 0.4 + streak + fatigue
        };
        let edge = strength(home) - strength(away) + 0.04;
        let p = (0.5 + edge).clamp(0.05, 0.95);

        let gf = |fv: &FeatureVector| {
            if fv.goals_for_per_game > 0.0 { fv.goals_for_per_game } else { LEAGUE_GOALS_PER_TEAM }
        };
        let shift = edge * 2.0;
        let score = Score {
            home: (gf(home) + shift / 2.0).max(0.0).round() as u32,
            away: (gf(away) - shift / 2.0).max(0.0).round() as u32,
        };
        let confidence = if home.recent_form > 0.0 && away.recent_form > 0.0 { 0.65 } else { 0.5 };
        Ok(ModelResult::new(self.name(), p, confidence, score))
    }
}
