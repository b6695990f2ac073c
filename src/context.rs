use serde::Serialize;
use tracing::debug;

use crate::features::FeatureVector;
use crate::model::ModelFamily;
use crate::weighting::WeightMap;

const PLAYOFF_IMPORTANCE: f64 = 0.8;
const PLAYOFF_PUSH_IMPORTANCE: f64 = 0.6;
const UNDERDOG_TALENT_GAP: f64 = 0.3;
const UNDERDOG_WIN_PCT_GAP: f64 = 0.25;
const CLOSE_TALENT_GAP: f64 = 0.15;
const CLOSE_WIN_PCT_GAP: f64 = 0.10;
const REST_MISMATCH_DAYS: i32 = 2;
const FATIGUE_TRAVEL_KM: f64 = 2500.0;

/// Situational flags derived from the two sides of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GameContext {
    pub divisional: bool,
    pub playoff: bool,
    pub playoff_push: bool,
    pub rivalry: bool,
    pub home_hot: bool,
    pub home_cold: bool,
    pub away_hot: bool,
    pub away_cold: bool,
    /// Home rest days minus away rest days.
    pub rest_diff: i32,
    pub away_travel: f64,
    pub back_to_back: bool,
    pub talent_gap: f64,
    pub win_pct_gap: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Playoff,
    PlayoffPush,
    Rivalry,
    Divisional,
    BackToBack,
    RestMismatch,
    StreakMismatch,
    Underdog,
    CloseMatchup,
    TravelFatigue,
}

impl GameContext {
    pub fn detect(home: &FeatureVector, away: &FeatureVector) -> Self {
        let importance = home.playoff_importance.max(away.playoff_importance);
        let playoff = importance > PLAYOFF_IMPORTANCE;
        Self {
            divisional: home.is_division_game || away.is_division_game,
            playoff,
            playoff_push: !playoff && importance > PLAYOFF_PUSH_IMPORTANCE,
            rivalry: home.is_rivalry_game || away.is_rivalry_game,
            home_hot: home.is_hot,
            home_cold: home.is_cold,
            away_hot: away.is_hot,
            away_cold: away.is_cold,
            rest_diff: home.rest_days - away.rest_days,
            away_travel: away.travel_distance.max(0.0),
            back_to_back: home.back_to_back || away.back_to_back,
            talent_gap: home.talent_rating - away.talent_rating,
            win_pct_gap: home.win_percentage - away.win_percentage,
        }
    }

    /// Every context that applies, in the fixed order nudges are applied.
    pub fn kinds(&self) -> Vec<ContextKind> {
        let mut out = Vec::new();
        if self.playoff {
            out.push(ContextKind::Playoff);
        }
        if self.playoff_push {
            out.push(ContextKind::PlayoffPush);
        }
        if self.rivalry {
            out.push(ContextKind::Rivalry);
        }
        if self.divisional {
            out.push(ContextKind::Divisional);
        }
        if self.back_to_back {
            out.push(ContextKind::BackToBack);
        }
        if self.rest_diff.abs() >= REST_MISMATCH_DAYS {
            out.push(ContextKind::RestMismatch);
        }
        if (self.home_hot && self.away_cold) || (self.away_hot && self.home_cold) {
            out.push(ContextKind::StreakMismatch);
        }
        let talent = self.talent_gap.abs();
        let win_pct = self.win_pct_gap.abs();
        if talent > UNDERDOG_TALENT_GAP || win_pct > UNDERDOG_WIN_PCT_GAP {
            out.push(ContextKind::Underdog);
        }
        if talent < CLOSE_TALENT_GAP && win_pct < CLOSE_WIN_PCT_GAP {
            out.push(ContextKind::CloseMatchup);
        }
        if self.away_travel > FATIGUE_TRAVEL_KM {
            out.push(ContextKind::TravelFatigue);
        }
        out
    }
}

impl ContextKind {
    pub fn label(self) -> &'static str {
        match self {
            ContextKind::Playoff => "playoff",
            ContextKind::PlayoffPush => "playoff_push",
            ContextKind::Rivalry => "rivalry",
            ContextKind::Divisional => "divisional",
            ContextKind::BackToBack => "back_to_back",
            ContextKind::RestMismatch => "rest_mismatch",
            ContextKind::StreakMismatch => "streak_mismatch",
            ContextKind::Underdog => "underdog",
            ContextKind::CloseMatchup => "close_matchup",
            ContextKind::TravelFatigue => "travel_fatigue",
        }
    }

    /// Raw per-family multipliers; families not listed keep their weight.
    fn multipliers(self) -> &'static [(ModelFamily, f64)] {
        use ModelFamily::*;
        match self {
            ContextKind::Playoff => &[
                (Statistical, 1.30),
                (Bayesian, 1.20),
                (Elo, 1.25),
                (MonteCarlo, 0.70),
                (NeuralNetwork, 1.10),
            ],
            ContextKind::PlayoffPush => &[(Statistical, 1.20), (Lstm, 1.30), (NeuralNetwork, 1.15)],
            ContextKind::Rivalry => &[
                (Statistical, 1.40),
                (Bayesian, 0.80),
                (MonteCarlo, 1.30),
                (Elo, 0.90),
            ],
            ContextKind::Divisional => &[(Statistical, 1.15), (Bayesian, 1.10), (MonteCarlo, 1.10)],
            ContextKind::BackToBack => &[
                (Statistical, 1.35),
                (Elo, 1.10),
                (Poisson, 1.10),
                (NeuralNetwork, 1.25),
                (GradientBoosting, 1.20),
                (RandomForest, 1.20),
            ],
            ContextKind::RestMismatch => &[(Statistical, 1.20), (Poisson, 1.10), (RandomForest, 1.10)],
            ContextKind::StreakMismatch => &[(Lstm, 1.30), (MonteCarlo, 1.15), (Elo, 0.90)],
            ContextKind::Underdog => &[
                (NeuralNetwork, 1.40),
                (GradientBoosting, 1.35),
                (RandomForest, 1.30),
                (Statistical, 0.75),
                (Elo, 0.70),
            ],
            ContextKind::CloseMatchup => &[
                (NeuralNetwork, 1.30),
                (GradientBoosting, 1.25),
                (Lstm, 1.20),
            ],
            ContextKind::TravelFatigue => &[
                (Statistical, 1.30),
                (NeuralNetwork, 1.25),
                (RandomForest, 1.20),
            ],
        }
    }

    fn multiplier_for(self, family: ModelFamily) -> f64 {
        self.multipliers()
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, m)| *m)
            .unwrap_or(1.0)
    }
}

/// Applies one context's nudge, limited so that no model's weight moves by
/// more than `cap` relative to its value before the nudge.
pub fn apply_context(weights: &WeightMap, kind: ContextKind, cap: f64) -> WeightMap {
    let candidate = WeightMap::normalized(
        weights
            .iter()
            .map(|(name, w)| (name.clone(), w * kind.multiplier_for(ModelFamily::from_name(name)))),
    );

    let mut worst = 0.0_f64;
    for (name, old) in weights.iter() {
        if *old <= 0.0 {
            continue;
        }
        let new = candidate.get(name).unwrap_or(*old);
        worst = worst.max((new - old).abs() / old);
    }

    if worst <= cap || worst <= 0.0 {
        return candidate;
    }

    // Blending two normalized maps keeps the sum at one and scales every
    // relative move by the same factor.
    let t = (cap / worst).clamp(0.0, 1.0);
    debug!(context = kind.label(), worst, t, "context nudge capped");
    WeightMap::normalized(weights.iter().map(|(name, old)| {
        let new = candidate.get(name).unwrap_or(*old);
        (name.clone(), old + t * (new - old))
    }))
}

pub fn adjust_for_context(weights: &WeightMap, ctx: &GameContext, cap: f64) -> WeightMap {
    ctx.kinds()
        .into_iter()
        .fold(weights.clone(), |acc, kind| apply_context(&acc, kind, cap))
}
