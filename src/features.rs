use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Signals describing one side of a matchup.
///
/// Enrichment providers fill this in; the ensemble only reads the named
/// fields below and leaves everything else in `signals` for the predictors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureVector {
    pub team_code: String,
    pub win_percentage: f64,
    pub is_hot: bool,
    pub is_cold: bool,
    pub rest_days: i32,
    /// Kilometres travelled since the previous game.
    pub travel_distance: f64,
    pub back_to_back: bool,

    pub goals_for_per_game: f64,
    pub goals_against_per_game: f64,
    /// Points share over the last ten games, 0..1.
    pub recent_form: f64,
    pub rating: f64,
    /// Aggregate roster strength, 0..1.
    pub talent_rating: f64,

    pub top_scorer_form: f64,
    pub depth_form: f64,

    pub is_rivalry_game: bool,
    pub is_division_game: bool,
    /// 0 = regular season, >0 = elimination stakes.
    pub playoff_importance: f64,

    #[serde(flatten)]
    pub signals: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn new(team_code: impl Into<String>) -> Self {
        Self {
            team_code: team_code.into(),
            ..Self::default()
        }
    }

    pub fn signal(&self, key: &str) -> Option<f64> {
        self.signals.get(key).copied().filter(|v| v.is_finite())
    }

    /// Whether player-level form data was supplied for this side.
    pub fn has_player_signals(&self) -> bool {
        self.top_scorer_form > 0.0 && self.depth_form > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_json_keys_land_in_signals() {
        let raw = r#"{"team_code":"TOR","win_percentage":0.61,"goalie_advantage":0.12,"pp_pct":0.24}"#;
        let fv: FeatureVector = serde_json::from_str(raw).unwrap();
        assert_eq!(fv.team_code, "TOR");
        assert_eq!(fv.signal("goalie_advantage"), Some(0.12));
        assert_eq!(fv.signal("pp_pct"), Some(0.24));
        assert_eq!(fv.signal("missing"), None);
        assert!(!fv.has_player_signals());
    }
}
