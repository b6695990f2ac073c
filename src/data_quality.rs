use serde::Serialize;

use crate::features::FeatureVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityIssue {
    pub kind: &'static str,
    pub severity: Severity,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAssessment {
    /// 0..100.
    pub overall_score: f64,
    /// Multiplier applied to ensemble confidence, 0.7..1.3.
    pub confidence_impact: f64,
    pub completeness: f64,
    pub plausibility: f64,
    pub consistency: f64,
    pub issues: Vec<QualityIssue>,
}

pub trait DataQuality: Send + Sync {
    fn assess(&self, features: &FeatureVector) -> QualityAssessment;
}

/// Scores a feature vector by how many core signals are present and sane.
#[derive(Debug, Clone, Default)]
pub struct SignalCoverage;

impl DataQuality for SignalCoverage {
    fn assess(&self, fv: &FeatureVector) -> QualityAssessment {
        let completeness = completeness(fv);
        let plausibility = plausibility(fv);
        let consistency = consistency(fv);
        let overall_score =
            (completeness * 0.40 + plausibility * 0.35 + consistency * 0.25).clamp(0.0, 100.0);

        let mut issues = Vec::new();
        if fv.win_percentage <= 0.0 {
            issues.push(QualityIssue {
                kind: "missing_critical_data",
                severity: Severity::High,
                detail: format!("{}: win percentage missing", fv.team_code),
            });
        }
        if completeness < 50.0 {
            issues.push(QualityIssue {
                kind: "sparse_signals",
                severity: Severity::Medium,
                detail: format!("{}: {completeness:.0}% of core signals present", fv.team_code),
            });
        }
        if consistency < 80.0 {
            issues.push(QualityIssue {
                kind: "data_inconsistency",
                severity: Severity::Medium,
                detail: format!("{}: rating and form disagree with record", fv.team_code),
            });
        }

        QualityAssessment {
            overall_score,
            confidence_impact: confidence_impact(overall_score, &issues),
            completeness,
            plausibility,
            consistency,
            issues,
        }
    }
}

pub fn confidence_impact(overall_score: f64, issues: &[QualityIssue]) -> f64 {
    let critical = issues.iter().filter(|i| i.severity == Severity::High).count();
    let bonus = (overall_score - 50.0) / 50.0 * 0.2;
    (1.0 + bonus - 0.1 * critical as f64).clamp(0.7, 1.3)
}

fn completeness(fv: &FeatureVector) -> f64 {
    let present = [
        fv.win_percentage > 0.0,
        fv.goals_for_per_game > 0.0,
        fv.goals_against_per_game > 0.0,
        fv.recent_form > 0.0,
        fv.rating > 0.0,
        fv.talent_rating > 0.0,
        fv.rest_days > 0,
        fv.top_scorer_form > 0.0,
        fv.depth_form > 0.0,
    ];
    let n = present.iter().filter(|p| **p).count();
    n as f64 / present.len() as f64 * 100.0
}

fn plausibility(fv: &FeatureVector) -> f64 {
    let mut score: f64 = 100.0;
    if !(0.0..=1.0).contains(&fv.win_percentage) {
        score -= 20.0;
    }
    if !(0.0..=8.0).contains(&fv.goals_for_per_game) {
        score -= 10.0;
    }
    if !(0.0..=8.0).contains(&fv.goals_against_per_game) {
        score -= 10.0;
    }
    if !(0.0..=1.0).contains(&fv.recent_form) {
        score -= 15.0;
    }
    if fv.travel_distance < 0.0 {
        score -= 10.0;
    }
    score.clamp(0.0, 100.0)
}

fn consistency(fv: &FeatureVector) -> f64 {
    let mut score: f64 = 90.0;
    if fv.talent_rating > 0.0 {
        let gap = (fv.talent_rating - fv.win_percentage).abs();
        if gap > 0.2 {
            score -= 15.0;
        } else if gap > 0.1 {
            score -= 5.0;
        }
    }
    if fv.is_hot && fv.recent_form > 0.0 && fv.recent_form < 0.6 {
        score -= 8.0;
    }
    if fv.is_hot && fv.is_cold {
        score -= 20.0;
    }
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> FeatureVector {
        let mut fv = FeatureVector::new("COL");
        fv.win_percentage = 0.62;
        fv.goals_for_per_game = 3.4;
        fv.goals_against_per_game = 2.7;
        fv.recent_form = 0.7;
        fv.rating = 1580.0;
        fv.talent_rating = 0.6;
        fv.rest_days = 2;
        fv.top_scorer_form = 0.8;
        fv.depth_form = 0.55;
        fv
    }

    #[test]
    fn complete_vector_scores_high() {
        let a = SignalCoverage.assess(&full());
        assert_eq!(a.completeness, 100.0);
        assert!(a.issues.is_empty());
        assert!(a.overall_score > 90.0);
        assert!(a.confidence_impact > 1.1 && a.confidence_impact <= 1.3);
    }

    #[test]
    fn empty_vector_is_penalized_but_bounded() {
        let a = SignalCoverage.assess(&FeatureVector::new("XXX"));
        assert_eq!(a.completeness, 0.0);
        assert!(a.issues.iter().any(|i| i.severity == Severity::High));
        assert!(a.confidence_impact >= 0.7 && a.confidence_impact < 1.0);
    }

    #[test]
    fn impact_formula_matches_reference_points() {
        assert!((confidence_impact(50.0, &[]) - 1.0).abs() < 1e-12);
        assert!((confidence_impact(100.0, &[]) - 1.2).abs() < 1e-12);
        assert_eq!(confidence_impact(0.0, &[]), 0.8);
    }
}
