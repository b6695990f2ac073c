use serde::{Deserialize, Serialize};

const PROB_FLOOR: f64 = 0.001;
const PROB_CEIL: f64 = 0.999;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub brier: f64,
    pub log_loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

/// Scores probabilities that an event happens against what actually happened.
pub fn evaluate_binary(predictions: &[f64], outcomes: &[bool]) -> Metrics {
    if predictions.is_empty() || predictions.len() != outcomes.len() {
        return Metrics::default();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0usize;

    for (p, hit) in predictions.iter().zip(outcomes) {
        let p = p.clamp(0.0, 1.0);
        let y = if *hit { 1.0 } else { 0.0 };
        brier_sum += (p - y).powi(2);

        let q = p.clamp(PROB_FLOOR, PROB_CEIL);
        log_loss_sum += -(y * q.ln() + (1.0 - y) * (1.0 - q).ln());

        if (p >= 0.5) == *hit {
            correct += 1;
        }
    }

    let n = predictions.len() as f64;
    Metrics {
        samples: predictions.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
    }
}

pub fn reliability_bins(predictions: &[f64], outcomes: &[bool], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for (p, hit) in predictions.iter().zip(outcomes) {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        if *hit {
            actual_sum[idx] += 1.0;
        }
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (avg_pred, actual_rate) = if count > 0 {
                (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                avg_pred,
                actual_rate,
            }
        })
        .collect()
}

/// Monotone step function fit with pool-adjacent-violators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicCurve {
    breakpoints: Vec<f64>,
    values: Vec<f64>,
}

impl IsotonicCurve {
    /// Returns `None` when there is nothing to fit.
    pub fn fit(scores: &[f64], outcomes: &[bool]) -> Option<Self> {
        let mut pairs: Vec<(f64, f64)> = scores
            .iter()
            .zip(outcomes)
            .filter(|(s, _)| s.is_finite())
            .map(|(s, hit)| (*s, if *hit { 1.0 } else { 0.0 }))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        // (label sum, count, score sum)
        let mut blocks: Vec<(f64, usize, f64)> = Vec::with_capacity(pairs.len());
        for (score, label) in pairs {
            blocks.push((label, 1, score));
            while blocks.len() >= 2 {
                let last = blocks[blocks.len() - 1];
                let prev = blocks[blocks.len() - 2];
                if prev.0 / prev.1 as f64 <= last.0 / last.1 as f64 {
                    break;
                }
                blocks.pop();
                if let Some(merged) = blocks.last_mut() {
                    merged.0 += last.0;
                    merged.1 += last.1;
                    merged.2 += last.2;
                }
            }
        }

        let breakpoints = blocks.iter().map(|b| b.2 / b.1 as f64).collect();
        let values = blocks
            .iter()
            .map(|b| (b.0 / b.1 as f64).clamp(0.0, 1.0))
            .collect();
        Some(Self { breakpoints, values })
    }

    pub fn apply(&self, raw: f64) -> f64 {
        if !raw.is_finite() || self.values.is_empty() {
            return raw;
        }
        match self.breakpoints.binary_search_by(|bp| bp.total_cmp(&raw)) {
            Ok(idx) => self.values[idx],
            Err(0) => self.values[0],
            Err(idx) if idx >= self.breakpoints.len() => self.values[self.values.len() - 1],
            Err(idx) => self.values[idx - 1],
        }
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}

/// Wilson score interval for a proportion at 95% confidence.
pub fn wilson_interval(successes: usize, n: usize) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    const Z: f64 = 1.96;
    let n = n as f64;
    let p = successes as f64 / n;
    let z2 = Z * Z;
    let denom = 1.0 + z2 / n;
    let centre = (p + z2 / (2.0 * n)) / denom;
    let half = Z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;
    ((centre - half).max(0.0), (centre + half).min(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_have_zero_brier() {
        let m = evaluate_binary(&[1.0, 0.0, 1.0], &[true, false, true]);
        assert_eq!(m.samples, 3);
        assert!(m.brier < 1e-12);
        assert_eq!(m.accuracy, 1.0);
        // log loss is clamped, never infinite
        assert!(m.log_loss.is_finite());
    }

    #[test]
    fn mismatched_lengths_yield_empty_metrics() {
        assert_eq!(evaluate_binary(&[0.5], &[]), Metrics::default());
    }

    #[test]
    fn reliability_bins_cover_unit_interval() {
        let preds = [0.05, 0.55, 0.58, 0.95, 1.0];
        let hits = [false, true, false, true, true];
        let bins = reliability_bins(&preds, &hits, 10);
        assert_eq!(bins.len(), 10);
        assert_eq!(bins[5].count, 2);
        assert!((bins[5].actual_rate - 0.5).abs() < 1e-12);
        assert_eq!(bins[9].count, 2);
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 5);
    }

    #[test]
    fn isotonic_curve_is_monotone() {
        let scores = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        let hits = [false, true, false, false, true, false, true, true];
        let curve = IsotonicCurve::fit(&scores, &hits).unwrap();
        let mut last = -1.0;
        for i in 0..=20 {
            let v = curve.apply(i as f64 / 20.0);
            assert!(v >= last);
            assert!((0.0..=1.0).contains(&v));
            last = v;
        }
    }

    #[test]
    fn isotonic_fit_of_nothing_is_none() {
        assert!(IsotonicCurve::fit(&[], &[]).is_none());
        assert!(IsotonicCurve::fit(&[f64::NAN], &[true]).is_none());
    }

    #[test]
    fn wilson_interval_brackets_rate() {
        let (lo, hi) = wilson_interval(70, 100);
        assert!(lo < 0.7 && hi > 0.7);
        assert!(lo > 0.55 && hi < 0.85);
        assert_eq!(wilson_interval(0, 0), (0.0, 1.0));
    }
}
