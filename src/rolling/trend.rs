//! Trend classification over a window's values.
//!
//! The leading sub-window is the most recent `leading` buckets; the trailing
//! sub-window is the `trailing` buckets before it. Each side averages its present
//! values. The change is `(lead - trail) / |trail| * 100`, undefined when the trailing
//! average is zero.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub direction: TrendDirection,
    pub pct_change: Option<f64>,
    pub leading_avg: Option<f64>,
    pub trailing_avg: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendClassifier {
    leading: usize,
    trailing: usize,
    threshold_pct: f64,
}

fn average(values: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

impl TrendClassifier {
    /// `threshold_pct` is inclusive: a change of exactly the threshold is a move.
    pub fn new(leading: usize, trailing: usize, threshold_pct: f64) -> Self {
        Self {
            leading: leading.max(1),
            trailing: trailing.max(1),
            threshold_pct: threshold_pct.abs(),
        }
    }

    /// Classify `values`, ordered oldest first.
    pub fn classify(&self, values: &[Option<f64>]) -> Trend {
        let lead_start = values.len().saturating_sub(self.leading);
        let trail_start = lead_start.saturating_sub(self.trailing);

        let leading_avg = average(&values[lead_start..]);
        let trailing_avg = average(&values[trail_start..lead_start]);

        let (direction, pct_change) = match (leading_avg, trailing_avg) {
            (Some(lead), Some(trail)) if trail != 0.0 => {
                let pct = (lead - trail) / trail.abs() * 100.0;
                let direction = if pct >= self.threshold_pct {
                    TrendDirection::Up
                } else if pct <= -self.threshold_pct {
                    TrendDirection::Down
                } else {
                    TrendDirection::Flat
                };
                (direction, Some(pct))
            }
            // Percentage is undefined from a zero base; only the sign is known.
            (Some(lead), Some(_)) if lead > 0.0 => (TrendDirection::Up, None),
            (Some(lead), Some(_)) if lead < 0.0 => (TrendDirection::Down, None),
            _ => (TrendDirection::Flat, None),
        };

        Trend {
            direction,
            pct_change,
            leading_avg,
            trailing_avg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_down_flat() {
        let classifier = TrendClassifier::new(2, 2, 10.0);
        let up = classifier.classify(&[Some(100.0), Some(100.0), Some(120.0), Some(120.0)]);
        assert_eq!(up.direction, TrendDirection::Up);
        assert!((up.pct_change.unwrap() - 20.0).abs() < 1e-9);

        let down = classifier.classify(&[Some(100.0), Some(100.0), Some(80.0), Some(80.0)]);
        assert_eq!(down.direction, TrendDirection::Down);

        let flat = classifier.classify(&[Some(100.0), Some(100.0), Some(105.0), Some(105.0)]);
        assert_eq!(flat.direction, TrendDirection::Flat);
    }

    #[test]
    fn test_missing_values_are_skipped() {
        let classifier = TrendClassifier::new(2, 2, 5.0);
        let trend = classifier.classify(&[Some(50.0), None, None, Some(60.0)]);
        assert_eq!(trend.leading_avg, Some(60.0));
        assert_eq!(trend.trailing_avg, Some(50.0));
        assert_eq!(trend.direction, TrendDirection::Up);
    }

    #[test]
    fn test_zero_base_has_no_percentage() {
        let classifier = TrendClassifier::new(1, 1, 5.0);
        let trend = classifier.classify(&[Some(0.0), Some(3.0)]);
        assert_eq!(trend.pct_change, None);
        assert_eq!(trend.direction, TrendDirection::Up);

        let empty = classifier.classify(&[None, None]);
        assert_eq!(empty.direction, TrendDirection::Flat);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let classifier = TrendClassifier::new(1, 1, 10.0);
        assert_eq!(
            classifier.classify(&[Some(100.0), Some(110.0)]).direction,
            TrendDirection::Up
        );
    }
}
