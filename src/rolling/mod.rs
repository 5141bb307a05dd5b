//! # Rolling Window Engine
//!
//! N-bucket trailing aggregation over any ordered bucket type. The engine walks back
//! from `as_of` with a caller-supplied step function, fetches each bucket (which may
//! be absent) and aggregates only the present values. Missing buckets are reported,
//! never invented.
//!
//! Historical buckets read the latest capture per bucket; strict as-of replay is left
//! to explicit [`CaptureStore::as_of`](crate::capture::CaptureStore::as_of) lookups.

pub mod trend;

pub use trend::{Trend, TrendClassifier, TrendDirection};

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;

use crate::error::{PipelineError, PipelineResult};

/// Result of one window computation. Buckets are listed oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult<B, A> {
    pub value: A,
    pub periods_present: usize,
    pub window_size: usize,
    pub is_complete: bool,
    pub buckets: Vec<B>,
    pub missing: Vec<B>,
}

pub struct RollingWindowEngine<B, F = fn(&B) -> B> {
    window_size: usize,
    step_back: F,
    _bucket: PhantomData<fn() -> B>,
}

impl<B, F> std::fmt::Debug for RollingWindowEngine<B, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollingWindowEngine")
            .field("window_size", &self.window_size)
            .finish_non_exhaustive()
    }
}

fn previous_week(date: &NaiveDate) -> NaiveDate {
    date.checked_sub_signed(Duration::days(7))
        .unwrap_or(NaiveDate::MIN)
}

impl RollingWindowEngine<NaiveDate> {
    /// Weekly buckets keyed by week-ending date.
    pub fn weekly(window_size: usize) -> PipelineResult<Self> {
        Self::new(window_size, previous_week as fn(&NaiveDate) -> NaiveDate)
    }
}

impl<B, F> RollingWindowEngine<B, F>
where
    B: Clone,
    F: Fn(&B) -> B,
{
    pub fn new(window_size: usize, step_back: F) -> PipelineResult<Self> {
        if window_size == 0 {
            return Err(PipelineError::InvalidState(
                "rolling window size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            window_size,
            step_back,
            _bucket: PhantomData,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// The `window_size` buckets ending at `as_of`, oldest first.
    pub fn buckets(&self, as_of: &B) -> Vec<B> {
        let mut buckets = Vec::with_capacity(self.window_size);
        let mut current = as_of.clone();
        for _ in 1..self.window_size {
            let previous = (self.step_back)(&current);
            buckets.push(current);
            current = previous;
        }
        buckets.push(current);
        buckets.reverse();
        buckets
    }

    /// Each bucket of the window paired with its fetched value, oldest first.
    pub fn series<V>(&self, as_of: &B, mut fetch: impl FnMut(&B) -> Option<V>) -> Vec<(B, Option<V>)> {
        self.buckets(as_of)
            .into_iter()
            .map(|b| {
                let v = fetch(&b);
                (b, v)
            })
            .collect()
    }

    pub fn compute<V, A>(
        &self,
        as_of: &B,
        fetch: impl FnMut(&B) -> Option<V>,
        aggregate: impl FnOnce(&[(B, V)]) -> A,
    ) -> WindowResult<B, A> {
        self.summarize(self.series(as_of, fetch), aggregate)
    }

    /// `compute` with a fallible, asynchronous fetch such as a capture lookup. The
    /// first fetch error aborts the computation.
    pub async fn compute_async<V, A, E, Fut>(
        &self,
        as_of: &B,
        mut fetch: impl FnMut(B) -> Fut,
        aggregate: impl FnOnce(&[(B, V)]) -> A,
    ) -> Result<WindowResult<B, A>, E>
    where
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let mut series = Vec::with_capacity(self.window_size);
        for bucket in self.buckets(as_of) {
            let value = fetch(bucket.clone()).await?;
            series.push((bucket, value));
        }
        Ok(self.summarize(series, aggregate))
    }

    fn summarize<V, A>(
        &self,
        series: Vec<(B, Option<V>)>,
        aggregate: impl FnOnce(&[(B, V)]) -> A,
    ) -> WindowResult<B, A> {
        let buckets: Vec<B> = series.iter().map(|(b, _)| b.clone()).collect();
        let mut present = Vec::with_capacity(series.len());
        let mut missing = Vec::new();
        for (bucket, value) in series {
            match value {
                Some(v) => present.push((bucket, v)),
                None => missing.push(bucket),
            }
        }

        let periods_present = present.len();
        WindowResult {
            value: aggregate(&present),
            periods_present,
            window_size: self.window_size,
            is_complete: periods_present == self.window_size,
            buckets,
            missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_weekly_buckets_oldest_first() {
        let engine = RollingWindowEngine::weekly(3).unwrap();
        assert_eq!(
            engine.buckets(&d(2025, 12, 26)),
            vec![d(2025, 12, 12), d(2025, 12, 19), d(2025, 12, 26)]
        );
    }

    #[test]
    fn test_partial_window_reports_missing() {
        let engine = RollingWindowEngine::weekly(4).unwrap();
        let data: HashMap<NaiveDate, f64> =
            [(d(2025, 12, 26), 10.0), (d(2025, 12, 12), 20.0)].into_iter().collect();

        let result = engine.compute(
            &d(2025, 12, 26),
            |w| data.get(w).copied(),
            |present| present.iter().map(|(_, v)| v).sum::<f64>(),
        );
        assert_eq!(result.value, 30.0);
        assert_eq!(result.periods_present, 2);
        assert!(!result.is_complete);
        assert_eq!(result.missing, vec![d(2025, 12, 5), d(2025, 12, 19)]);
    }

    #[test]
    fn test_generic_integer_buckets() {
        let engine = RollingWindowEngine::new(5, |b: &i64| b - 1).unwrap();
        let result = engine.compute(&10, |b| Some(*b), |present| present.len());
        assert!(result.is_complete);
        assert_eq!(result.buckets, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(RollingWindowEngine::weekly(0).is_err());
    }

    #[tokio::test]
    async fn test_compute_async_propagates_fetch_error() {
        let engine = RollingWindowEngine::new(3, |b: &i64| b - 1).unwrap();
        let ok = engine
            .compute_async(&3, |b| async move { Ok::<_, String>(Some(b * 2)) }, |p| p.len())
            .await
            .unwrap();
        assert_eq!(ok.value, 3);

        let err = engine
            .compute_async(
                &3,
                |b| async move {
                    if b == 2 {
                        Err("capture lookup failed".to_string())
                    } else {
                        Ok(Some(b))
                    }
                },
                |p: &[(i64, i64)]| p.len(),
            )
            .await;
        assert!(err.is_err());
    }
}
