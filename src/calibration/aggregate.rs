//! Sample aggregation with a bounded tolerance retry.
//!
//! A [`SampleAggregator`] supervises the collect-aggregate-retry loop of one
//! probing pass. It never moves anything itself: each physical contact and
//! each lift between contacts is requested from a [`SampleSource`].
//!
//! The median of an even-sized set is the lower-middle element, so the result
//! is always one of the measured values.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{AggregationMethod, ProbeParameters};
use crate::error::{AppResult, AutoZError};

/// Spread of a sample set, `max - min`. Zero for an empty set.
pub fn spread(samples: &[f64]) -> f64 {
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &z| {
            (lo.min(z), hi.max(z))
        });
    if samples.is_empty() {
        0.0
    } else {
        max - min
    }
}

/// Collapse `samples` with `method`; `None` for an empty set.
pub fn aggregate(samples: &[f64], method: AggregationMethod) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    match method {
        AggregationMethod::Mean => Some(samples.iter().sum::<f64>() / samples.len() as f64),
        AggregationMethod::Median => {
            let mut sorted = samples.to_vec();
            sorted.sort_by(f64::total_cmp);
            Some(sorted[(sorted.len() - 1) / 2])
        }
    }
}

/// Something that can produce one Z sample per physical contact.
#[async_trait]
pub trait SampleSource: Send {
    /// Take one contact and return its Z.
    async fn sample(&mut self) -> AppResult<f64>;

    /// Clear the trigger zone before the next contact.
    async fn retract(&mut self) -> AppResult<()>;
}

/// Result of a converged (or tolerated) sample set.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedSample {
    /// Aggregated Z
    pub value: f64,
    /// `max - min` of the accepted set
    pub spread: f64,
    /// Recollections performed
    pub retries: u32,
    /// The accepted set
    pub samples: Vec<f64>,
}

/// Collect-aggregate-retry supervisor for one probing pass.
#[derive(Debug, Clone, Copy)]
pub struct SampleAggregator {
    sample_count: u32,
    method: AggregationMethod,
    tolerance: f64,
    max_retries: u32,
}

impl SampleAggregator {
    /// Aggregator configured from the probe parameters.
    pub fn new(params: &ProbeParameters) -> Self {
        Self {
            sample_count: params.sample_count.max(1),
            method: params.aggregation_method,
            tolerance: params.tolerance,
            max_retries: params.max_retries,
        }
    }

    /// Evaluate one complete sample set.
    ///
    /// # Errors
    ///
    /// `ToleranceExceeded` when the spread is above tolerance; `retries` is
    /// reported as given.
    pub fn evaluate(&self, samples: &[f64], retries: u32) -> AppResult<AggregatedSample> {
        let value = aggregate(samples, self.method).ok_or_else(|| {
            AutoZError::Motion("no samples collected".to_string())
        })?;
        let spread = spread(samples);
        if spread > self.tolerance {
            return Err(AutoZError::ToleranceExceeded {
                spread,
                tolerance: self.tolerance,
                value,
                retries,
                samples: samples.to_vec(),
            });
        }
        Ok(AggregatedSample {
            value,
            spread,
            retries,
            samples: samples.to_vec(),
        })
    }

    /// Collect sample sets from `source` until one is within tolerance or the
    /// retry budget is spent.
    ///
    /// A single-sample configuration returns the lone reading unchanged.
    pub async fn collect<S: SampleSource + ?Sized>(
        &self,
        source: &mut S,
    ) -> AppResult<AggregatedSample> {
        if self.sample_count == 1 {
            let z = source.sample().await?;
            return Ok(AggregatedSample {
                value: z,
                spread: 0.0,
                retries: 0,
                samples: vec![z],
            });
        }

        let mut retries = 0;
        let mut samples = Vec::new();
        loop {
            let z = source.sample().await?;
            samples.push(z);
            debug!(sample = samples.len(), z, "probe sample");
            if samples.len() < self.sample_count as usize {
                source.retract().await?;
                continue;
            }

            match self.evaluate(&samples, retries) {
                Ok(result) => return Ok(result),
                Err(AutoZError::ToleranceExceeded { spread, .. }) if retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        spread,
                        tolerance = self.tolerance,
                        retry = retries,
                        "Probe samples exceed tolerance. Retrying..."
                    );
                    samples.clear();
                    source.retract().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
