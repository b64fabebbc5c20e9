//! Reference descriptor aggregation for enrollment.
//!
//! A single live capture is noisy (motion blur, pose, lighting). Enrollment
//! collects many short-interval samples of the same face and reduces them to
//! their component-wise mean.

use crate::types::Descriptor;
use thiserror::Error;

/// Default number of samples gathered before a reference descriptor is built.
pub const DEFAULT_ENROLL_SAMPLES: usize = 30;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregateError {
    #[error("need at least {required} descriptor samples, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },
    #[error("sample {index} has {actual} values, expected {expected}")]
    DescriptorLengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Reduce `samples` to their component-wise arithmetic mean.
///
/// Fails when fewer than `min_samples` (and never fewer than one) are given,
/// or when sample lengths differ.
pub fn aggregate(samples: &[Descriptor], min_samples: usize) -> Result<Descriptor, AggregateError> {
    let required = min_samples.max(1);
    if samples.len() < required {
        return Err(AggregateError::InsufficientSamples {
            required,
            actual: samples.len(),
        });
    }

    let dim = samples[0].len();
    if let Some((index, bad)) = samples.iter().enumerate().find(|(_, s)| s.len() != dim) {
        return Err(AggregateError::DescriptorLengthMismatch {
            index,
            expected: dim,
            actual: bad.len(),
        });
    }

    // Each component is summed in sorted order so the mean does not depend on
    // the order samples were taken in.
    let n = samples.len() as f64;
    let mut column = Vec::with_capacity(samples.len());
    let mean: Vec<f32> = (0..dim)
        .map(|i| {
            column.clear();
            column.extend(samples.iter().map(|s| f64::from(s.values()[i])));
            column.sort_unstable_by(f64::total_cmp);
            (column.iter().sum::<f64>() / n) as f32
        })
        .collect();

    tracing::debug!(samples = samples.len(), dim, "aggregated reference descriptor");

    Ok(Descriptor::from_validated_mean(mean))
}

/// Collects descriptor samples for one enrollment session.
///
/// Frames in which the detector found no face are skipped and do not count
/// toward the target.
#[derive(Debug, Clone)]
pub struct Enrollment {
    target: usize,
    samples: Vec<Descriptor>,
    skipped: usize,
}

impl Enrollment {
    pub fn new(target: usize) -> Self {
        let target = target.max(1);
        Self {
            target,
            samples: Vec::with_capacity(target),
            skipped: 0,
        }
    }

    /// Offer the detector output for one frame. Returns true if it was kept.
    pub fn offer(&mut self, detection: Option<Descriptor>) -> bool {
        match detection {
            Some(d) if !self.is_complete() => {
                self.samples.push(d);
                true
            }
            Some(_) => false,
            None => {
                self.skipped += 1;
                false
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.target
    }

    /// Fraction of the target collected, in [0, 1].
    pub fn progress(&self) -> f32 {
        (self.samples.len() as f32 / self.target as f32).min(1.0)
    }

    pub fn collected(&self) -> usize {
        self.samples.len()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn finish(self, min_samples: usize) -> Result<Descriptor, AggregateError> {
        aggregate(&self.samples, min_samples)
    }
}
