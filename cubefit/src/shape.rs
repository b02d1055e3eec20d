//! Cross-slice aggregation of the wavelength-independent shape
//! parameters.
//!
//! Ellipticity, position angle, the core/tail width ratio and the Moffat
//! power vary slowly enough with wavelength to be treated as constants of
//! an exposure. Converged per-slice estimates are combined by
//! inverse-variance weighting after a single rejection pass against the
//! first-round mean.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExtractionError;
use crate::fitter::SliceFitResult;
use crate::psf::FitParameter;

/// Error floor applied to per-slice uncertainties, so forced or
/// numerically perfect fits cannot collapse the weighting.
const ERROR_FLOOR: f64 = 1e-6;

/// An inverse-variance weighted scalar estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedMean {
    pub value: f64,
    pub error: f64,
}

fn weighted_mean(samples: &[FitParameter]) -> WeightedMean {
    let mut wsum = 0.0;
    let mut vsum = 0.0;
    for s in samples {
        let e = s.error.max(ERROR_FLOOR);
        let w = 1.0 / (e * e);
        wsum += w;
        vsum += w * s.value;
    }
    WeightedMean {
        value: vsum / wsum,
        error: (1.0 / wsum).sqrt(),
    }
}

/// Aggregated PSF shape across the slices of one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeEstimate {
    pub ell: WeightedMean,
    pub theta: WeightedMean,
    pub stddev_ratio: WeightedMean,
    pub alpha: WeightedMean,
    /// Slice indices excluded by the rejection rule.
    pub rejected: Vec<usize>,
    /// Converged slices that survived rejection.
    pub n_used: usize,
}

fn shape_of(fit: &SliceFitResult) -> [FitParameter; 4] {
    [
        fit.params.ell,
        fit.params.theta,
        fit.params.stddev_ratio,
        fit.params.alpha,
    ]
}

impl ShapeEstimate {
    /// Aggregate the converged fits of one pass.
    ///
    /// A slice is rejected when any of its four shape parameters lies
    /// more than `rejection_sigma` of its own fitted uncertainty away
    /// from the all-slice weighted mean; the means are then recomputed
    /// over the survivors. Fails when no converged slice remains.
    pub fn aggregate(
        fits: &[SliceFitResult],
        rejection_sigma: f64,
    ) -> Result<Self, ExtractionError> {
        let converged: Vec<&SliceFitResult> = fits.iter().filter(|f| f.converged).collect();
        if converged.is_empty() {
            return Err(ExtractionError::InsufficientData { needed: 1, got: 0 });
        }

        let mut first = [WeightedMean {
            value: 0.0,
            error: 0.0,
        }; 4];
        for k in 0..4 {
            let samples: Vec<FitParameter> = converged.iter().map(|f| shape_of(f)[k]).collect();
            first[k] = weighted_mean(&samples);
        }

        let mut rejected = Vec::new();
        let survivors: Vec<&SliceFitResult> = converged
            .iter()
            .filter(|f| {
                let outlying = shape_of(f).iter().zip(&first).any(|(p, mean)| {
                    (p.value - mean.value).abs() > rejection_sigma * p.error.max(ERROR_FLOOR)
                });
                if outlying {
                    rejected.push(f.index);
                }
                !outlying
            })
            .copied()
            .collect();
        if survivors.is_empty() {
            return Err(ExtractionError::InsufficientData {
                needed: 1,
                got: 0,
            });
        }

        let mut refined = first;
        for k in 0..4 {
            let samples: Vec<FitParameter> = survivors.iter().map(|f| shape_of(f)[k]).collect();
            refined[k] = weighted_mean(&samples);
        }

        debug!(
            "shape aggregate: {} slices used, {} rejected, ell={:.4} theta={:.4}",
            survivors.len(),
            rejected.len(),
            refined[0].value,
            refined[1].value
        );

        Ok(Self {
            ell: refined[0],
            theta: refined[1],
            stddev_ratio: refined[2],
            alpha: refined[3],
            rejected,
            n_used: survivors.len(),
        })
    }
}
