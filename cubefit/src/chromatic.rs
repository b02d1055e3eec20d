//! Chromatic PSF description assembled between the passes: aggregated
//! shape, seeing-width power law, and refraction trajectory, plus the
//! forced re-fit that turns them into per-slice priors at arbitrary
//! wavelengths.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adr::{weighted_line_fit, AdrModel};
use crate::binning::WavelengthBin;
use crate::config::ForceFlags;
use crate::cube::Cube;
use crate::error::ExtractionError;
use crate::fitter::{
    fit_slice, FitPriors, ParamPrior, SliceFitResult, DEFAULT_ALPHA_BOUNDS,
    DEFAULT_STDDEV_BOUNDS, DEFAULT_STDDEV_RATIO_BOUNDS,
};
use crate::psf::PsfModel;
use crate::shape::{ShapeEstimate, WeightedMean};
use crate::slice::Slice;

/// Default chromatic exponent of the seeing width (Kolmogorov-like
/// turbulence), used when too few slices constrain it.
pub const DEFAULT_WIDTH_EXPONENT: f64 = -0.2;

/// Ellipticity must stay clear of `q = 0`.
const ELL_LIMITS: (f64, f64) = (0.0, 0.9);

/// Narrowest half-width of a shape-parameter box derived from an
/// aggregate uncertainty.
const MIN_BOUND_HALF_WIDTH: f64 = 1e-4;

/// Seeing-width power law, `stddev(lbda) = stddev_ref * (lbda /
/// lbda_ref)^exponent`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WidthLaw {
    pub lbda_ref: f64,
    pub stddev_ref: f64,
    pub stddev_ref_err: f64,
    pub exponent: f64,
    pub exponent_err: f64,
}

impl WidthLaw {
    pub fn predict(&self, lbda: f64) -> f64 {
        self.stddev_ref * (lbda / self.lbda_ref).powf(self.exponent)
    }

    /// Weighted power-law fit in log-log space through `(lbda, stddev,
    /// stddev_err)` samples.
    ///
    /// Non-positive or non-finite widths are dropped. When fewer than
    /// two distinct wavelengths survive, the exponent falls back to
    /// [`DEFAULT_WIDTH_EXPONENT`] and only the reference width is
    /// estimated.
    pub fn fit(samples: &[(f64, f64, f64)], lbda_ref: f64) -> Result<Self, ExtractionError> {
        let usable: Vec<(f64, f64, f64)> = samples
            .iter()
            .filter(|(lbda, stddev, _)| {
                lbda.is_finite() && *lbda > 0.0 && stddev.is_finite() && *stddev > 0.0
            })
            .copied()
            .collect();
        if usable.is_empty() {
            return Err(ExtractionError::InsufficientData { needed: 1, got: 0 });
        }

        // relative width error becomes additive in log space
        let abscissa: Vec<f64> = usable.iter().map(|(l, _, _)| (l / lbda_ref).ln()).collect();
        let value: Vec<f64> = usable.iter().map(|(_, s, _)| s.ln()).collect();
        let weight: Vec<f64> = usable
            .iter()
            .map(|(_, s, e)| {
                let rel = (e / s).max(1e-6);
                1.0 / (rel * rel)
            })
            .collect();

        if let Some(line) = weighted_line_fit(&abscissa, &value, &weight) {
            let stddev_ref = line.intercept.exp();
            return Ok(Self {
                lbda_ref,
                stddev_ref,
                stddev_ref_err: stddev_ref * line.intercept_err,
                exponent: line.slope,
                exponent_err: line.slope_err,
            });
        }

        // single wavelength: impose the default exponent and scale the
        // weighted mean width to the reference
        let exponent = DEFAULT_WIDTH_EXPONENT;
        let mut wsum = 0.0;
        let mut vsum = 0.0;
        for &(lbda, stddev, err) in &usable {
            let scaled = stddev / (lbda / lbda_ref).powf(exponent);
            let e = err.max(1e-6);
            let w = 1.0 / (e * e);
            wsum += w;
            vsum += w * scaled;
        }
        Ok(Self {
            lbda_ref,
            stddev_ref: vsum / wsum,
            stddev_ref_err: (1.0 / wsum).sqrt(),
            exponent,
            exponent_err: 0.0,
        })
    }
}

/// Bounded prior centred on an aggregate estimate: `value +/- sigma *
/// error`, optionally intersected with hard limits.
pub(crate) fn shape_prior(
    mean: WeightedMean,
    sigma: f64,
    limits: Option<(f64, f64)>,
) -> ParamPrior {
    let half = (sigma * mean.error).max(MIN_BOUND_HALF_WIDTH);
    let mut lo = mean.value - half;
    let mut hi = mean.value + half;
    if let Some((hard_lo, hard_hi)) = limits {
        lo = lo.max(hard_lo);
        hi = hi.min(hard_hi);
    }
    ParamPrior::guessed(mean.value.clamp(lo, hi), (lo, hi))
}

/// Everything the final pass knows about the PSF as a function of
/// wavelength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChromaticProfileModel {
    pub shape: ShapeEstimate,
    pub width: WidthLaw,
    pub adr: AdrModel,
}

impl ChromaticProfileModel {
    /// Priors for one slice of the final pass: shape and centroid
    /// evaluated at `lbda`, forced or boxed per `flags`. Amplitude and
    /// background always stay free.
    ///
    /// Non-forced shape parameters stay free inside a box of twice the
    /// aggregate uncertainty around the aggregate value.
    pub fn priors_at(&self, lbda: f64, flags: &ForceFlags, centroid_err: (f64, f64)) -> FitPriors {
        let (x, y) = self.adr.predict(lbda);
        let stddev = self.width.predict(lbda);

        let boxed = |mean: WeightedMean, limits: Option<(f64, f64)>| shape_prior(mean, 2.0, limits);

        FitPriors {
            centroid: Some((x, y)),
            centroid_err,
            force_centroid: flags.force_centroid,
            stddev: if flags.force_stddev {
                ParamPrior::forced(stddev)
            } else {
                ParamPrior::guessed(stddev, DEFAULT_STDDEV_BOUNDS)
            },
            // the width ratio travels with the width switch
            stddev_ratio: if flags.force_stddev {
                ParamPrior::forced(self.shape.stddev_ratio.value)
            } else {
                boxed(self.shape.stddev_ratio, Some(DEFAULT_STDDEV_RATIO_BOUNDS))
            },
            ell: if flags.force_ellipse {
                ParamPrior::forced(self.shape.ell.value)
            } else {
                boxed(self.shape.ell, Some(ELL_LIMITS))
            },
            theta: if flags.force_ellipse {
                ParamPrior::forced(self.shape.theta.value)
            } else {
                boxed(self.shape.theta, None)
            },
            alpha: if flags.force_alpha {
                ParamPrior::forced(self.shape.alpha.value)
            } else {
                boxed(self.shape.alpha, Some(DEFAULT_ALPHA_BOUNDS))
            },
        }
    }

    /// Fit every bin with the chromatic model imposed.
    ///
    /// Binning problems abort the pass; a slice that cannot be fit is
    /// recorded as a flagged failure so the output stays aligned with
    /// the bins.
    pub fn force_fit(
        &self,
        cube: &Cube,
        bins: &[WavelengthBin],
        model: &dyn PsfModel,
        flags: &ForceFlags,
        centroid_err: (f64, f64),
    ) -> Result<Vec<SliceFitResult>, ExtractionError> {
        let slices: Vec<Slice> = bins
            .iter()
            .enumerate()
            .map(|(i, bin)| Slice::extract(cube, *bin, i))
            .collect::<Result<_, _>>()?;
        Ok(slices
            .par_iter()
            .map(|slice| {
                let priors = self.priors_at(slice.lbda(), flags, centroid_err);
                match fit_slice(slice, model, &priors) {
                    Ok(fit) => fit,
                    Err(err) => {
                        warn!("slice {} dropped from forced pass: {err}", slice.index());
                        SliceFitResult::failed(
                            slice.index(),
                            *slice.bin(),
                            model.family(),
                            model.background(),
                        )
                    }
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cube::{Header, SpaxelFrame};
    use crate::psf::{BackgroundKind, ProfileFamily};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::{Array1, Array2};
    use std::sync::Arc;

    #[test]
    fn width_law_recovers_a_power_law() {
        let truth = WidthLaw {
            lbda_ref: 6000.0,
            stddev_ref: 1.4,
            stddev_ref_err: 0.0,
            exponent: -0.25,
            exponent_err: 0.0,
        };
        let samples: Vec<(f64, f64, f64)> = (0..8)
            .map(|i| {
                let lbda = 4500.0 + 500.0 * i as f64;
                (lbda, truth.predict(lbda), 0.02)
            })
            .collect();
        let fitted = WidthLaw::fit(&samples, 6000.0).unwrap();
        assert_relative_eq!(fitted.stddev_ref, 1.4, max_relative = 1e-9);
        assert_relative_eq!(fitted.exponent, -0.25, max_relative = 1e-9);
        assert!(fitted.exponent_err > 0.0);
    }

    #[test]
    fn width_law_falls_back_on_a_single_wavelength() {
        let fitted = WidthLaw::fit(&[(5000.0, 1.6, 0.05)], 6000.0).unwrap();
        assert_eq!(fitted.exponent, DEFAULT_WIDTH_EXPONENT);
        // the sample itself must be reproduced
        assert_relative_eq!(fitted.predict(5000.0), 1.6, max_relative = 1e-12);
        assert!(fitted.predict(7000.0) < fitted.predict(5000.0));
    }

    #[test]
    fn width_law_drops_unusable_samples() {
        let samples = [
            (5000.0, 1.5, 0.02),
            (5500.0, f64::NAN, 0.02),
            (6000.0, -2.0, 0.02),
            (6500.0, 1.4, 0.02),
        ];
        let fitted = WidthLaw::fit(&samples, 6000.0).unwrap();
        assert!(fitted.stddev_ref.is_finite());
        assert!(matches!(
            WidthLaw::fit(&[(5000.0, f64::NAN, 0.02)], 6000.0),
            Err(ExtractionError::InsufficientData { .. })
        ));
    }

    fn toy_chromatic_model() -> ChromaticProfileModel {
        let mean = |value| WeightedMean { value, error: 0.02 };
        ChromaticProfileModel {
            shape: ShapeEstimate {
                ell: mean(0.12),
                theta: mean(0.4),
                stddev_ratio: mean(2.1),
                alpha: mean(2.4),
                rejected: vec![],
                n_used: 6,
            },
            width: WidthLaw {
                lbda_ref: 6000.0,
                stddev_ref: 1.3,
                stddev_ref_err: 0.02,
                exponent: -0.2,
                exponent_err: 0.01,
            },
            adr: AdrModel::from_parameters(6000.0, 0.43, 1.15, 0.7, 0.4, -0.3),
        }
    }

    #[test]
    fn forced_priors_pin_every_shape_slot() {
        let model = toy_chromatic_model();
        let flags = ForceFlags::default();
        let priors = model.priors_at(5000.0, &flags, (5.0, 5.0));
        assert!(priors.force_centroid);
        assert!(priors.stddev.forced);
        assert!(priors.stddev_ratio.forced);
        assert!(priors.ell.forced);
        assert!(priors.theta.forced);
        assert!(priors.alpha.forced);
        assert_eq!(priors.ell.guess, Some(0.12));
        assert_relative_eq!(
            priors.stddev.guess.unwrap(),
            1.3 * (5000.0_f64 / 6000.0).powf(-0.2),
            max_relative = 1e-12
        );
        assert_eq!(priors.centroid, Some(model.adr.predict(5000.0)));
    }

    #[test]
    fn free_priors_box_around_the_aggregates() {
        let model = toy_chromatic_model();
        let flags = ForceFlags {
            force_ellipse: false,
            force_centroid: false,
            force_stddev: false,
            force_alpha: false,
        };
        let priors = model.priors_at(6200.0, &flags, (0.2, 0.2));
        assert!(!priors.ell.forced);
        let (lo, hi) = priors.ell.bounds;
        assert_abs_diff_eq!(lo, 0.12 - 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(hi, 0.12 + 0.04, epsilon = 1e-12);
        assert!(!priors.stddev.forced);
        assert_eq!(priors.stddev.bounds, DEFAULT_STDDEV_BOUNDS);
    }

    #[test]
    fn mixed_flags_follow_their_switches() {
        let model = toy_chromatic_model();
        let flags = ForceFlags {
            force_centroid: false,
            ..ForceFlags::default()
        };
        let priors = model.priors_at(5500.0, &flags, (0.2, 0.2));
        // the trajectory prediction survives as a guess, not a constraint
        assert!(!priors.force_centroid);
        assert_eq!(priors.centroid, Some(model.adr.predict(5500.0)));
        assert_eq!(priors.centroid_err, (0.2, 0.2));
        assert!(priors.stddev.forced);
        assert!(priors.stddev_ratio.forced);
        assert!(priors.ell.forced);
        assert!(priors.theta.forced);
        assert!(priors.alpha.forced);
    }

    #[test]
    fn shape_prior_respects_hard_limits_and_minimum_width() {
        let tight = shape_prior(
            WeightedMean {
                value: 0.5,
                error: 0.0,
            },
            2.0,
            None,
        );
        assert!(tight.bounds.0 < 0.5 && tight.bounds.1 > 0.5);
        let clipped = shape_prior(
            WeightedMean {
                value: 0.02,
                error: 0.05,
            },
            2.0,
            Some(ELL_LIMITS),
        );
        assert_eq!(clipped.bounds.0, 0.0);
    }

    #[test]
    fn force_fit_recovers_per_slice_amplitudes() {
        let chromatic = ChromaticProfileModel {
            adr: AdrModel::from_parameters(6000.0, 1.0, 1.0, 0.0, 0.3, -0.2),
            ..toy_chromatic_model()
        };
        let psf = ProfileFamily::GaussMoffat.model(BackgroundKind::Flat);

        // build a cube straight from the chromatic truth
        let side = 11;
        let half = (side - 1) as f64 / 2.0;
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for row in 0..side {
            for col in 0..side {
                xs.push(col as f64 - half);
                ys.push(row as f64 - half);
            }
        }
        let frame = Arc::new(SpaxelFrame::new(
            Array1::from(xs),
            Array1::from(ys),
            vec![[-0.5, -0.5], [0.5, -0.5], [0.5, 0.5], [-0.5, 0.5]],
        ));
        let lbda = Array1::from(vec![5200.0, 5700.0, 6200.0, 6700.0]);
        let amplitudes = [60.0, 72.0, 55.0, 48.0];
        let mut flux = Array2::zeros((lbda.len(), frame.n_spaxels()));
        for (i, (&l, &amp)) in lbda.iter().zip(&amplitudes).enumerate() {
            let flags = ForceFlags::default();
            let priors = chromatic.priors_at(l, &flags, (5.0, 5.0));
            let mut packed = vec![
                amp,
                priors.centroid.unwrap().0,
                priors.centroid.unwrap().1,
                priors.stddev.guess.unwrap(),
                priors.stddev_ratio.guess.unwrap(),
                priors.ell.guess.unwrap(),
                priors.theta.guess.unwrap(),
                priors.alpha.guess.unwrap(),
            ];
            packed.push(1.8);
            for j in 0..frame.n_spaxels() {
                flux[(i, j)] = psf.model_value(&packed, frame.x()[j], frame.y()[j]);
            }
        }
        let variance = Array2::from_elem(flux.dim(), 0.01);
        let cube = Cube::new(lbda, flux, variance, frame, Header::new());

        let bins = crate::binning::BinSpec::PerSample.resolve(&cube).unwrap();
        let fits = chromatic
            .force_fit(&cube, &bins, &*psf, &ForceFlags::default(), (5.0, 5.0))
            .unwrap();
        assert_eq!(fits.len(), 4);
        for (fit, &amp) in fits.iter().zip(&amplitudes) {
            assert!(fit.converged);
            assert_relative_eq!(fit.params.amplitude.value, amp, max_relative = 1e-6);
            assert_abs_diff_eq!(fit.params.background[0].value, 1.8, epsilon = 1e-6);
            assert!(fit.params.stddev.forced);
            assert!(fit.params.ell.forced);
        }
    }
}
