//! Per-slice PSF fitting.
//!
//! Builds a weighted least-squares problem over the usable spaxels of one
//! slice, seeds it from priors or image moments, pins forced and
//! family-inactive slots, runs the bounded minimizer, and unpacks values
//! and 1-sigma uncertainties into a [`SliceFitResult`].

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::binning::WavelengthBin;
use crate::error::ExtractionError;
use crate::lm::{LeastSquaresProblem, LevenbergMarquardt};
use crate::psf::{
    BackgroundKind, FitParameter, ProfileFamily, PsfModel, PsfParameters, PAR_ALPHA, PAR_AMPLITUDE,
    PAR_BKGD, PAR_ELL, PAR_STDDEV, PAR_STDDEV_RATIO, PAR_THETA, PAR_X0, PAR_Y0,
};
use crate::slice::Slice;

pub const DEFAULT_STDDEV_BOUNDS: (f64, f64) = (0.3, 10.0);
pub const DEFAULT_STDDEV_RATIO_BOUNDS: (f64, f64) = (1.1, 4.0);
pub const DEFAULT_ALPHA_BOUNDS: (f64, f64) = (1.1, 6.0);
pub const DEFAULT_THETA_BOUNDS: (f64, f64) = (-PI, PI);

pub const DEFAULT_STDDEV_RATIO_GUESS: f64 = 2.0;
pub const DEFAULT_ELL_GUESS: f64 = 0.05;
pub const DEFAULT_ALPHA_GUESS: f64 = 2.5;

/// Keeps the amplitude strictly positive.
const AMPLITUDE_FLOOR: f64 = 1e-10;

/// Prior on one scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamPrior {
    /// Starting value; `None` falls back to the slice moments or the
    /// family default for this slot.
    pub guess: Option<f64>,
    /// Inclusive bounds enforced during minimization.
    pub bounds: (f64, f64),
    /// Hold the parameter at its guess instead of fitting it.
    pub forced: bool,
}

impl ParamPrior {
    pub fn free(bounds: (f64, f64)) -> Self {
        Self {
            guess: None,
            bounds,
            forced: false,
        }
    }

    pub fn guessed(guess: f64, bounds: (f64, f64)) -> Self {
        Self {
            guess: Some(guess),
            bounds,
            forced: false,
        }
    }

    pub fn forced(value: f64) -> Self {
        Self {
            guess: Some(value),
            bounds: (value, value),
            forced: true,
        }
    }
}

/// Everything one slice fit needs besides the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitPriors {
    /// Centroid guess; `None` falls back to the slice's image moments.
    pub centroid: Option<(f64, f64)>,
    /// Half-widths of the allowed centroid box around the guess.
    pub centroid_err: (f64, f64),
    /// Hold the centroid at its guess.
    pub force_centroid: bool,
    pub stddev: ParamPrior,
    pub stddev_ratio: ParamPrior,
    pub ell: ParamPrior,
    pub theta: ParamPrior,
    pub alpha: ParamPrior,
}

impl FitPriors {
    /// Loose priors for a first pass: every shape parameter free inside
    /// its wide default bounds.
    pub fn loose(
        centroid: Option<(f64, f64)>,
        centroid_err: (f64, f64),
        ell_bounds: (f64, f64),
    ) -> Self {
        Self {
            centroid,
            centroid_err,
            force_centroid: false,
            stddev: ParamPrior::free(DEFAULT_STDDEV_BOUNDS),
            stddev_ratio: ParamPrior::free(DEFAULT_STDDEV_RATIO_BOUNDS),
            ell: ParamPrior::free(ell_bounds),
            theta: ParamPrior::free(DEFAULT_THETA_BOUNDS),
            alpha: ParamPrior::free(DEFAULT_ALPHA_BOUNDS),
        }
    }
}

/// One slice's fit outcome. Failed fits are recorded, not erased: a
/// non-converged slice keeps its index and last parameter values with
/// `converged == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceFitResult {
    pub index: usize,
    pub bin: WavelengthBin,
    pub params: PsfParameters,
    /// Weighted residual sum of squares.
    pub chi2: f64,
    /// Usable spaxels minus free parameters.
    pub dof: usize,
    pub converged: bool,
    pub iterations: usize,
}

impl SliceFitResult {
    /// Representative wavelength (bin centre).
    pub fn lbda(&self) -> f64 {
        self.bin.center()
    }

    /// Placeholder for a slice that could not be fit at all; keeps index
    /// alignment across a pass.
    pub fn failed(
        index: usize,
        bin: WavelengthBin,
        family: ProfileFamily,
        background_kind: BackgroundKind,
    ) -> Self {
        let absent = FitParameter::free(0.0, f64::INFINITY);
        Self {
            index,
            bin,
            params: PsfParameters {
                family,
                background_kind,
                amplitude: absent,
                x0: absent,
                y0: absent,
                stddev: absent,
                stddev_ratio: absent,
                ell: absent,
                theta: absent,
                alpha: absent,
                background: vec![absent; background_kind.n_coeffs()],
            },
            chi2: f64::INFINITY,
            dof: 0,
            converged: false,
            iterations: 0,
        }
    }
}

/// Weighted least-squares view of one slice, restricted to the free
/// parameter subset.
struct SliceProblem<'a> {
    model: &'a dyn PsfModel,
    x: Vec<f64>,
    y: Vec<f64>,
    data: Vec<f64>,
    wsqrt: Vec<f64>,
    /// Packed indices of the free parameters, in column order.
    free: Vec<usize>,
    /// Full packed vector with forced values baked in; free slots are
    /// overwritten before every evaluation.
    packed: Vec<f64>,
    grad: Vec<f64>,
}

impl SliceProblem<'_> {
    fn load(&mut self, free_params: &[f64]) {
        for (col, &k) in self.free.iter().enumerate() {
            self.packed[k] = free_params[col];
        }
    }
}

impl LeastSquaresProblem for SliceProblem<'_> {
    fn dimensions(&self) -> (usize, usize) {
        (self.data.len(), self.free.len())
    }

    fn residuals(&mut self, params: &[f64], out: &mut DVector<f64>) {
        self.load(params);
        for i in 0..self.data.len() {
            let model = self.model.model_value(&self.packed, self.x[i], self.y[i]);
            out[i] = self.wsqrt[i] * (self.data[i] - model);
        }
    }

    fn jacobian(&mut self, params: &[f64], out: &mut DMatrix<f64>) {
        self.load(params);
        for i in 0..self.data.len() {
            self.model
                .gradient(&self.packed, self.x[i], self.y[i], &mut self.grad);
            for (col, &k) in self.free.iter().enumerate() {
                out[(i, col)] = self.wsqrt[i] * self.grad[k];
            }
        }
    }
}

/// Fit one slice.
///
/// Fails only when the slice carries no usable spaxel at all; a fit that
/// merely does not converge still comes back as a flagged result.
pub fn fit_slice(
    slice: &Slice,
    model: &dyn PsfModel,
    priors: &FitPriors,
) -> Result<SliceFitResult, ExtractionError> {
    let usable = slice.usable();
    if usable.is_empty() {
        return Err(ExtractionError::DegenerateSlice {
            index: slice.index(),
        });
    }

    let n_params = model.n_params();
    let mut guess = vec![0.0; n_params];
    let mut lower = vec![f64::NEG_INFINITY; n_params];
    let mut upper = vec![f64::INFINITY; n_params];
    let mut forced = vec![false; n_params];

    let moments = slice.moments();

    guess[PAR_AMPLITUDE] = moments.amplitude.max(AMPLITUDE_FLOOR);
    lower[PAR_AMPLITUDE] = AMPLITUDE_FLOOR;

    let (cx, cy) = priors.centroid.unwrap_or((moments.x, moments.y));
    guess[PAR_X0] = cx;
    guess[PAR_Y0] = cy;
    lower[PAR_X0] = cx - priors.centroid_err.0;
    upper[PAR_X0] = cx + priors.centroid_err.0;
    lower[PAR_Y0] = cy - priors.centroid_err.1;
    upper[PAR_Y0] = cy + priors.centroid_err.1;
    forced[PAR_X0] = priors.force_centroid;
    forced[PAR_Y0] = priors.force_centroid;

    let mut apply = |k: usize, prior: &ParamPrior, default_guess: f64| {
        let g = prior.guess.unwrap_or(default_guess);
        let (lo, hi) = if prior.forced {
            (g, g)
        } else {
            (prior.bounds.0.min(prior.bounds.1), prior.bounds.0.max(prior.bounds.1))
        };
        guess[k] = g.clamp(lo, hi);
        lower[k] = lo;
        upper[k] = hi;
        forced[k] = prior.forced;
    };
    apply(PAR_STDDEV, &priors.stddev, moments.stddev);
    apply(PAR_STDDEV_RATIO, &priors.stddev_ratio, DEFAULT_STDDEV_RATIO_GUESS);
    apply(PAR_ELL, &priors.ell, DEFAULT_ELL_GUESS);
    apply(PAR_THETA, &priors.theta, 0.0);
    apply(PAR_ALPHA, &priors.alpha, DEFAULT_ALPHA_GUESS);

    guess[PAR_BKGD] = moments.background;

    // family-inactive slots are pinned at their guesses
    for k in 0..n_params {
        if !model.is_active(k) {
            forced[k] = true;
            lower[k] = guess[k];
            upper[k] = guess[k];
        }
    }

    let free: Vec<usize> = (0..n_params).filter(|&k| !forced[k]).collect();
    debug_assert!(!free.is_empty());

    let frame = slice.frame();
    let problem_x: Vec<f64> = usable.iter().map(|&i| frame.x()[i]).collect();
    let problem_y: Vec<f64> = usable.iter().map(|&i| frame.y()[i]).collect();
    let data: Vec<f64> = usable.iter().map(|&i| slice.flux()[i]).collect();
    let wsqrt: Vec<f64> = usable
        .iter()
        .map(|&i| (1.0 / slice.variance()[i]).sqrt())
        .collect();

    let mut problem = SliceProblem {
        model,
        x: problem_x,
        y: problem_y,
        data,
        wsqrt,
        free: free.clone(),
        packed: guess.clone(),
        grad: vec![0.0; n_params],
    };

    let free_guess: Vec<f64> = free.iter().map(|&k| guess[k]).collect();
    let free_lower: Vec<f64> = free.iter().map(|&k| lower[k]).collect();
    let free_upper: Vec<f64> = free.iter().map(|&k| upper[k]).collect();

    let outcome =
        LevenbergMarquardt::default().minimize(&mut problem, &free_guess, &free_lower, &free_upper);

    let mut values = guess;
    for (col, &k) in free.iter().enumerate() {
        values[k] = outcome.params[col];
    }
    let mut errors = vec![0.0; n_params];
    match &outcome.covariance {
        Some(cov) => {
            for (col, &k) in free.iter().enumerate() {
                errors[k] = cov[(col, col)].max(0.0).sqrt();
            }
        }
        None => {
            for &k in &free {
                errors[k] = f64::INFINITY;
            }
        }
    }

    let dof = usable.len().saturating_sub(free.len());
    debug!(
        "slice {}: chi2={:.4e} dof={} iterations={} converged={}",
        slice.index(),
        outcome.chi2,
        dof,
        outcome.iterations,
        outcome.converged
    );

    let param = |k: usize| {
        if forced[k] {
            FitParameter::forced(values[k])
        } else {
            FitParameter::free(values[k], errors[k])
        }
    };
    let params = PsfParameters {
        family: model.family(),
        background_kind: model.background(),
        amplitude: param(PAR_AMPLITUDE),
        x0: param(PAR_X0),
        y0: param(PAR_Y0),
        stddev: param(PAR_STDDEV),
        stddev_ratio: param(PAR_STDDEV_RATIO),
        ell: param(PAR_ELL),
        theta: param(PAR_THETA),
        alpha: param(PAR_ALPHA),
        background: (0..model.background().n_coeffs())
            .map(|j| param(PAR_BKGD + j))
            .collect(),
    };

    Ok(SliceFitResult {
        index: slice.index(),
        bin: *slice.bin(),
        params,
        chi2: outcome.chi2,
        dof,
        converged: outcome.converged,
        iterations: outcome.iterations,
    })
}
