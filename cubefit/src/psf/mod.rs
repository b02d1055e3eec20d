//! Analytic PSF + background model families.
//!
//! A family evaluates a packed parameter vector into profile, background
//! and total-model values over a spaxel frame, together with the analytic
//! gradient the minimizer consumes. Families share one packed layout so
//! results keep a single shape regardless of family:
//!
//! ```text
//! [amplitude, x0, y0, stddev, stddev_ratio, ell, theta, alpha, bkgd..]
//! ```
//!
//! with one trailing background coefficient for a flat background and
//! three (`b0 + bx*x + by*y`) for a tilted plane. A family that has no
//! use for a slot (the pure Gaussian ignores `stddev_ratio` and `alpha`)
//! reports it inactive and the fitter pins it.

pub mod gauss_moffat;
pub mod gaussian;

pub use gauss_moffat::GaussMoffat;
pub use gaussian::Gaussian;

use std::fmt;
use std::str::FromStr;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::cube::SpaxelFrame;

pub const PAR_AMPLITUDE: usize = 0;
pub const PAR_X0: usize = 1;
pub const PAR_Y0: usize = 2;
pub const PAR_STDDEV: usize = 3;
pub const PAR_STDDEV_RATIO: usize = 4;
pub const PAR_ELL: usize = 5;
pub const PAR_THETA: usize = 6;
pub const PAR_ALPHA: usize = 7;
/// First background coefficient; the count depends on [`BackgroundKind`].
pub const PAR_BKGD: usize = 8;

/// Spatial background model fitted together with the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackgroundKind {
    /// One coefficient, uniform over the field.
    Flat,
    /// `b0 + bx*x + by*y`.
    TiltedPlane,
}

impl BackgroundKind {
    pub fn n_coeffs(self) -> usize {
        match self {
            BackgroundKind::Flat => 1,
            BackgroundKind::TiltedPlane => 3,
        }
    }
}

pub(crate) fn background_value(kind: BackgroundKind, p: &[f64], x: f64, y: f64) -> f64 {
    match kind {
        BackgroundKind::Flat => p[PAR_BKGD],
        BackgroundKind::TiltedPlane => p[PAR_BKGD] + p[PAR_BKGD + 1] * x + p[PAR_BKGD + 2] * y,
    }
}

pub(crate) fn background_gradient(kind: BackgroundKind, grad: &mut [f64], x: f64, y: f64) {
    grad[PAR_BKGD] = 1.0;
    if kind == BackgroundKind::TiltedPlane {
        grad[PAR_BKGD + 1] = x;
        grad[PAR_BKGD + 2] = y;
    }
}

/// Elliptical geometry shared by the families: centroid-relative
/// coordinates rotated by the position angle, and the squared elliptical
/// radius `u = xp^2 + (yp/q)^2` with axis ratio `q = 1 - ell`.
pub(crate) struct EllipticalRadius {
    pub q: f64,
    pub xp: f64,
    pub yp: f64,
    pub u: f64,
    pub sin_t: f64,
    pub cos_t: f64,
}

pub(crate) fn elliptical_radius(p: &[f64], x: f64, y: f64) -> EllipticalRadius {
    let q = 1.0 - p[PAR_ELL];
    let (sin_t, cos_t) = p[PAR_THETA].sin_cos();
    let dx = x - p[PAR_X0];
    let dy = y - p[PAR_Y0];
    let xp = dx * cos_t + dy * sin_t;
    let yp = -dx * sin_t + dy * cos_t;
    let u = xp * xp + (yp / q) * (yp / q);
    EllipticalRadius {
        q,
        xp,
        yp,
        u,
        sin_t,
        cos_t,
    }
}

/// Analytic profile family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileFamily {
    /// Elliptical Gaussian core plus Moffat tail; the production default.
    GaussMoffat,
    /// Pure elliptical Gaussian, for marginal-signal fields.
    Gaussian,
}

impl ProfileFamily {
    /// Instantiate the family against a background model.
    pub fn model(self, background: BackgroundKind) -> Box<dyn PsfModel> {
        match self {
            ProfileFamily::GaussMoffat => Box::new(GaussMoffat::new(background)),
            ProfileFamily::Gaussian => Box::new(Gaussian::new(background)),
        }
    }
}

impl FromStr for ProfileFamily {
    type Err = String;

    /// Accepts the current names plus the archival configuration alias
    /// `normal-moffat-tilted`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gauss-moffat" | "gaussmoffat" | "normal-moffat-tilted" => Ok(ProfileFamily::GaussMoffat),
            "gaussian" | "gauss" => Ok(ProfileFamily::Gaussian),
            other => Err(format!("unknown PSF family `{other}`")),
        }
    }
}

impl fmt::Display for ProfileFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileFamily::GaussMoffat => write!(f, "gauss-moffat"),
            ProfileFamily::Gaussian => write!(f, "gaussian"),
        }
    }
}

/// Capability interface of an analytic PSF + background family.
pub trait PsfModel: Send + Sync {
    fn family(&self) -> ProfileFamily;

    fn background(&self) -> BackgroundKind;

    /// Total packed parameter count for this family and background.
    fn n_params(&self) -> usize {
        PAR_BKGD + self.background().n_coeffs()
    }

    /// Whether the packed slot participates in this family. Inactive
    /// slots are pinned by the fitter instead of optimized.
    fn is_active(&self, index: usize) -> bool {
        let _ = index;
        true
    }

    /// Unit-flux profile value at `(x, y)`. The model multiplies this by
    /// the amplitude slot, so a fitted amplitude reads directly as total
    /// profile flux.
    fn unit_profile(&self, p: &[f64], x: f64, y: f64) -> f64;

    /// Total model: `amplitude * profile + background`.
    fn model_value(&self, p: &[f64], x: f64, y: f64) -> f64 {
        p[PAR_AMPLITUDE] * self.unit_profile(p, x, y) + background_value(self.background(), p, x, y)
    }

    /// Gradient of the total model with respect to every packed slot.
    /// `grad` has `n_params()` entries and is fully overwritten.
    fn gradient(&self, p: &[f64], x: f64, y: f64, grad: &mut [f64]);

    /// Amplitude-scaled profile image over a frame.
    fn profile_image(&self, p: &[f64], frame: &SpaxelFrame) -> Array1<f64> {
        let amplitude = p[PAR_AMPLITUDE];
        Array1::from_shape_fn(frame.n_spaxels(), |i| {
            amplitude * self.unit_profile(p, frame.x()[i], frame.y()[i])
        })
    }

    /// Background image over a frame. A flat background broadcasts its
    /// single coefficient to every spaxel.
    fn background_image(&self, p: &[f64], frame: &SpaxelFrame) -> Array1<f64> {
        Array1::from_shape_fn(frame.n_spaxels(), |i| {
            background_value(self.background(), p, frame.x()[i], frame.y()[i])
        })
    }

    /// Profile plus background image over a frame.
    fn model_image(&self, p: &[f64], frame: &SpaxelFrame) -> Array1<f64> {
        Array1::from_shape_fn(frame.n_spaxels(), |i| {
            self.model_value(p, frame.x()[i], frame.y()[i])
        })
    }
}

/// One fitted parameter: value, 1-sigma uncertainty, and whether it was
/// held fixed during the fit that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParameter {
    pub value: f64,
    pub error: f64,
    pub forced: bool,
}

impl FitParameter {
    pub fn free(value: f64, error: f64) -> Self {
        Self {
            value,
            error,
            forced: false,
        }
    }

    pub fn forced(value: f64) -> Self {
        Self {
            value,
            error: 0.0,
            forced: true,
        }
    }
}

/// Full parameter record of one slice fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfParameters {
    pub family: ProfileFamily,
    pub background_kind: BackgroundKind,
    pub amplitude: FitParameter,
    pub x0: FitParameter,
    pub y0: FitParameter,
    pub stddev: FitParameter,
    pub stddev_ratio: FitParameter,
    pub ell: FitParameter,
    pub theta: FitParameter,
    pub alpha: FitParameter,
    /// One entry for a flat background, three for a tilted plane.
    pub background: Vec<FitParameter>,
}

impl PsfParameters {
    /// Values re-packed into the family layout, ready for evaluation.
    pub fn to_packed(&self) -> Vec<f64> {
        let mut p = vec![
            self.amplitude.value,
            self.x0.value,
            self.y0.value,
            self.stddev.value,
            self.stddev_ratio.value,
            self.ell.value,
            self.theta.value,
            self.alpha.value,
        ];
        p.extend(self.background.iter().map(|b| b.value));
        p
    }
}
