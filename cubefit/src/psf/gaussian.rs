//! Pure elliptical Gaussian profile, for marginal-signal fields where the
//! tail component is unconstrained.
//!
//! Shares the packed layout of the default family; the `stddev_ratio`
//! and `alpha` slots are inactive and come back flagged as forced.

use std::f64::consts::PI;

use super::{
    background_gradient, elliptical_radius, BackgroundKind, ProfileFamily, PsfModel, PAR_ALPHA,
    PAR_AMPLITUDE, PAR_ELL, PAR_STDDEV, PAR_STDDEV_RATIO, PAR_THETA, PAR_X0, PAR_Y0,
};

#[derive(Debug, Clone, Copy)]
pub struct Gaussian {
    background: BackgroundKind,
}

impl Gaussian {
    pub fn new(background: BackgroundKind) -> Self {
        Self { background }
    }
}

impl PsfModel for Gaussian {
    fn family(&self) -> ProfileFamily {
        ProfileFamily::Gaussian
    }

    fn background(&self) -> BackgroundKind {
        self.background
    }

    fn is_active(&self, index: usize) -> bool {
        index != PAR_STDDEV_RATIO && index != PAR_ALPHA
    }

    fn unit_profile(&self, p: &[f64], x: f64, y: f64) -> f64 {
        let stddev = p[PAR_STDDEV];
        let e = elliptical_radius(p, x, y);
        (-e.u / (2.0 * stddev * stddev)).exp() / (e.q * 2.0 * PI * stddev * stddev)
    }

    fn gradient(&self, p: &[f64], x: f64, y: f64, grad: &mut [f64]) {
        for g in grad.iter_mut() {
            *g = 0.0;
        }

        let amplitude = p[PAR_AMPLITUDE];
        let stddev = p[PAR_STDDEV];
        let sig2 = stddev * stddev;

        let e = elliptical_radius(p, x, y);
        let z = e.q * 2.0 * PI * sig2;
        let core = (-e.u / (2.0 * sig2)).exp();
        let cf = amplitude / z;
        let zf = amplitude * core / (z * z);

        let ds_du = core * (-0.5 / sig2);
        let du_dx0 = 2.0 * e.xp * (-e.cos_t) + 2.0 * (e.yp / (e.q * e.q)) * e.sin_t;
        let du_dy0 = 2.0 * e.xp * (-e.sin_t) + 2.0 * (e.yp / (e.q * e.q)) * (-e.cos_t);

        grad[PAR_AMPLITUDE] = core / z;
        grad[PAR_X0] = cf * ds_du * du_dx0;
        grad[PAR_Y0] = cf * ds_du * du_dy0;
        grad[PAR_STDDEV] = cf * core * e.u / (sig2 * stddev) - zf * e.q * 4.0 * PI * stddev;

        let ds_dq = ds_du * (-2.0 * e.yp * e.yp / (e.q * e.q * e.q));
        grad[PAR_ELL] = -(cf * ds_dq - zf * (z / e.q));
        grad[PAR_THETA] = cf * ds_du * 2.0 * e.xp * e.yp * (1.0 - 1.0 / (e.q * e.q));

        background_gradient(self.background, grad, x, y);
    }
}
