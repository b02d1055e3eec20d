//! Elliptical Gaussian-core + Moffat-tail profile.
//!
//! Both components share the centroid and the squared elliptical radius
//! `u`; the Moffat width is tied to the Gaussian one through
//! `gamma = stddev_ratio * stddev` and the tail carries a fixed flux
//! fraction [`TAIL_WEIGHT`], so a single-slice fit is not degenerate in
//! the component mixing:
//!
//! ```text
//! profile(u) = (1 - w) * exp(-u / 2 stddev^2)
//!            +      w  * (1 + u / gamma^2)^-alpha
//! ```
//!
//! The profile is normalized to unit total flux over the plane,
//! `norm = q pi * (2 (1-w) stddev^2 + w gamma^2 / (alpha - 1))`,
//! which makes the amplitude slot read directly as source flux. The
//! normalization requires `alpha > 1`; the fitter's bounds keep it
//! there.

use std::f64::consts::PI;

use super::{
    background_gradient, elliptical_radius, BackgroundKind, ProfileFamily, PsfModel, PAR_ALPHA,
    PAR_AMPLITUDE, PAR_ELL, PAR_STDDEV, PAR_STDDEV_RATIO, PAR_THETA, PAR_X0, PAR_Y0,
};

/// Fraction of the total flux carried by the Moffat tail.
pub const TAIL_WEIGHT: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
pub struct GaussMoffat {
    background: BackgroundKind,
}

impl GaussMoffat {
    pub fn new(background: BackgroundKind) -> Self {
        Self { background }
    }
}

fn norm(q: f64, stddev: f64, gamma2: f64, alpha: f64) -> f64 {
    q * PI * (2.0 * (1.0 - TAIL_WEIGHT) * stddev * stddev + TAIL_WEIGHT * gamma2 / (alpha - 1.0))
}

impl PsfModel for GaussMoffat {
    fn family(&self) -> ProfileFamily {
        ProfileFamily::GaussMoffat
    }

    fn background(&self) -> BackgroundKind {
        self.background
    }

    fn unit_profile(&self, p: &[f64], x: f64, y: f64) -> f64 {
        let stddev = p[PAR_STDDEV];
        let alpha = p[PAR_ALPHA];
        let gamma2 = (p[PAR_STDDEV_RATIO] * stddev) * (p[PAR_STDDEV_RATIO] * stddev);
        let e = elliptical_radius(p, x, y);
        let core = (-e.u / (2.0 * stddev * stddev)).exp();
        let tail = (1.0 + e.u / gamma2).powf(-alpha);
        ((1.0 - TAIL_WEIGHT) * core + TAIL_WEIGHT * tail) / norm(e.q, stddev, gamma2, alpha)
    }

    fn gradient(&self, p: &[f64], x: f64, y: f64, grad: &mut [f64]) {
        for g in grad.iter_mut() {
            *g = 0.0;
        }

        let amplitude = p[PAR_AMPLITUDE];
        let stddev = p[PAR_STDDEV];
        let ratio = p[PAR_STDDEV_RATIO];
        let alpha = p[PAR_ALPHA];
        let sig2 = stddev * stddev;
        let gamma2 = ratio * ratio * sig2;
        let w = TAIL_WEIGHT;

        let e = elliptical_radius(p, x, y);
        let core = (-e.u / (2.0 * sig2)).exp();
        let t = 1.0 + e.u / gamma2;
        let tail = t.powf(-alpha);
        let tail_inner = t.powf(-alpha - 1.0);
        let profile = (1.0 - w) * core + w * tail;

        let z = norm(e.q, stddev, gamma2, alpha);
        let cf = amplitude / z;
        // amplitude * profile / z^2, the prefactor of every d(norm) term
        let zf = amplitude * profile / (z * z);

        // d(profile)/du
        let ds_du = (1.0 - w) * core * (-0.5 / sig2) + w * (-alpha / gamma2) * tail_inner;

        // centroid: du/dx0 and du/dy0 through the rotated frame
        let du_dx0 = 2.0 * e.xp * (-e.cos_t) + 2.0 * (e.yp / (e.q * e.q)) * e.sin_t;
        let du_dy0 = 2.0 * e.xp * (-e.sin_t) + 2.0 * (e.yp / (e.q * e.q)) * (-e.cos_t);

        grad[PAR_AMPLITUDE] = profile / z;
        grad[PAR_X0] = cf * ds_du * du_dx0;
        grad[PAR_Y0] = cf * ds_du * du_dy0;

        // width: both components and the normalization depend on stddev
        let dcore_dsig = core * e.u / (sig2 * stddev);
        let dtail_dsig = 2.0 * alpha * e.u / (ratio * ratio * sig2 * stddev) * tail_inner;
        let dz_dsig =
            e.q * PI * (4.0 * (1.0 - w) * stddev + 2.0 * w * ratio * ratio * stddev / (alpha - 1.0));
        grad[PAR_STDDEV] = cf * ((1.0 - w) * dcore_dsig + w * dtail_dsig) - zf * dz_dsig;

        let dtail_dratio = 2.0 * alpha * e.u / (ratio * ratio * ratio * sig2) * tail_inner;
        let dz_dratio = e.q * PI * w * 2.0 * ratio * sig2 / (alpha - 1.0);
        grad[PAR_STDDEV_RATIO] = cf * w * dtail_dratio - zf * dz_dratio;

        // ellipticity enters through q = 1 - ell: d/dell = -d/dq
        let ds_dq = ds_du * (-2.0 * e.yp * e.yp / (e.q * e.q * e.q));
        grad[PAR_ELL] = -(cf * ds_dq - zf * (z / e.q));

        grad[PAR_THETA] = cf * ds_du * 2.0 * e.xp * e.yp * (1.0 - 1.0 / (e.q * e.q));

        let dz_dalpha = -e.q * PI * w * gamma2 / ((alpha - 1.0) * (alpha - 1.0));
        grad[PAR_ALPHA] = cf * w * (-tail * t.ln()) - zf * dz_dalpha;

        background_gradient(self.background, grad, x, y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn reference_params() -> Vec<f64> {
        vec![80.0, 0.3, -0.4, 1.4, 2.2, 0.12, 0.5, 2.4, 2.0, 0.1, -0.05]
    }

    /// Central finite differences against the analytic gradient.
    fn check_gradient(model: &dyn PsfModel, p: &[f64], x: f64, y: f64) {
        let mut grad = vec![0.0; model.n_params()];
        model.gradient(p, x, y, &mut grad);
        for k in 0..model.n_params() {
            let h = 1e-6 * p[k].abs().max(1.0);
            let mut hi = p.to_vec();
            let mut lo = p.to_vec();
            hi[k] += h;
            lo[k] -= h;
            let numeric = (model.model_value(&hi, x, y) - model.model_value(&lo, x, y)) / (2.0 * h);
            let scale = numeric.abs().max(grad[k].abs()).max(1e-8);
            assert!(
                ((numeric - grad[k]) / scale).abs() < 1e-5,
                "slot {k} at ({x}, {y}): analytic {} vs numeric {}",
                grad[k],
                numeric
            );
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let model = GaussMoffat::new(BackgroundKind::TiltedPlane);
        let p = reference_params();
        for &(x, y) in &[(0.0, 0.0), (1.2, -0.7), (-2.3, 1.8), (0.31, -0.38)] {
            check_gradient(&model, &p, x, y);
        }
    }

    #[test]
    fn gradient_matches_finite_differences_flat_background() {
        let model = GaussMoffat::new(BackgroundKind::Flat);
        let p = reference_params()[..9].to_vec();
        check_gradient(&model, &p, 0.9, 0.4);
    }

    #[test]
    fn profile_integrates_to_unit_flux() {
        let model = GaussMoffat::new(BackgroundKind::Flat);
        let p = vec![1.0, 0.0, 0.0, 1.4, 2.2, 0.12, 0.5, 2.4, 0.0];
        let step = 0.25;
        let half = 30.0;
        let n = (2.0 * half / step) as i64 + 1;
        let mut total = 0.0;
        for i in 0..n {
            for j in 0..n {
                let x = -half + i as f64 * step;
                let y = -half + j as f64 * step;
                total += model.unit_profile(&p, x, y) * step * step;
            }
        }
        assert_abs_diff_eq!(total, 1.0, epsilon = 2e-3);
    }

    #[test]
    fn amplitude_scales_the_profile_linearly() {
        let model = GaussMoffat::new(BackgroundKind::Flat);
        let mut p = vec![1.0, 0.0, 0.0, 1.4, 2.2, 0.0, 0.0, 2.4, 0.0];
        let unit = model.model_value(&p, 0.7, -0.2);
        p[PAR_AMPLITUDE] = 42.0;
        assert_abs_diff_eq!(model.model_value(&p, 0.7, -0.2), 42.0 * unit, epsilon = 1e-12);
    }

    #[test]
    fn tail_dominates_far_from_the_core() {
        let model = GaussMoffat::new(BackgroundKind::Flat);
        let p = vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.2, 0.0];
        // at 8 stddev the Gaussian core is ~1e-14 of its peak; the
        // profile there must still be well above it
        let far = model.unit_profile(&p, 8.0, 0.0);
        let gaussian_only = (-(8.0f64 * 8.0) / 2.0).exp();
        assert!(far > 100.0 * gaussian_only);
    }
}
