//! Atmospheric differential refraction: dispersion physics and the
//! chromatic centroid-trajectory fit.
//!
//! The apparent position of a point source drifts with wavelength along
//! the parallactic direction, blue light refracting more than red. The
//! displacement relative to a reference wavelength is
//!
//! ```text
//! delta(lbda) = [n(lbda) - n(lbda_ref)] * tan(z) * 206265 / scale
//! ```
//!
//! in spatial units, with `n` the refractive index of air and `z` the
//! zenith distance (`airmass = sec z`). Writing `u = tan(z) *
//! sin(parangle)` and `v = tan(z) * cos(parangle)` makes each centroid
//! axis linear in `(xref, u)` resp. `(yref, v)`, so the trajectory fit
//! is two weighted straight-line fits, and the physical parameters are
//! recovered from `(u, v)` afterwards.

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExtractionError;
use crate::psf::FitParameter;

/// Radians to arcseconds.
const RAD2ARCSEC: f64 = 206_264.806_247_096_36;

/// Centroid uncertainties below this are floored to keep weights finite.
const CENTROID_ERROR_FLOOR: f64 = 1e-6;

/// Below this |tan z| the parallactic direction is undefined.
const TANZ_FLOOR: f64 = 1e-9;

/// Minimum number of centroid points for a trajectory fit.
pub const MIN_TRAJECTORY_POINTS: usize = 3;

/// Refractive index of air at standard conditions, for `lbda` in
/// Angstrom (Edlen dispersion formula).
pub fn air_refractive_index(lbda: f64) -> f64 {
    let s2 = (1.0e4 / lbda) * (1.0e4 / lbda);
    1.0 + 1.0e-6 * (64.328 + 29_498.1 / (146.0 - s2) + 255.4 / (41.0 - s2))
}

/// One centroid measurement feeding the trajectory fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdrPoint {
    pub lbda: f64,
    pub x: f64,
    pub y: f64,
    pub x_err: f64,
    pub y_err: f64,
}

/// Known observation geometry, imposed on the fit when supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdrConstraints {
    pub airmass: Option<f64>,
    /// Parallactic angle in radians, measured from +y toward +x.
    pub parangle: Option<f64>,
}

/// Fitted (or imposed) refraction trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdrModel {
    pub lbda_ref: f64,
    /// Arcseconds per spatial unit.
    pub scale: f64,
    pub airmass: FitParameter,
    /// Radians, from +y toward +x.
    pub parangle: FitParameter,
    pub xref: FitParameter,
    pub yref: FitParameter,
    /// Weighted residual sum of the trajectory fit.
    pub chi2: f64,
    /// Centroid points used by the fit.
    pub n_points: usize,
}

/// One weighted straight-line fit, `value = intercept + slope * abscissa`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LineFit {
    pub intercept: f64,
    pub slope: f64,
    pub intercept_err: f64,
    pub slope_err: f64,
    pub chi2: f64,
}

/// Solve the 2x2 weighted normal equations. Returns `None` when the
/// design is singular (fewer than two distinct abscissae).
pub(crate) fn weighted_line_fit(abscissa: &[f64], value: &[f64], weight: &[f64]) -> Option<LineFit> {
    let mut s = 0.0;
    let mut sx = 0.0;
    let mut sy = 0.0;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for ((&a, &v), &w) in abscissa.iter().zip(value).zip(weight) {
        s += w;
        sx += w * a;
        sy += w * v;
        sxx += w * a * a;
        sxy += w * a * v;
    }
    // by Cauchy-Schwarz det >= 0, with equality iff all abscissae agree;
    // a relative threshold catches the rounded-to-almost-zero case
    let det = s * sxx - sx * sx;
    if det <= 1e-12 * (s * sxx + sx * sx) {
        return None;
    }
    let inverse = Matrix2::new(sxx, -sx, -sx, s) / det;
    let solution = inverse * Vector2::new(sy, sxy);
    let (intercept, slope) = (solution[0], solution[1]);
    let mut chi2 = 0.0;
    for ((&a, &v), &w) in abscissa.iter().zip(value).zip(weight) {
        let r = v - intercept - slope * a;
        chi2 += w * r * r;
    }
    Some(LineFit {
        intercept,
        slope,
        // the inverse normal matrix is the parameter covariance
        intercept_err: inverse[(0, 0)].max(0.0).sqrt(),
        slope_err: inverse[(1, 1)].max(0.0).sqrt(),
        chi2,
    })
}

fn centroid_weights(points: &[AdrPoint]) -> (Vec<f64>, Vec<f64>) {
    let wx = points
        .iter()
        .map(|p| 1.0 / p.x_err.max(CENTROID_ERROR_FLOOR).powi(2))
        .collect();
    let wy = points
        .iter()
        .map(|p| 1.0 / p.y_err.max(CENTROID_ERROR_FLOOR).powi(2))
        .collect();
    (wx, wy)
}

/// Weighted intercepts of both axes along a fixed dispersion direction
/// `(u, v)`. Returns `(xref, yref, chi2)`.
fn intercepts_along(
    points: &[AdrPoint],
    shift: &[f64],
    u: f64,
    v: f64,
) -> (FitParameter, FitParameter, f64) {
    let (wx, wy) = centroid_weights(points);
    let mut wsum_x = 0.0;
    let mut vsum_x = 0.0;
    let mut wsum_y = 0.0;
    let mut vsum_y = 0.0;
    for (i, (p, &k)) in points.iter().zip(shift).enumerate() {
        wsum_x += wx[i];
        vsum_x += wx[i] * (p.x - k * u);
        wsum_y += wy[i];
        vsum_y += wy[i] * (p.y - k * v);
    }
    let xref = vsum_x / wsum_x;
    let yref = vsum_y / wsum_y;
    let mut chi2 = 0.0;
    for (i, (p, &k)) in points.iter().zip(shift).enumerate() {
        let rx = p.x - k * u - xref;
        let ry = p.y - k * v - yref;
        chi2 += wx[i] * rx * rx + wy[i] * ry * ry;
    }
    (
        FitParameter::free(xref, (1.0 / wsum_x).sqrt()),
        FitParameter::free(yref, (1.0 / wsum_y).sqrt()),
        chi2,
    )
}

impl AdrModel {
    /// Build a trajectory directly from known geometry, with every
    /// parameter flagged as forced.
    pub fn from_parameters(
        lbda_ref: f64,
        scale: f64,
        airmass: f64,
        parangle: f64,
        xref: f64,
        yref: f64,
    ) -> Self {
        Self {
            lbda_ref,
            scale,
            airmass: FitParameter::forced(airmass),
            parangle: FitParameter::forced(parangle),
            xref: FitParameter::forced(xref),
            yref: FitParameter::forced(yref),
            chi2: 0.0,
            n_points: 0,
        }
    }

    fn tanz(&self) -> f64 {
        (self.airmass.value * self.airmass.value - 1.0).max(0.0).sqrt()
    }

    /// Chromatic displacement along the parallactic direction at `lbda`,
    /// in spatial units, relative to the reference wavelength. Positive
    /// toward bluer wavelengths.
    pub fn refraction_delta(&self, lbda: f64) -> f64 {
        (air_refractive_index(lbda) - air_refractive_index(self.lbda_ref)) * self.tanz()
            * RAD2ARCSEC
            / self.scale
    }

    /// Predicted centroid at `lbda`.
    pub fn predict(&self, lbda: f64) -> (f64, f64) {
        let delta = self.refraction_delta(lbda);
        (
            self.xref.value + delta * self.parangle.value.sin(),
            self.yref.value + delta * self.parangle.value.cos(),
        )
    }

    /// Weighted least-squares trajectory fit through per-slice centroids.
    ///
    /// Supplied constraints are imposed: with both airmass and
    /// parallactic angle known only the reference position is fitted;
    /// with one known, the free linear solution is projected onto the
    /// constraint and the intercepts refit along the resulting
    /// direction.
    pub fn fit(
        points: &[AdrPoint],
        lbda_ref: f64,
        scale: f64,
        constraints: &AdrConstraints,
    ) -> Result<Self, ExtractionError> {
        if points.len() < MIN_TRAJECTORY_POINTS {
            return Err(ExtractionError::InsufficientData {
                needed: MIN_TRAJECTORY_POINTS,
                got: points.len(),
            });
        }

        let shift: Vec<f64> = points
            .iter()
            .map(|p| {
                (air_refractive_index(p.lbda) - air_refractive_index(lbda_ref)) * RAD2ARCSEC / scale
            })
            .collect();

        let model = if let (Some(airmass), Some(parangle)) =
            (constraints.airmass, constraints.parangle)
        {
            let tanz = (airmass * airmass - 1.0).max(0.0).sqrt();
            let (xref, yref, chi2) =
                intercepts_along(points, &shift, tanz * parangle.sin(), tanz * parangle.cos());
            Self {
                lbda_ref,
                scale,
                airmass: FitParameter::forced(airmass),
                parangle: FitParameter::forced(parangle),
                xref,
                yref,
                chi2,
                n_points: points.len(),
            }
        } else {
            let xs: Vec<f64> = points.iter().map(|p| p.x).collect();
            let ys: Vec<f64> = points.iter().map(|p| p.y).collect();
            let (wx, wy) = centroid_weights(points);
            let (Some(x_fit), Some(y_fit)) = (
                weighted_line_fit(&shift, &xs, &wx),
                weighted_line_fit(&shift, &ys, &wy),
            ) else {
                // all points at one wavelength: no lever arm
                return Err(ExtractionError::InsufficientData {
                    needed: MIN_TRAJECTORY_POINTS,
                    got: 1,
                });
            };
            let (u, v) = (x_fit.slope, y_fit.slope);
            let (u_err, v_err) = (x_fit.slope_err, y_fit.slope_err);

            match (constraints.airmass, constraints.parangle) {
                (Some(airmass), None) => {
                    // keep the fitted direction, rescale to the known
                    // zenith distance
                    let norm = u.hypot(v);
                    let (parangle, parangle_err) = if norm > TANZ_FLOOR {
                        (
                            u.atan2(v),
                            ((v * u_err).powi(2) + (u * v_err).powi(2)).sqrt() / (norm * norm),
                        )
                    } else {
                        (0.0, f64::INFINITY)
                    };
                    let tanz = (airmass * airmass - 1.0).max(0.0).sqrt();
                    let (xref, yref, chi2) = intercepts_along(
                        points,
                        &shift,
                        tanz * parangle.sin(),
                        tanz * parangle.cos(),
                    );
                    Self {
                        lbda_ref,
                        scale,
                        airmass: FitParameter::forced(airmass),
                        parangle: FitParameter::free(parangle, parangle_err),
                        xref,
                        yref,
                        chi2,
                        n_points: points.len(),
                    }
                }
                (None, Some(parangle)) => {
                    // project the fitted dispersion onto the known
                    // parallactic direction
                    let tanz = (u * parangle.sin() + v * parangle.cos()).max(0.0);
                    let airmass = (1.0 + tanz * tanz).sqrt();
                    let airmass_err = tanz
                        * ((parangle.sin() * u_err).powi(2) + (parangle.cos() * v_err).powi(2))
                            .sqrt()
                        / airmass;
                    let (xref, yref, chi2) = intercepts_along(
                        points,
                        &shift,
                        tanz * parangle.sin(),
                        tanz * parangle.cos(),
                    );
                    Self {
                        lbda_ref,
                        scale,
                        airmass: FitParameter::free(airmass, airmass_err),
                        parangle: FitParameter::forced(parangle),
                        xref,
                        yref,
                        chi2,
                        n_points: points.len(),
                    }
                }
                // only (None, None) can reach the fallback
                _ => {
                    let tanz = u.hypot(v);
                    let airmass = (1.0 + tanz * tanz).sqrt();
                    let airmass_err =
                        ((u * u_err).powi(2) + (v * v_err).powi(2)).sqrt() / airmass;
                    let (parangle, parangle_err) = if tanz > TANZ_FLOOR {
                        (
                            u.atan2(v),
                            ((v * u_err).powi(2) + (u * v_err).powi(2)).sqrt() / (tanz * tanz),
                        )
                    } else {
                        (0.0, f64::INFINITY)
                    };
                    Self {
                        lbda_ref,
                        scale,
                        airmass: FitParameter::free(airmass, airmass_err),
                        parangle: FitParameter::free(parangle, parangle_err),
                        xref: FitParameter::free(x_fit.intercept, x_fit.intercept_err),
                        yref: FitParameter::free(y_fit.intercept, y_fit.intercept_err),
                        chi2: x_fit.chi2 + y_fit.chi2,
                        n_points: points.len(),
                    }
                }
            }
        };

        debug!(
            "ADR fit: {} points, airmass={:.4} parangle={:.4} rad, ref=({:.3}, {:.3}), chi2={:.3e}",
            model.n_points,
            model.airmass.value,
            model.parangle.value,
            model.xref.value,
            model.yref.value,
            model.chi2
        );
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn synthetic_points(
        airmass: f64,
        parangle: f64,
        xref: f64,
        yref: f64,
        lbda_ref: f64,
        scale: f64,
    ) -> Vec<AdrPoint> {
        let truth = AdrModel::from_parameters(lbda_ref, scale, airmass, parangle, xref, yref);
        (0..8)
            .map(|i| {
                let lbda = 4500.0 + 500.0 * i as f64;
                let (x, y) = truth.predict(lbda);
                AdrPoint {
                    lbda,
                    x,
                    y,
                    x_err: 0.02,
                    y_err: 0.02,
                }
            })
            .collect()
    }

    #[test]
    fn dispersion_formula_matches_the_tabulated_value() {
        // (n - 1) at 5000 A, standard conditions
        assert_relative_eq!(
            air_refractive_index(5000.0) - 1.0,
            2.789638e-4,
            max_relative = 1e-5
        );
        // blue refracts more than red
        assert!(air_refractive_index(4000.0) > air_refractive_index(7000.0));
    }

    #[test]
    fn displacement_decreases_with_wavelength() {
        let model = AdrModel::from_parameters(6000.0, 1.0, 1.3, 0.7, 0.0, 0.0);
        let mut previous = model.refraction_delta(4000.0);
        for i in 1..30 {
            let next = model.refraction_delta(4000.0 + 150.0 * i as f64);
            assert!(next < previous);
            previous = next;
        }
        // zero displacement at the reference wavelength
        assert_abs_diff_eq!(model.refraction_delta(6000.0), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn unit_airmass_means_no_displacement() {
        let model = AdrModel::from_parameters(6000.0, 1.0, 1.0, 0.7, 0.4, -0.1);
        assert_eq!(model.refraction_delta(4500.0), 0.0);
        assert_eq!(model.predict(4500.0), (0.4, -0.1));
    }

    #[test]
    fn free_fit_recovers_the_trajectory() {
        let points = synthetic_points(1.18, 0.8, 0.3, -0.2, 6000.0, 0.43);
        let model = AdrModel::fit(&points, 6000.0, 0.43, &AdrConstraints::default()).unwrap();
        assert_relative_eq!(model.airmass.value, 1.18, max_relative = 1e-8);
        assert_relative_eq!(model.parangle.value, 0.8, max_relative = 1e-8);
        assert_abs_diff_eq!(model.xref.value, 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(model.yref.value, -0.2, epsilon = 1e-9);
        assert!(model.chi2 < 1e-12);
        assert!(!model.airmass.forced);
        assert!(model.airmass.error > 0.0);
    }

    #[test]
    fn reference_wavelength_does_not_change_the_trajectory() {
        let points = synthetic_points(1.18, 0.8, 0.3, -0.2, 6000.0, 0.43);
        let refit = AdrModel::fit(&points, 5200.0, 0.43, &AdrConstraints::default()).unwrap();
        let truth = AdrModel::from_parameters(6000.0, 0.43, 1.18, 0.8, 0.3, -0.2);
        for lbda in [4600.0, 5500.0, 7900.0] {
            let (xa, ya) = refit.predict(lbda);
            let (xb, yb) = truth.predict(lbda);
            assert_abs_diff_eq!(xa, xb, epsilon = 1e-9);
            assert_abs_diff_eq!(ya, yb, epsilon = 1e-9);
        }
    }

    #[test]
    fn fully_constrained_fit_only_moves_the_reference_position() {
        let points = synthetic_points(1.25, -0.4, 1.1, 0.6, 6000.0, 1.0);
        let constraints = AdrConstraints {
            airmass: Some(1.25),
            parangle: Some(-0.4),
        };
        let model = AdrModel::fit(&points, 6000.0, 1.0, &constraints).unwrap();
        assert!(model.airmass.forced);
        assert!(model.parangle.forced);
        assert_eq!(model.airmass.value, 1.25);
        assert_abs_diff_eq!(model.xref.value, 1.1, epsilon = 1e-9);
        assert_abs_diff_eq!(model.yref.value, 0.6, epsilon = 1e-9);
        assert!(model.chi2 < 1e-12);
    }

    #[test]
    fn airmass_constraint_keeps_the_fitted_direction() {
        let points = synthetic_points(1.18, 0.8, 0.3, -0.2, 6000.0, 1.0);
        let constraints = AdrConstraints {
            airmass: Some(1.18),
            parangle: None,
        };
        let model = AdrModel::fit(&points, 6000.0, 1.0, &constraints).unwrap();
        assert!(model.airmass.forced);
        assert!(!model.parangle.forced);
        assert_relative_eq!(model.parangle.value, 0.8, max_relative = 1e-8);
        assert_abs_diff_eq!(model.xref.value, 0.3, epsilon = 1e-9);
    }

    #[test]
    fn parangle_constraint_projects_the_dispersion() {
        let points = synthetic_points(1.18, 0.8, 0.3, -0.2, 6000.0, 1.0);
        let constraints = AdrConstraints {
            airmass: None,
            parangle: Some(0.8),
        };
        let model = AdrModel::fit(&points, 6000.0, 1.0, &constraints).unwrap();
        assert!(model.parangle.forced);
        assert!(!model.airmass.forced);
        assert_relative_eq!(model.airmass.value, 1.18, max_relative = 1e-8);
        assert!(model.airmass.error >= 0.0);
    }

    #[test]
    fn too_few_points_is_insufficient_data() {
        let points = synthetic_points(1.18, 0.8, 0.3, -0.2, 6000.0, 1.0);
        assert!(matches!(
            AdrModel::fit(&points[..2], 6000.0, 1.0, &AdrConstraints::default()),
            Err(ExtractionError::InsufficientData { needed: 3, got: 2 })
        ));
    }

    #[test]
    fn degenerate_wavelengths_are_insufficient_data() {
        let points: Vec<AdrPoint> = (0..4)
            .map(|i| AdrPoint {
                lbda: 5000.0,
                x: i as f64 * 0.1,
                y: 0.0,
                x_err: 0.02,
                y_err: 0.02,
            })
            .collect();
        assert!(matches!(
            AdrModel::fit(&points, 6000.0, 1.0, &AdrConstraints::default()),
            Err(ExtractionError::InsufficientData { .. })
        ));
    }

    #[test]
    fn prediction_round_trips_through_the_fit() {
        let truth = AdrModel::from_parameters(6000.0, 0.43, 1.3, 2.1, -0.5, 0.9);
        let points: Vec<AdrPoint> = (0..12)
            .map(|i| {
                let lbda = 4200.0 + 350.0 * i as f64;
                let (x, y) = truth.predict(lbda);
                AdrPoint {
                    lbda,
                    x,
                    y,
                    x_err: 0.05,
                    y_err: 0.05,
                }
            })
            .collect();
        let fitted = AdrModel::fit(&points, 6000.0, 0.43, &AdrConstraints::default()).unwrap();
        for p in &points {
            let (x, y) = fitted.predict(p.lbda);
            assert_abs_diff_eq!(x, p.x, epsilon = 1e-9);
            assert_abs_diff_eq!(y, p.y, epsilon = 1e-9);
        }
    }
}
