//! Extraction configuration. Everything an [`extract_star`] run needs
//! beyond the cube itself lives here, serializable so a run can be
//! replayed from a JSON snippet.
//!
//! [`extract_star`]: crate::collection::extract_star

use serde::{Deserialize, Serialize};

use crate::adr::AdrConstraints;
use crate::binning::BinSpec;
use crate::psf::{BackgroundKind, ProfileFamily};

/// Which pass the pipeline stops after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopAfter {
    /// Coarse bins fitted, nothing aggregated.
    Coarse,
    /// Chromatic model built (and the refinement pass run when one is
    /// configured), no spectrum extracted.
    Refined,
    /// Full extraction including the forced final pass.
    #[default]
    Full,
}

/// Which parts of the chromatic model the final pass imposes on every
/// slice. A cleared flag leaves the parameter free inside a band around
/// the aggregate estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceFlags {
    /// Ellipticity and position angle.
    pub force_ellipse: bool,
    /// Centroid follows the refraction trajectory.
    pub force_centroid: bool,
    /// Width follows the chromatic power law, ratio included.
    pub force_stddev: bool,
    /// Tail exponent.
    pub force_alpha: bool,
}

impl Default for ForceFlags {
    fn default() -> Self {
        Self {
            force_ellipse: true,
            force_centroid: true,
            force_stddev: true,
            force_alpha: true,
        }
    }
}

/// Full description of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Radial profile family fitted to every slice.
    pub profile: ProfileFamily,
    pub background: BackgroundKind,
    /// Binning of the first, shape-measuring pass.
    pub coarse: BinSpec,
    /// Optional second pass on finer bins with tightened priors.
    pub refined: Option<BinSpec>,
    /// Binning of the forced final pass; `None` extracts every
    /// wavelength sample.
    pub final_bins: Option<BinSpec>,
    /// Centroid guess for the first pass; `None` uses image moments.
    pub centroid: Option<(f64, f64)>,
    /// Half-widths of the centroid search box, spatial units.
    pub centroid_err: (f64, f64),
    /// Ellipticity bounds of the free passes.
    pub ell_bounds: (f64, f64),
    /// Rejection threshold of the shape aggregation, in sigma.
    pub shape_rejection_sigma: f64,
    pub force: ForceFlags,
    /// Known observing geometry, if any.
    pub adr: AdrConstraints,
    /// Arcseconds per spatial unit of the spaxel frame.
    pub spaxel_unit: f64,
    pub stop_after: StopAfter,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            profile: ProfileFamily::GaussMoffat,
            background: BackgroundKind::TiltedPlane,
            coarse: BinSpec::Count {
                range: (5000.0, 8000.0),
                count: 6,
            },
            refined: None,
            final_bins: None,
            centroid: None,
            centroid_err: (5.0, 5.0),
            ell_bounds: (0.01, 0.5),
            shape_rejection_sigma: 2.0,
            force: ForceFlags::default(),
            adr: AdrConstraints::default(),
            spaxel_unit: 1.0,
            stop_after: StopAfter::Full,
        }
    }
}

impl ExtractionConfig {
    /// Hands-off setup for a roughly centred point source: a handful of
    /// wide shape bins, a ten-bin refinement pass, and a tight centroid
    /// box around the field centre.
    pub fn automatic() -> Self {
        Self {
            coarse: BinSpec::Count {
                range: (4500.0, 8000.0),
                count: 3,
            },
            refined: Some(BinSpec::Count {
                range: (4500.0, 8000.0),
                count: 10,
            }),
            centroid: Some((0.0, 0.0)),
            centroid_err: (3.0, 3.0),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_force_the_whole_chromatic_model() {
        let config = ExtractionConfig::default();
        assert!(config.force.force_ellipse);
        assert!(config.force.force_centroid);
        assert!(config.force.force_stddev);
        assert!(config.force.force_alpha);
        assert_eq!(config.stop_after, StopAfter::Full);
        assert!(config.refined.is_none());
        assert!(config.adr.airmass.is_none());
    }

    #[test]
    fn automatic_setup_adds_a_refinement_pass() {
        let config = ExtractionConfig::automatic();
        assert!(matches!(
            config.refined,
            Some(BinSpec::Count { count: 10, .. })
        ));
        assert_eq!(config.centroid, Some((0.0, 0.0)));
        assert_eq!(config.centroid_err, (3.0, 3.0));
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = ExtractionConfig::automatic();
        config.profile = ProfileFamily::Gaussian;
        config.adr.airmass = Some(1.3);
        config.stop_after = StopAfter::Refined;
        let text = serde_json::to_string(&config).unwrap();
        let back: ExtractionConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn partial_json_fills_in_nothing_silently() {
        // every field is explicit; a truncated config must not parse
        let err = serde_json::from_str::<ExtractionConfig>("{\"profile\":\"Gaussian\"}");
        assert!(err.is_err());
    }
}
