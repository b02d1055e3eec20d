//! Pipeline orchestration. A [`SliceCollection`] walks one cube through
//! the coarse shape pass, the chromatic aggregation, an optional
//! refinement pass, and the forced final pass that produces the
//! spectrum and the component cubes.

use std::fmt;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::adr::{AdrModel, AdrPoint};
use crate::binning::{BinSpec, WavelengthBin};
use crate::chromatic::{shape_prior, ChromaticProfileModel, WidthLaw};
use crate::config::{ExtractionConfig, StopAfter};
use crate::cube::{Cube, Spectrum};
use crate::error::ExtractionError;
use crate::fitter::{
    fit_slice, FitPriors, ParamPrior, SliceFitResult, DEFAULT_ALPHA_BOUNDS,
    DEFAULT_STDDEV_BOUNDS, DEFAULT_STDDEV_RATIO_BOUNDS,
};
use crate::psf::PsfModel;
use crate::shape::ShapeEstimate;
use crate::slice::Slice;

/// Centroid box half-widths around the predicted trajectory, for passes
/// that keep the centroid free once a trajectory exists.
const TRACKED_CENTROID_ERR: (f64, f64) = (0.2, 0.2);

/// Where a collection stands in the extraction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionState {
    Init,
    /// Coarse pass fitted, awaiting aggregation.
    Pass1 { n_slices: usize },
    /// Chromatic model assembled from the most recent pass.
    Aggregated,
    /// Refinement pass fitted, awaiting re-aggregation.
    Pass2 { n_slices: usize },
    /// Final forced pass done, products available.
    Finalized,
}

impl fmt::Display for ExtractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "initialized"),
            Self::Pass1 { n_slices } => write!(f, "coarse pass over {n_slices} slices"),
            Self::Aggregated => write!(f, "chromatic model aggregated"),
            Self::Pass2 { n_slices } => write!(f, "refinement pass over {n_slices} slices"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

/// Products of the final forced pass.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    /// Point-source spectrum: fitted profile amplitude per final bin,
    /// with the squared amplitude uncertainty as variance.
    pub spectrum: Spectrum,
    /// Profile plus background, evaluated over the cube's frame.
    pub model_cube: Cube,
    /// Point-source component alone.
    pub psf_cube: Cube,
    /// Background component alone.
    pub bkgd_cube: Cube,
}

/// One extraction run over one cube.
///
/// The collection owns every intermediate product, so a caller can stop
/// after any pass and inspect the per-slice fits, the aggregated shape,
/// or the fitted trajectory before committing to the forced extraction.
pub struct SliceCollection<'a> {
    cube: &'a Cube,
    config: ExtractionConfig,
    model: Box<dyn PsfModel>,
    state: ExtractionState,
    coarse_fits: Vec<SliceFitResult>,
    refined_fits: Vec<SliceFitResult>,
    shape: Option<ShapeEstimate>,
    adr: Option<AdrModel>,
    width: Option<WidthLaw>,
    final_fits: Vec<SliceFitResult>,
    result: Option<ExtractionResult>,
}

impl<'a> SliceCollection<'a> {
    pub fn new(cube: &'a Cube, config: ExtractionConfig) -> Self {
        let model = config.profile.model(config.background);
        Self {
            cube,
            config,
            model,
            state: ExtractionState::Init,
            coarse_fits: Vec::new(),
            refined_fits: Vec::new(),
            shape: None,
            adr: None,
            width: None,
            final_fits: Vec::new(),
            result: None,
        }
    }

    pub fn cube(&self) -> &'a Cube {
        self.cube
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn state(&self) -> ExtractionState {
        self.state
    }

    pub fn coarse_fits(&self) -> &[SliceFitResult] {
        &self.coarse_fits
    }

    pub fn refined_fits(&self) -> &[SliceFitResult] {
        &self.refined_fits
    }

    pub fn final_fits(&self) -> &[SliceFitResult] {
        &self.final_fits
    }

    pub fn shape(&self) -> Option<&ShapeEstimate> {
        self.shape.as_ref()
    }

    pub fn adr(&self) -> Option<&AdrModel> {
        self.adr.as_ref()
    }

    pub fn width(&self) -> Option<&WidthLaw> {
        self.width.as_ref()
    }

    pub fn result(&self) -> Option<&ExtractionResult> {
        self.result.as_ref()
    }

    /// The assembled chromatic model, once [`aggregate`] has run.
    ///
    /// [`aggregate`]: Self::aggregate
    pub fn chromatic_model(&self) -> Result<ChromaticProfileModel, ExtractionError> {
        match (&self.shape, self.width, &self.adr) {
            (Some(shape), Some(width), Some(adr)) => Ok(ChromaticProfileModel {
                shape: shape.clone(),
                width,
                adr: adr.clone(),
            }),
            _ => Err(self.not_ready("chromatic_model")),
        }
    }

    fn not_ready(&self, operation: &'static str) -> ExtractionError {
        ExtractionError::NotReady {
            operation,
            state: self.state.to_string(),
        }
    }

    /// Extract and fit every bin. Binning problems abort the pass; a
    /// slice that cannot be fit is kept as a flagged failure so the
    /// output stays aligned with the bins.
    fn fit_bins<F>(
        &self,
        bins: &[WavelengthBin],
        priors_for: F,
    ) -> Result<Vec<SliceFitResult>, ExtractionError>
    where
        F: Fn(&Slice) -> FitPriors + Sync,
    {
        let slices: Vec<Slice> = bins
            .iter()
            .enumerate()
            .map(|(i, bin)| Slice::extract(self.cube, *bin, i))
            .collect::<Result<_, _>>()?;
        Ok(slices
            .par_iter()
            .map(|slice| {
                let priors = priors_for(slice);
                match fit_slice(slice, &*self.model, &priors) {
                    Ok(fit) => fit,
                    Err(err) => {
                        warn!("slice {} dropped: {err}", slice.index());
                        SliceFitResult::failed(
                            slice.index(),
                            *slice.bin(),
                            self.model.family(),
                            self.model.background(),
                        )
                    }
                }
            })
            .collect())
    }

    /// First pass: fit the coarse bins with every shape parameter free.
    pub fn run_coarse(&mut self) -> Result<(), ExtractionError> {
        if !matches!(self.state, ExtractionState::Init) {
            return Err(self.not_ready("run_coarse"));
        }
        let bins = self.config.coarse.resolve(self.cube)?;
        let priors = FitPriors::loose(
            self.config.centroid,
            self.config.centroid_err,
            self.config.ell_bounds,
        );
        let fits = self.fit_bins(&bins, |_| priors.clone())?;
        info!(
            "coarse pass: {}/{} slices converged",
            fits.iter().filter(|f| f.converged).count(),
            fits.len()
        );
        self.state = ExtractionState::Pass1 {
            n_slices: fits.len(),
        };
        self.coarse_fits = fits;
        Ok(())
    }

    /// Aggregate the most recent pass into the chromatic model: the
    /// outlier-cleaned shape, the refraction trajectory through the
    /// fitted centroids, and the seeing-width power law. The reference
    /// wavelength is the mean wavelength of the converged slices.
    pub fn aggregate(&mut self) -> Result<(), ExtractionError> {
        let fits = match self.state {
            ExtractionState::Pass1 { .. } => &self.coarse_fits,
            ExtractionState::Pass2 { .. } => &self.refined_fits,
            _ => return Err(self.not_ready("aggregate")),
        };

        let shape = ShapeEstimate::aggregate(fits, self.config.shape_rejection_sigma)?;

        let converged: Vec<&SliceFitResult> = fits.iter().filter(|f| f.converged).collect();
        let lbda_ref =
            converged.iter().map(|f| f.lbda()).sum::<f64>() / converged.len() as f64;

        let points: Vec<AdrPoint> = converged
            .iter()
            .map(|f| AdrPoint {
                lbda: f.lbda(),
                x: f.params.x0.value,
                y: f.params.y0.value,
                x_err: f.params.x0.error,
                y_err: f.params.y0.error,
            })
            .collect();
        let adr = AdrModel::fit(&points, lbda_ref, self.config.spaxel_unit, &self.config.adr)?;

        let widths: Vec<(f64, f64, f64)> = converged
            .iter()
            .map(|f| (f.lbda(), f.params.stddev.value, f.params.stddev.error))
            .collect();
        let width = WidthLaw::fit(&widths, lbda_ref)?;

        info!(
            "aggregated {} slices: ell={:.4} theta={:.4} stddev_ref={:.4} airmass={:.4}",
            shape.n_used, shape.ell.value, shape.theta.value, width.stddev_ref, adr.airmass.value
        );
        self.shape = Some(shape);
        self.adr = Some(adr);
        self.width = Some(width);
        self.state = ExtractionState::Aggregated;
        Ok(())
    }

    /// Refinement pass: refit `bins` with the shape boxed to one sigma
    /// around the aggregates and the centroid tracking the trajectory.
    /// [`aggregate`] must run again afterwards to fold the result back
    /// into the chromatic model.
    ///
    /// [`aggregate`]: Self::aggregate
    pub fn run_refined(&mut self, bins: &BinSpec) -> Result<(), ExtractionError> {
        if !matches!(self.state, ExtractionState::Aggregated) {
            return Err(self.not_ready("run_refined"));
        }
        let chromatic = self.chromatic_model()?;
        let resolved = bins.resolve(self.cube)?;
        let ell_bounds = self.config.ell_bounds;
        let fits = self.fit_bins(&resolved, |slice| {
            let lbda = slice.lbda();
            FitPriors {
                centroid: Some(chromatic.adr.predict(lbda)),
                centroid_err: TRACKED_CENTROID_ERR,
                force_centroid: false,
                stddev: ParamPrior::guessed(chromatic.width.predict(lbda), DEFAULT_STDDEV_BOUNDS),
                stddev_ratio: shape_prior(
                    chromatic.shape.stddev_ratio,
                    1.0,
                    Some(DEFAULT_STDDEV_RATIO_BOUNDS),
                ),
                ell: shape_prior(chromatic.shape.ell, 1.0, Some(ell_bounds)),
                theta: shape_prior(chromatic.shape.theta, 1.0, None),
                alpha: shape_prior(chromatic.shape.alpha, 1.0, Some(DEFAULT_ALPHA_BOUNDS)),
            }
        })?;
        info!(
            "refinement pass: {}/{} slices converged",
            fits.iter().filter(|f| f.converged).count(),
            fits.len()
        );
        self.state = ExtractionState::Pass2 {
            n_slices: fits.len(),
        };
        self.refined_fits = fits;
        Ok(())
    }

    /// Final pass: impose the chromatic model on the final bins (every
    /// wavelength sample unless configured otherwise) and assemble the
    /// spectrum and the component cubes.
    pub fn run_final(&mut self) -> Result<(), ExtractionError> {
        if !matches!(self.state, ExtractionState::Aggregated) {
            return Err(self.not_ready("run_final"));
        }
        let chromatic = self.chromatic_model()?;
        let binning = self
            .config
            .final_bins
            .clone()
            .unwrap_or(BinSpec::PerSample);
        let bins = binning.resolve(self.cube)?;
        let fits = chromatic.force_fit(
            self.cube,
            &bins,
            &*self.model,
            &self.config.force,
            TRACKED_CENTROID_ERR,
        )?;
        info!(
            "final pass: {}/{} slices converged",
            fits.iter().filter(|f| f.converged).count(),
            fits.len()
        );
        self.result = Some(self.assemble(&fits, &bins));
        self.final_fits = fits;
        self.state = ExtractionState::Finalized;
        Ok(())
    }

    fn assemble(&self, fits: &[SliceFitResult], bins: &[WavelengthBin]) -> ExtractionResult {
        let n_spaxels = self.cube.n_spaxels();
        let lbda = Array1::from_iter(bins.iter().map(|b| b.center()));
        let flux = Array1::from_iter(fits.iter().map(|f| f.params.amplitude.value));
        let variance = Array1::from_iter(fits.iter().map(|f| f.params.amplitude.error.powi(2)));

        let images: Vec<(Array1<f64>, Array1<f64>)> = fits
            .par_iter()
            .map(|fit| {
                let packed = fit.params.to_packed();
                (
                    self.model.profile_image(&packed, self.cube.frame()),
                    self.model.background_image(&packed, self.cube.frame()),
                )
            })
            .collect();
        let mut model = Array2::zeros((fits.len(), n_spaxels));
        let mut psf = Array2::zeros((fits.len(), n_spaxels));
        let mut bkgd = Array2::zeros((fits.len(), n_spaxels));
        for (i, (psf_row, bkgd_row)) in images.iter().enumerate() {
            model.row_mut(i).assign(&(psf_row + bkgd_row));
            psf.row_mut(i).assign(psf_row);
            bkgd.row_mut(i).assign(bkgd_row);
        }

        ExtractionResult {
            spectrum: Spectrum::new(lbda.clone(), flux, variance, self.cube.header().clone()),
            model_cube: self.cube.with_planes(lbda.clone(), model),
            psf_cube: self.cube.with_planes(lbda.clone(), psf),
            bkgd_cube: self.cube.with_planes(lbda, bkgd),
        }
    }
}

/// Run the whole extraction sequence on `cube` and return the finished
/// collection.
///
/// Honors `config.stop_after`; the refinement pass runs only when
/// `config.refined` is set.
pub fn extract_star(
    cube: &Cube,
    config: ExtractionConfig,
) -> Result<SliceCollection<'_>, ExtractionError> {
    let stop_after = config.stop_after;
    let refined = config.refined.clone();
    let mut collection = SliceCollection::new(cube, config);
    collection.run_coarse()?;
    if stop_after == StopAfter::Coarse {
        return Ok(collection);
    }
    collection.aggregate()?;
    if let Some(binning) = refined {
        collection.run_refined(&binning)?;
        collection.aggregate()?;
    }
    if stop_after == StopAfter::Refined {
        return Ok(collection);
    }
    collection.run_final()?;
    Ok(collection)
}
