//! In-memory cube and spectrum containers.
//!
//! Spatial geometry is a list of spaxel positions sharing one polygon
//! template, not a raster: an image is a 1-D array indexed by spaxel, so
//! square and hexagonal lattices (and fields with dead spaxels) all look
//! the same to the fitting stages.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array1, Array2};

/// Free-form key/value metadata carried from input to every product.
pub type Header = BTreeMap<String, String>;

/// Spaxel geometry shared by a cube and everything derived from it.
#[derive(Debug, Clone)]
pub struct SpaxelFrame {
    x: Array1<f64>,
    y: Array1<f64>,
    /// Polygon template in spatial units, as vertex offsets from a spaxel
    /// centre. Shared by every spaxel.
    vertices: Vec<[f64; 2]>,
}

impl SpaxelFrame {
    /// # Panics
    ///
    /// Panics when the coordinate arrays disagree in length; that is a
    /// programming error, not a data condition.
    pub fn new(x: Array1<f64>, y: Array1<f64>, vertices: Vec<[f64; 2]>) -> Self {
        assert_eq!(
            x.len(),
            y.len(),
            "spaxel coordinate arrays must have equal length"
        );
        Self { x, y, vertices }
    }

    pub fn n_spaxels(&self) -> usize {
        self.x.len()
    }

    pub fn x(&self) -> &Array1<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.vertices
    }
}

/// A spectrograph data cube: a wavelength axis crossed with a spaxel set.
///
/// `flux` and `variance` have shape `(n_wavelengths, n_spaxels)`, so
/// `flux.row(i)` is the monochromatic image at `lbda[i]`.
#[derive(Debug, Clone)]
pub struct Cube {
    lbda: Array1<f64>,
    flux: Array2<f64>,
    variance: Array2<f64>,
    frame: Arc<SpaxelFrame>,
    header: Header,
}

impl Cube {
    /// # Panics
    ///
    /// Panics when the array shapes disagree with each other or with the
    /// frame; shape mismatches are programming errors, not data
    /// conditions.
    pub fn new(
        lbda: Array1<f64>,
        flux: Array2<f64>,
        variance: Array2<f64>,
        frame: Arc<SpaxelFrame>,
        header: Header,
    ) -> Self {
        assert_eq!(
            flux.dim(),
            variance.dim(),
            "flux and variance must have the same shape"
        );
        assert_eq!(
            flux.nrows(),
            lbda.len(),
            "flux rows must match the wavelength axis"
        );
        assert_eq!(
            flux.ncols(),
            frame.n_spaxels(),
            "flux columns must match the spaxel frame"
        );
        Self {
            lbda,
            flux,
            variance,
            frame,
            header,
        }
    }

    pub fn lbda(&self) -> &Array1<f64> {
        &self.lbda
    }

    pub fn flux(&self) -> &Array2<f64> {
        &self.flux
    }

    pub fn variance(&self) -> &Array2<f64> {
        &self.variance
    }

    pub fn frame(&self) -> &Arc<SpaxelFrame> {
        &self.frame
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn n_wavelengths(&self) -> usize {
        self.lbda.len()
    }

    pub fn n_spaxels(&self) -> usize {
        self.frame.n_spaxels()
    }

    /// First and last sample of the (ascending) wavelength axis.
    pub fn wavelength_range(&self) -> (f64, f64) {
        let n = self.lbda.len();
        if n == 0 {
            (f64::NAN, f64::NAN)
        } else {
            (self.lbda[0], self.lbda[n - 1])
        }
    }

    /// New cube sharing this cube's geometry and header, carrying the
    /// supplied plane stack. The variance planes are zero: derived model
    /// cubes are noiseless by construction.
    pub fn with_planes(&self, lbda: Array1<f64>, planes: Array2<f64>) -> Cube {
        assert_eq!(
            planes.nrows(),
            lbda.len(),
            "plane rows must match the wavelength axis"
        );
        assert_eq!(
            planes.ncols(),
            self.n_spaxels(),
            "plane columns must match the spaxel frame"
        );
        let variance = Array2::zeros(planes.dim());
        Cube {
            lbda,
            flux: planes,
            variance,
            frame: Arc::clone(&self.frame),
            header: self.header.clone(),
        }
    }
}

/// A 1-D spectrum with per-sample variance.
#[derive(Debug, Clone)]
pub struct Spectrum {
    lbda: Array1<f64>,
    flux: Array1<f64>,
    variance: Array1<f64>,
    header: Header,
}

impl Spectrum {
    /// # Panics
    ///
    /// Panics when the array lengths disagree.
    pub fn new(
        lbda: Array1<f64>,
        flux: Array1<f64>,
        variance: Array1<f64>,
        header: Header,
    ) -> Self {
        assert_eq!(lbda.len(), flux.len(), "flux must match the wavelength axis");
        assert_eq!(
            lbda.len(),
            variance.len(),
            "variance must match the wavelength axis"
        );
        Self {
            lbda,
            flux,
            variance,
            header,
        }
    }

    pub fn lbda(&self) -> &Array1<f64> {
        &self.lbda
    }

    pub fn flux(&self) -> &Array1<f64> {
        &self.flux
    }

    pub fn variance(&self) -> &Array1<f64> {
        &self.variance
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.lbda.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lbda.is_empty()
    }
}
