//! CUBESIM - synthetic IFU data cubes
//!
//! Renders an analytic chromatic point source (elliptical core-plus-tail
//! profile, power-law width, arbitrary centroid trajectory) over a flat
//! sky onto square or hexagonal spaxel grids, with optional sub-spaxel
//! sampling and seeded Gaussian noise. The rendered amplitude scale is
//! total source flux per wavelength, so extraction codes can be checked
//! against the input flux law directly.

pub mod grid;
pub mod source;

pub use crate::grid::SpaxelGrid;
pub use crate::source::{
    render_cube, FluxLaw, NoiseModel, Observation, SourceShape, SyntheticCube,
};
