//! CUBEFIT - point-source spectrum extraction from IFU data cubes
//!
//! Multi-pass forced PSF photometry: every wavelength slice is fitted
//! with an analytic profile plus a low-order background, the per-slice
//! shapes are aggregated into a chromatic model (elliptical shape,
//! seeing-width power law, atmospheric-refraction trajectory), and a
//! final forced pass extracts the source spectrum together with model,
//! PSF, and background cubes.
//!
//! Passes run through a state machine:
//! Init -> Pass1 -> Aggregated [-> Pass2 -> Aggregated] -> Finalized

pub mod adr;
pub mod binning;
pub mod chromatic;
pub mod collection;
pub mod config;
pub mod cube;
pub mod error;
pub mod fitter;
pub mod lm;
pub mod psf;
pub mod shape;
pub mod slice;

// Re-export the types a typical extraction run touches
pub use crate::adr::{AdrConstraints, AdrModel, AdrPoint};
pub use crate::binning::{BinSpec, WavelengthBin};
pub use crate::chromatic::{ChromaticProfileModel, WidthLaw};
pub use crate::collection::{
    extract_star, ExtractionResult, ExtractionState, SliceCollection,
};
pub use crate::config::{ExtractionConfig, ForceFlags, StopAfter};
pub use crate::cube::{Cube, Header, SpaxelFrame, Spectrum};
pub use crate::error::ExtractionError;
pub use crate::fitter::{fit_slice, FitPriors, ParamPrior, SliceFitResult};
pub use crate::psf::{
    BackgroundKind, FitParameter, ProfileFamily, PsfModel, PsfParameters,
};
pub use crate::shape::ShapeEstimate;
pub use crate::slice::Slice;
