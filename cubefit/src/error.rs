use thiserror::Error;

/// Errors surfaced by binning, slice extraction, the fitting stages, and
/// the orchestration state machine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    /// A wavelength interval with no width, or reversed edges.
    #[error("invalid wavelength range [{lo}, {hi}] A")]
    InvalidRange { lo: f64, hi: f64 },

    /// A bin count that cannot tile a range.
    #[error("invalid bin count {n}")]
    InvalidBinCount { n: usize },

    /// A non-positive bin width.
    #[error("invalid bin width {width} A")]
    InvalidBinWidth { width: f64 },

    /// No cube wavelength sample falls inside the bin.
    #[error("no wavelength samples in bin [{lo}, {hi}] A")]
    EmptyBin { lo: f64, hi: f64 },

    /// A slice with no spaxel carrying a usable measurement.
    #[error("slice {index} has no spaxel with positive variance and finite flux")]
    DegenerateSlice { index: usize },

    /// A cross-slice stage received fewer usable inputs than it needs.
    #[error("insufficient data: {got} usable inputs, {needed} required")]
    InsufficientData { needed: usize, got: usize },

    /// An orchestration call arrived in the wrong state.
    #[error("{operation} is not available in state {state}")]
    NotReady {
        operation: &'static str,
        state: String,
    },
}
