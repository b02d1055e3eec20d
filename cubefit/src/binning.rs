//! Wavelength binning.
//!
//! Every fitting pass works on wavelength-integrated slices; the bins that
//! define those slices are half-open intervals `[lo, hi)` in Angstrom,
//! produced either from an explicit edge list or by tiling a range.

use serde::{Deserialize, Serialize};

use crate::cube::Cube;
use crate::error::ExtractionError;

/// A half-open wavelength interval `[lo, hi)` in Angstrom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WavelengthBin {
    lo: f64,
    hi: f64,
}

impl WavelengthBin {
    /// Build a single bin. Fails when the interval is reversed, empty, or
    /// not finite.
    pub fn new(lo: f64, hi: f64) -> Result<Self, ExtractionError> {
        if !lo.is_finite() || !hi.is_finite() || hi <= lo {
            return Err(ExtractionError::InvalidRange { lo, hi });
        }
        Ok(Self { lo, hi })
    }

    /// `n` contiguous equal-width bins covering `[lo, hi]`, ascending.
    pub fn linspace(lo: f64, hi: f64, n: usize) -> Result<Vec<Self>, ExtractionError> {
        if !lo.is_finite() || !hi.is_finite() || hi <= lo {
            return Err(ExtractionError::InvalidRange { lo, hi });
        }
        if n < 1 {
            return Err(ExtractionError::InvalidBinCount { n });
        }
        let width = (hi - lo) / n as f64;
        Ok((0..n)
            .map(|i| {
                let a = lo + width * i as f64;
                // force exact closure at the top edge
                let b = if i + 1 == n { hi } else { lo + width * (i + 1) as f64 };
                Self { lo: a, hi: b }
            })
            .collect())
    }

    /// Equal bins of approximately `width` Angstrom tiling `[lo, hi]`.
    /// The count is rounded up, so the realized width never exceeds the
    /// requested one.
    pub fn from_width(lo: f64, hi: f64, width: f64) -> Result<Vec<Self>, ExtractionError> {
        if !width.is_finite() || width <= 0.0 {
            return Err(ExtractionError::InvalidBinWidth { width });
        }
        if !lo.is_finite() || !hi.is_finite() || hi <= lo {
            return Err(ExtractionError::InvalidRange { lo, hi });
        }
        let n = ((hi - lo) / width).ceil().max(1.0) as usize;
        Self::linspace(lo, hi, n)
    }

    /// Validate an explicit `(lo, hi)` edge list: each pair increasing,
    /// pairs ascending and non-overlapping (gaps are allowed).
    pub fn from_edges(edges: &[(f64, f64)]) -> Result<Vec<Self>, ExtractionError> {
        if edges.is_empty() {
            return Err(ExtractionError::InvalidBinCount { n: 0 });
        }
        let mut bins = Vec::with_capacity(edges.len());
        let mut prev_hi = f64::NEG_INFINITY;
        for &(lo, hi) in edges {
            let bin = Self::new(lo, hi)?;
            if lo < prev_hi {
                return Err(ExtractionError::InvalidRange { lo, hi });
            }
            prev_hi = hi;
            bins.push(bin);
        }
        Ok(bins)
    }

    pub fn lo(&self) -> f64 {
        self.lo
    }

    pub fn hi(&self) -> f64 {
        self.hi
    }

    /// Midpoint, the representative wavelength of a slice.
    pub fn center(&self) -> f64 {
        0.5 * (self.lo + self.hi)
    }

    pub fn width(&self) -> f64 {
        self.hi - self.lo
    }

    /// Half-open membership test.
    pub fn contains(&self, lbda: f64) -> bool {
        lbda >= self.lo && lbda < self.hi
    }
}

/// How a pass's wavelength bins are specified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinSpec {
    /// Explicit `(lo, hi)` edge pairs, ascending.
    Edges(Vec<(f64, f64)>),
    /// `count` equal bins over `range`.
    Count { range: (f64, f64), count: usize },
    /// Equal bins of approximately `width` Angstrom over `range`.
    Width { range: (f64, f64), width: f64 },
    /// One bin per cube wavelength sample.
    PerSample,
}

impl BinSpec {
    /// Materialize the bins against a cube's wavelength axis.
    pub fn resolve(&self, cube: &Cube) -> Result<Vec<WavelengthBin>, ExtractionError> {
        match self {
            BinSpec::Edges(edges) => WavelengthBin::from_edges(edges),
            BinSpec::Count { range, count } => WavelengthBin::linspace(range.0, range.1, *count),
            BinSpec::Width { range, width } => WavelengthBin::from_width(range.0, range.1, *width),
            BinSpec::PerSample => per_sample_bins(cube),
        }
    }

}

/// One bin per wavelength sample, edges at the midpoints between
/// neighbouring samples. The outermost edges extend half the first and
/// last sample spacings.
fn per_sample_bins(cube: &Cube) -> Result<Vec<WavelengthBin>, ExtractionError> {
    let lbda = cube.lbda();
    let n = lbda.len();
    if n == 0 {
        return Err(ExtractionError::InvalidBinCount { n: 0 });
    }
    if n == 1 {
        return Ok(vec![WavelengthBin::new(lbda[0] - 0.5, lbda[0] + 0.5)?]);
    }
    let mut bins = Vec::with_capacity(n);
    for i in 0..n {
        let lo = if i == 0 {
            lbda[0] - 0.5 * (lbda[1] - lbda[0])
        } else {
            0.5 * (lbda[i - 1] + lbda[i])
        };
        let hi = if i + 1 == n {
            lbda[n - 1] + 0.5 * (lbda[n - 1] - lbda[n - 2])
        } else {
            0.5 * (lbda[i] + lbda[i + 1])
        };
        bins.push(WavelengthBin::new(lo, hi)?);
    }
    Ok(bins)
}
