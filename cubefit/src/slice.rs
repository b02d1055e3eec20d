//! Monochromatic slice extraction and moment-based starting estimates.

use std::sync::Arc;

use ndarray::Array1;

use crate::binning::WavelengthBin;
use crate::cube::{Cube, SpaxelFrame};
use crate::error::ExtractionError;

/// One wavelength-integrated spatial image, ready to fit.
#[derive(Debug, Clone)]
pub struct Slice {
    index: usize,
    bin: WavelengthBin,
    flux: Array1<f64>,
    variance: Array1<f64>,
    frame: Arc<SpaxelFrame>,
}

impl Slice {
    /// Average the cube samples falling inside `bin`.
    ///
    /// Flux is the per-spaxel mean over the `m` contributing samples and
    /// the variance is propagated accordingly, `sum(var) / m^2`. A bin
    /// holding exactly one sample therefore returns that sample
    /// unchanged.
    pub fn extract(cube: &Cube, bin: WavelengthBin, index: usize) -> Result<Self, ExtractionError> {
        let rows: Vec<usize> = cube
            .lbda()
            .iter()
            .enumerate()
            .filter(|(_, &l)| bin.contains(l))
            .map(|(i, _)| i)
            .collect();
        if rows.is_empty() {
            return Err(ExtractionError::EmptyBin {
                lo: bin.lo(),
                hi: bin.hi(),
            });
        }
        let m = rows.len() as f64;
        let n_spaxels = cube.n_spaxels();
        let mut flux = Array1::zeros(n_spaxels);
        let mut variance = Array1::zeros(n_spaxels);
        for &r in &rows {
            flux += &cube.flux().row(r);
            variance += &cube.variance().row(r);
        }
        flux.mapv_inplace(|v| v / m);
        variance.mapv_inplace(|v| v / (m * m));
        Ok(Self {
            index,
            bin,
            flux,
            variance,
            frame: Arc::clone(cube.frame()),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bin(&self) -> &WavelengthBin {
        &self.bin
    }

    /// Representative wavelength (bin centre).
    pub fn lbda(&self) -> f64 {
        self.bin.center()
    }

    pub fn flux(&self) -> &Array1<f64> {
        &self.flux
    }

    pub fn variance(&self) -> &Array1<f64> {
        &self.variance
    }

    pub fn frame(&self) -> &Arc<SpaxelFrame> {
        &self.frame
    }

    pub fn n_spaxels(&self) -> usize {
        self.flux.len()
    }

    /// Indices of spaxels carrying a usable measurement: finite flux and
    /// strictly positive variance.
    pub fn usable(&self) -> Vec<usize> {
        (0..self.flux.len())
            .filter(|&i| self.flux[i].is_finite() && self.variance[i] > 0.0)
            .collect()
    }

    /// Image moments over the usable spaxels, the starting estimates for
    /// an unconstrained fit.
    ///
    /// The background estimate is the median flux, the centroid and width
    /// come from background-subtracted moments with negative weights
    /// clipped to zero, and the amplitude is the clipped-weight sum.
    pub fn moments(&self) -> SliceMoments {
        let usable = self.usable();
        let background = median(usable.iter().map(|&i| self.flux[i]));

        let mut wsum = 0.0;
        let mut xsum = 0.0;
        let mut ysum = 0.0;
        for &i in &usable {
            let w = (self.flux[i] - background).max(0.0);
            wsum += w;
            xsum += w * self.frame.x()[i];
            ysum += w * self.frame.y()[i];
        }
        if wsum <= 0.0 {
            // featureless image: fall back to the field centre
            let n = usable.len().max(1) as f64;
            let x = usable.iter().map(|&i| self.frame.x()[i]).sum::<f64>() / n;
            let y = usable.iter().map(|&i| self.frame.y()[i]).sum::<f64>() / n;
            return SliceMoments {
                background,
                amplitude: 0.0,
                x,
                y,
                stddev: 1.0,
            };
        }

        let x = xsum / wsum;
        let y = ysum / wsum;
        let mut var = 0.0;
        for &i in &usable {
            let w = (self.flux[i] - background).max(0.0);
            let dx = self.frame.x()[i] - x;
            let dy = self.frame.y()[i] - y;
            var += w * 0.5 * (dx * dx + dy * dy);
        }
        SliceMoments {
            background,
            amplitude: wsum,
            x,
            y,
            stddev: (var / wsum).sqrt(),
        }
    }
}

/// Moment-based starting estimates for a slice fit.
#[derive(Debug, Clone, Copy)]
pub struct SliceMoments {
    pub background: f64,
    pub amplitude: f64,
    pub x: f64,
    pub y: f64,
    pub stddev: f64,
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        0.5 * (sorted[mid - 1] + sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::BinSpec;
    use crate::cube::Header;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, ArrayView1};

    /// 5x5 unit-pitch square field with a Gaussian blob on a flat sky.
    fn blob_cube() -> Cube {
        let side = 5;
        let mut x = Vec::new();
        let mut y = Vec::new();
        for row in 0..side {
            for col in 0..side {
                x.push(col as f64 - 2.0);
                y.push(row as f64 - 2.0);
            }
        }
        let frame = Arc::new(SpaxelFrame::new(
            Array1::from(x),
            Array1::from(y),
            vec![[-0.5, -0.5], [0.5, -0.5], [0.5, 0.5], [-0.5, 0.5]],
        ));
        let lbda = Array1::from(vec![5000.0, 5100.0, 5200.0, 5300.0]);
        let n_spax = frame.n_spaxels();
        let mut flux = Array2::zeros((lbda.len(), n_spax));
        for i in 0..lbda.len() {
            for j in 0..n_spax {
                let dx = frame.x()[j] - 0.5;
                let dy = frame.y()[j] + 0.25;
                let r2 = dx * dx + dy * dy;
                flux[(i, j)] = 10.0 * (-r2 / (2.0 * 1.2 * 1.2)).exp() + 3.0;
            }
        }
        let variance = Array2::from_elem((lbda.len(), n_spax), 0.04);
        Cube::new(lbda, flux, variance, frame, Header::new())
    }

    #[test]
    fn single_sample_bins_return_the_sample_unchanged() {
        let cube = blob_cube();
        let bin = WavelengthBin::new(5050.0, 5150.0).unwrap();
        let slice = Slice::extract(&cube, bin, 0).unwrap();
        let row: ArrayView1<f64> = cube.flux().row(1);
        for j in 0..cube.n_spaxels() {
            assert_eq!(slice.flux()[j], row[j]);
            assert_eq!(slice.variance()[j], cube.variance()[(1, j)]);
        }
    }

    #[test]
    fn averaging_reduces_variance() {
        let cube = blob_cube();
        let bin = WavelengthBin::new(5000.0, 5300.5).unwrap();
        let slice = Slice::extract(&cube, bin, 0).unwrap();
        // 4 contributing samples: var = 4 * 0.04 / 16
        assert_abs_diff_eq!(slice.variance()[0], 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(slice.flux()[12], cube.flux()[(0, 12)], epsilon = 1e-12);
    }

    #[test]
    fn empty_bins_are_an_error() {
        let cube = blob_cube();
        let bin = WavelengthBin::new(7000.0, 7100.0).unwrap();
        assert!(matches!(
            Slice::extract(&cube, bin, 3),
            Err(ExtractionError::EmptyBin { .. })
        ));
    }

    #[test]
    fn moments_locate_the_blob() {
        let cube = blob_cube();
        let bin = WavelengthBin::new(5000.0, 5300.5).unwrap();
        let slice = Slice::extract(&cube, bin, 0).unwrap();
        let m = slice.moments();
        // clipped moments are biased but must land near the blob
        assert_abs_diff_eq!(m.x, 0.5, epsilon = 0.3);
        assert_abs_diff_eq!(m.y, -0.25, epsilon = 0.3);
        assert!(m.amplitude > 0.0);
        assert!(m.stddev > 0.3 && m.stddev < 3.0);
        assert!(m.background > 2.0 && m.background < 5.0);
    }

    #[test]
    fn unusable_spaxels_are_excluded() {
        let mut cube = blob_cube();
        let n = cube.n_spaxels();
        let mut variance = cube.variance().clone();
        variance[(0, 0)] = 0.0;
        variance[(0, 1)] = -1.0;
        let mut flux = cube.flux().clone();
        flux[(0, 2)] = f64::NAN;
        cube = Cube::new(
            cube.lbda().clone(),
            flux,
            variance,
            Arc::clone(cube.frame()),
            Header::new(),
        );
        let bin = WavelengthBin::new(4950.0, 5050.0).unwrap();
        let slice = Slice::extract(&cube, bin, 0).unwrap();
        let usable = slice.usable();
        assert_eq!(usable.len(), n - 3);
        assert!(!usable.contains(&0));
        assert!(!usable.contains(&1));
        assert!(!usable.contains(&2));
    }

    #[test]
    fn per_sample_bins_pick_up_each_sample_once() {
        let cube = blob_cube();
        let bins = BinSpec::PerSample.resolve(&cube).unwrap();
        assert_eq!(bins.len(), cube.n_wavelengths());
        for (i, bin) in bins.iter().enumerate() {
            let slice = Slice::extract(&cube, *bin, i).unwrap();
            assert_eq!(slice.flux()[0], cube.flux()[(i, 0)]);
            assert_abs_diff_eq!(bin.center(), cube.lbda()[i], epsilon = 1e-9);
        }
    }
}
