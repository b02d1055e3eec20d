//! Spaxel grid geometries.

/// Spatial layout of a simulated integral-field unit: one position per
/// spaxel plus the footprint polygon shared by all of them.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaxelGrid {
    x: Vec<f64>,
    y: Vec<f64>,
    vertices: Vec<[f64; 2]>,
    pitch: f64,
}

impl SpaxelGrid {
    /// Square `side x side` grid centred on the origin with the given
    /// centre-to-centre pitch.
    pub fn square(side: usize, pitch: f64) -> Self {
        let half = (side as f64 - 1.0) / 2.0;
        let mut x = Vec::with_capacity(side * side);
        let mut y = Vec::with_capacity(side * side);
        for row in 0..side {
            for col in 0..side {
                x.push((col as f64 - half) * pitch);
                y.push((row as f64 - half) * pitch);
            }
        }
        let h = pitch / 2.0;
        Self {
            x,
            y,
            vertices: vec![[-h, -h], [h, -h], [h, h], [-h, h]],
            pitch,
        }
    }

    /// Hexagonally packed grid: a centre spaxel surrounded by `rings`
    /// full rings, `1 + 3 * rings * (rings + 1)` spaxels in total.
    /// Adjacent centres are one pitch apart.
    pub fn hexagonal(rings: usize, pitch: f64) -> Self {
        let r = rings as i64;
        let mut x = Vec::new();
        let mut y = Vec::new();
        for q in -r..=r {
            let lo = (-r).max(-q - r);
            let hi = r.min(-q + r);
            for w in lo..=hi {
                x.push(pitch * (q as f64 + w as f64 / 2.0));
                y.push(pitch * 3.0_f64.sqrt() / 2.0 * w as f64);
            }
        }
        // pointy-top hexagon with flat-to-flat width equal to the pitch
        let circum = pitch / 3.0_f64.sqrt();
        let vertices = (0..6)
            .map(|k| {
                let angle = (30.0 + 60.0 * k as f64).to_radians();
                [circum * angle.cos(), circum * angle.sin()]
            })
            .collect();
        Self {
            x,
            y,
            vertices,
            pitch,
        }
    }

    pub fn n_spaxels(&self) -> usize {
        self.x.len()
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.vertices
    }

    pub fn pitch(&self) -> f64 {
        self.pitch
    }
}
