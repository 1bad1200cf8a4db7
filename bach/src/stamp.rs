// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::config::Config;
use crate::error::Result;
use crate::image::Image;

/// Per-stamp statistics, filled in stage by stage.
#[derive(Clone, Copy, Debug, Default)]
pub struct StampStats {
    /// Sky background estimate (histogram mode).
    pub sky_est: f64,
    /// FWHM-scaled half inter-quartile range of the pixel values.
    pub fwhm: f64,
    /// Per-stamp kernel normalization from the direction test.
    pub norm: f64,
    /// Deviation of `norm` from the clipped mean, in standard deviations.
    pub diff: f64,
    /// Per-substamp residual from the last fit iteration.
    pub chi2: f64,
}

/// A bright, locally maximal peak inside a stamp; the unit of fitting.
#[derive(Clone, Debug)]
pub struct SubStamp {
    pub image_coords: (usize, usize),
    pub stamp_coords: (usize, usize),
    /// Usefulness score: summed flux of the window pixels above threshold.
    pub score: f64,
}

/// One rectangular tile of an image, with a local pixel copy and, after
/// design assembly, the per-stamp system (`w`, `q`, `b`).
#[derive(Clone, Default)]
pub struct Stamp {
    pub coords: (usize, usize),
    pub size: (usize, usize),
    pub data: Vec<f64>,
    pub stats: StampStats,
    pub substamps: Vec<SubStamp>,
    /// Basis-convolved substamp vectors plus background vectors, each of
    /// length `f_substamp_width^2`.
    pub w: Vec<Vec<f64>>,
    /// Gram matrix of `w`, `(n_psf + 2)` square, 1-indexed.
    pub q: Vec<Vec<f64>>,
    /// Dot products of `w` with the other image, 1-indexed.
    pub b: Vec<f64>,
}

impl Stamp {
    pub fn pixels(&self) -> usize {
        self.size.0 * self.size.1
    }

    pub fn value(&self, x: usize, y: usize) -> f64 {
        debug_assert!(x < self.size.0 && y < self.size.1);
        self.data[x + y * self.size.0]
    }

    pub fn has_substamps(&self) -> bool {
        !self.substamps.is_empty()
    }
}

/// Tiles both images into the configured grid. Tile width is
/// `width / stamps_x` (height likewise); the last column and row absorb the
/// remainder. Template and science stamps share coordinates pairwise.
pub fn create_stamps(
    template: &Image,
    science: &Image,
    cfg: &Config,
) -> Result<(Vec<Stamp>, Vec<Stamp>)> {
    let (width, height) = template.size();
    let mut template_stamps = Vec::new();
    let mut science_stamps = Vec::new();

    for j in 0..cfg.stamps_y {
        for i in 0..cfg.stamps_x {
            let start_x = i * (width / cfg.stamps_x);
            let start_y = j * (height / cfg.stamps_y);
            let stop_x = if i == cfg.stamps_x - 1 {
                width
            } else {
                start_x + width / cfg.stamps_x
            };
            let stop_y = if j == cfg.stamps_y - 1 {
                height
            } else {
                start_y + height / cfg.stamps_y
            };
            let size = (stop_x - start_x, stop_y - start_y);

            let mut template_data = Vec::with_capacity(size.0 * size.1);
            let mut science_data = Vec::with_capacity(size.0 * size.1);
            for y in start_y..stop_y {
                for x in start_x..stop_x {
                    template_data.push(template.get(x, y));
                    science_data.push(science.get(x, y));
                }
            }

            template_stamps.push(Stamp {
                coords: (start_x, start_y),
                size,
                data: template_data,
                ..Stamp::default()
            });
            science_stamps.push(Stamp {
                coords: (start_x, start_y),
                size,
                data: science_data,
                ..Stamp::default()
            });
        }
    }

    Ok((template_stamps, science_stamps))
}

#[cfg(test)]
mod test {
    use super::create_stamps;
    use crate::config::Config;
    use crate::error::Result;
    use crate::image::Image;

    fn ramp_image(name: &str, w: usize, h: usize) -> Result<Image> {
        let data = (0..w * h).map(|i| i as f64).collect();
        Image::from_data(name, w, h, data)
    }

    #[test]
    fn grid_partitions_image() -> Result<()> {
        let mut cfg = Config::default();
        cfg.stamps_x = 3;
        cfg.stamps_y = 2;
        let t = ramp_image("t", 100, 70)?;
        let s = ramp_image("s", 100, 70)?;
        let (stamps, _) = create_stamps(&t, &s, &cfg)?;

        assert_eq!(stamps.len(), 6);
        let total: usize = stamps.iter().map(|s| s.pixels()).sum();
        assert_eq!(total, 100 * 70);

        // Last column and row absorb the remainder.
        assert_eq!(stamps[2].size.0, 100 - 2 * 33);
        assert_eq!(stamps[5].size.1, 70 - 35);
        Ok(())
    }

    #[test]
    fn stamp_data_matches_image() -> Result<()> {
        let mut cfg = Config::default();
        cfg.stamps_x = 2;
        cfg.stamps_y = 2;
        let t = ramp_image("t", 64, 64)?;
        let s = ramp_image("s", 64, 64)?;
        let (stamps, _) = create_stamps(&t, &s, &cfg)?;

        let st = &stamps[3];
        assert_eq!(st.coords, (32, 32));
        assert_eq!(st.value(5, 7), t.get(37, 39));
        Ok(())
    }
}
