// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use crate::error::{Error, Result};
use crate::util::tri_num;

/// Pipeline configuration. A value of this type is threaded explicitly
/// through every stage; nothing reads process-wide state.
#[derive(Clone, Debug)]
pub struct Config {
    /// Requested stamp grid. Shrunk by [`Config::with_grid_for`] when the
    /// tiles would be too small for a kernel fit.
    pub stamps_x: usize,
    pub stamps_y: usize,
    /// Derived stamp tile size, filled in by [`Config::with_grid_for`].
    pub f_stamp_width: usize,
    /// Kernel half-width; the full width is `2 * h_kernel_width + 1`.
    pub h_kernel_width: usize,
    /// Substamp window half-width.
    pub h_substamp_width: usize,
    /// Saturation cutoff.
    pub thresh_high: f64,
    /// Floor cutoff.
    pub thresh_low: f64,
    /// Minimum (value - sky) / fwhm for a substamp pixel.
    pub thresh_kern_fit: f64,
    /// Sigma-clip rejection threshold.
    pub sig_clip_alpha: f64,
    /// Global-fit outlier threshold, in clipped standard deviations.
    pub sig_kern_fit: f64,
    /// Inter-quartile range of a unit Gaussian, for the FWHM scale.
    pub iq_range: f64,
    /// Gaussian polynomial degrees, one entry per basis Gaussian.
    pub dg: Vec<usize>,
    /// Gaussian width parameters; the filters use `exp(-x^2 * bg[g])`.
    pub bg: Vec<f64>,
    /// Spatial polynomial order of the kernel coefficients.
    pub kernel_order: usize,
    /// Spatial polynomial order of the differential background.
    pub background_order: usize,
    /// Per-stamp cap on kept substamps.
    pub max_k_substamps: usize,
}

impl Default for Config {
    fn default() -> Config {
        // Gaussian widths 0.7, 1.5 and 3.0 px: bg = 1 / (2 sigma^2).
        let sigmas = [0.7f64, 1.5, 3.0];
        Config {
            stamps_x: 10,
            stamps_y: 10,
            f_stamp_width: 0,
            h_kernel_width: 10,
            h_substamp_width: 15,
            thresh_high: 25000.0,
            thresh_low: 0.0,
            thresh_kern_fit: 20.0,
            sig_clip_alpha: 3.0,
            sig_kern_fit: 2.0,
            iq_range: 1.35,
            dg: vec![6, 4, 2],
            bg: sigmas.iter().map(|s| 1.0 / (2.0 * s * s)).collect(),
            kernel_order: 2,
            background_order: 1,
            max_k_substamps: 8,
        }
    }
}

impl Config {
    pub fn f_kernel_width(&self) -> usize {
        2 * self.h_kernel_width + 1
    }

    pub fn f_substamp_width(&self) -> usize {
        2 * self.h_substamp_width + 1
    }

    /// Number of kernel basis components.
    pub fn n_psf(&self) -> usize {
        self.dg.iter().map(|&d| tri_num(d + 1)).sum()
    }

    /// Number of background polynomial components.
    pub fn n_bg_comp(&self) -> usize {
        tri_num(self.background_order + 1)
    }

    /// Number of spatial polynomial terms per kernel component.
    pub fn n_kernel_spatial(&self) -> usize {
        tri_num(self.kernel_order + 1)
    }

    /// Length of the solution vector, excluding the reserved element 0.
    pub fn n_solution(&self) -> usize {
        self.n_psf() * self.n_kernel_spatial() + self.n_bg_comp() + 1
    }

    /// Width of the edge strip masked as unusable in both images.
    pub fn border_size(&self) -> usize {
        self.h_substamp_width + self.h_kernel_width
    }

    pub fn validate(&self) -> Result<()> {
        if self.h_kernel_width == 0 {
            return Err(Error::InvalidKernelWidth(self.h_kernel_width));
        }
        if self.h_substamp_width == 0 {
            return Err(Error::InvalidSubstampWidth(self.h_substamp_width));
        }
        if self.dg.is_empty() {
            return Err(Error::EmptyBasis);
        }
        if self.dg.len() != self.bg.len() {
            return Err(Error::MismatchedBasis(self.dg.len(), self.bg.len()));
        }
        if self.stamps_x == 0 || self.stamps_y == 0 || self.max_k_substamps == 0 {
            return Err(Error::EmptyGrid(self.stamps_x, self.stamps_y));
        }
        Ok(())
    }

    /// Normalizes the stamp grid against an actual image size: derives the
    /// stamp tile width and, when the requested grid would make tiles too
    /// small to hold a substamp window plus convolution margin, coarsens the
    /// grid to fit. Returns the adjusted copy; `self` is untouched.
    pub fn with_grid_for(&self, width: usize, height: usize) -> Result<Config> {
        self.validate()?;
        let mut cfg = self.clone();

        let needed = cfg.f_substamp_width() + 2 * cfg.h_kernel_width;
        if width < needed || height < needed {
            return Err(Error::InvalidImageSize(width, height));
        }

        let tile = (width / cfg.stamps_x).min(height / cfg.stamps_y);
        let mut f_stamp_width = tile.saturating_sub(cfg.f_kernel_width());
        if f_stamp_width % 2 == 0 {
            f_stamp_width = f_stamp_width.saturating_sub(1);
        }
        if f_stamp_width < cfg.f_substamp_width() {
            f_stamp_width = cfg.f_substamp_width() + cfg.f_kernel_width();
            if f_stamp_width % 2 == 0 {
                f_stamp_width -= 1;
            }
            cfg.stamps_x = (width / f_stamp_width).max(1);
            cfg.stamps_y = (height / f_stamp_width).max(1);
        }
        cfg.f_stamp_width = f_stamp_width;
        Ok(cfg)
    }
}
