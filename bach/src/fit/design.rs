// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Per-stamp design assembly: each basis component is convolved with the
//! stamp's best substamp window to form the design vectors `w`, their Gram
//! matrix `q`, and the right-hand side `b` against the other image.

use crate::config::Config;
use crate::image::Image;
use crate::kernel::Kernel;
use crate::stamp::Stamp;
use crate::util::tracing_wrappers::*;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Convolves basis component `n` with the image around the stamp's best
/// substamp, as a two-pass separable convolution: a vertical pass with the
/// reversed y-filter over the window widened by the kernel half-width, then
/// a horizontal pass with the reversed x-filter. The result is pushed onto
/// `stamp.w`; `subtract_first` removes the component-0 projection for the
/// orthogonalized even-even components.
fn conv_stamp(
    stamp: &mut Stamp,
    image: &Image,
    kernel: &Kernel,
    n: usize,
    subtract_first: bool,
    cfg: &Config,
) {
    let h = cfg.h_substamp_width as i64;
    let k = cfg.h_kernel_width as i64;
    let fss = cfg.f_substamp_width();
    let (ssx, ssy) = stamp.substamps[0].image_coords;
    let (ssx, ssy) = (ssx as i64, ssy as i64);
    let width = image.width() as i64;

    let tmp_w = fss + 2 * cfg.h_kernel_width;
    let mut tmp = vec![0.0f64; tmp_w * fss];
    for j in -h..=h {
        for i in -(h + k)..=(h + k) {
            let mut acc = 0.0;
            for y in -k..=k {
                let img_index = (ssx + i) + (ssy + j + y) * width;
                acc += image[img_index as usize] * kernel.filter_y[n][(k - y) as usize];
            }
            tmp[(i + h + k) as usize + (j + h) as usize * tmp_w] = acc;
        }
    }

    let mut w = vec![0.0f64; fss * fss];
    for j in -h..=h {
        for i in -h..=h {
            let mut acc = 0.0;
            for x in -k..=k {
                acc += tmp[(i + x + h + k) as usize + (j + h) as usize * tmp_w]
                    * kernel.filter_x[n][(k - x) as usize];
            }
            w[(i + h) as usize + (j + h) as usize * fss] = acc;
        }
    }

    if subtract_first {
        for (wi, w0i) in w.iter_mut().zip(stamp.w[0].iter()) {
            *wi -= w0i;
        }
    }
    stamp.w.push(w);
}

/// Gram matrix of the design vectors, `(n_psf + 2)` square and 1-indexed.
/// Only the lower triangle and the leading background row are filled; the
/// consumers contract against exactly those entries.
fn create_q(stamp: &mut Stamp, cfg: &Config) {
    let n_psf = cfg.n_psf();
    let pix = cfg.f_substamp_width() * cfg.f_substamp_width();
    stamp.q = vec![vec![0.0; n_psf + 2]; n_psf + 2];

    for i in 0..n_psf {
        for j in 0..=i {
            let mut q = 0.0;
            for p in 0..pix {
                q += stamp.w[i][p] * stamp.w[j][p];
            }
            stamp.q[i + 1][j + 1] = q;
        }
    }

    for i in 0..n_psf {
        let mut p0 = 0.0;
        for p in 0..pix {
            p0 += stamp.w[i][p] * stamp.w[n_psf][p];
        }
        stamp.q[n_psf + 1][i + 1] = p0;
    }

    let mut q = 0.0;
    for p in 0..pix {
        q += stamp.w[n_psf][p] * stamp.w[n_psf][p];
    }
    stamp.q[n_psf + 1][n_psf + 1] = q;
}

/// Right-hand side: dot products of the design vectors with the other
/// image over the substamp window, 1-indexed.
fn create_b(stamp: &mut Stamp, image: &Image, cfg: &Config) {
    let n_psf = cfg.n_psf();
    let h = cfg.h_substamp_width as i64;
    let fss = cfg.f_substamp_width();
    let (ssx, ssy) = stamp.substamps[0].image_coords;
    let (ssx, ssy) = (ssx as i64, ssy as i64);
    let width = image.width() as i64;

    stamp.b = vec![0.0; n_psf + 2];
    for i in 0..=n_psf {
        let mut p0 = 0.0;
        for y in -h..=h {
            for x in -h..=h {
                let win = (x + h) as usize + (y + h) as usize * fss;
                let img_index = (x + ssx) + (y + ssy) * width;
                p0 += stamp.w[i][win] * image[img_index as usize];
            }
        }
        stamp.b[i + 1] = p0;
    }
}

/// Assembles the full per-stamp design against the chosen direction:
/// `conv_image` is convolved with the basis, `target_image` feeds the
/// right-hand side. Returns false when the stamp has no substamp left.
pub fn fill_stamp(
    stamp: &mut Stamp,
    conv_image: &Image,
    target_image: &Image,
    kernel: &Kernel,
    cfg: &Config,
) -> bool {
    if stamp.substamps.is_empty() {
        debug!(coords = ?stamp.coords, "no eligible substamps, stamp rejected");
        return false;
    }
    stamp.w.clear();
    stamp.q.clear();
    stamp.b.clear();

    for (n, term) in kernel.terms.iter().enumerate() {
        let subtract_first = n > 0 && term.x % 2 == 0 && term.y % 2 == 0;
        conv_stamp(stamp, conv_image, kernel, n, subtract_first, cfg);
    }

    // Background polynomial vectors over the substamp window, normalized to
    // image coordinates.
    let n_psf = cfg.n_psf();
    let fss = cfg.f_substamp_width();
    let h = cfg.h_substamp_width as i64;
    let (ssx, ssy) = stamp.substamps[0].image_coords;
    let (ssx, ssy) = (ssx as i64, ssy as i64);
    let half_x = 0.5 * conv_image.width() as f64;
    let half_y = 0.5 * conv_image.height() as f64;

    for _ in 0..cfg.n_bg_comp() {
        stamp.w.push(vec![0.0; fss * fss]);
    }
    for x in (ssx - h)..=(ssx + h) {
        for y in (ssy - h)..=(ssy + h) {
            let win = (x - (ssx - h)) as usize + (y - (ssy - h)) as usize * fss;
            let xnorm = (x as f64 - half_x) / half_x;
            let ynorm = (y as f64 - half_y) / half_y;
            let mut nvec = n_psf;
            let mut ax = 1.0;
            for j in 0..=cfg.background_order {
                let mut ay = 1.0;
                for _ in 0..=(cfg.background_order - j) {
                    stamp.w[nvec][win] = ax * ay;
                    nvec += 1;
                    ay *= ynorm;
                }
                ax *= xnorm;
            }
        }
    }

    create_q(stamp, cfg);
    create_b(stamp, target_image, cfg);
    true
}

/// Fills every stamp's design for one fit direction. The stamps are
/// independent and read-only towards the images, so this fans out when the
/// `parallel` feature is on.
pub fn fill_stamps(
    stamps: &mut [Stamp],
    conv_image: &Image,
    target_image: &Image,
    kernel: &Kernel,
    cfg: &Config,
) {
    #[cfg(feature = "parallel")]
    stamps.par_iter_mut().for_each(|stamp| {
        fill_stamp(stamp, conv_image, target_image, kernel, cfg);
    });
    #[cfg(not(feature = "parallel"))]
    for stamp in stamps.iter_mut() {
        fill_stamp(stamp, conv_image, target_image, kernel, cfg);
    }
}
