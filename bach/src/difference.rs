// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Applies the fitted kernel: convolve one image with the spatially
//! varying kernel plus background, subtract from the other. The original
//! runs this on a GPU; the arithmetic is the same here.

use crate::config::Config;
use crate::error::Result;
use crate::image::Image;
use crate::kernel::{Kernel, background_at};
use crate::mask::{ImageMask, MaskFlags};
use crate::util::tracing_wrappers::*;

/// Convolves `image` with the fitted kernel evaluated at every pixel and
/// adds the fitted differential background. Pixels whose kernel window
/// leaves the image, or whose center is bad input, are flagged
/// `BAD_OUTPUT` and left at zero.
pub fn convolve_image(
    image: &Image,
    kernel: &Kernel,
    mask: &mut ImageMask,
    cfg: &Config,
) -> Result<Image> {
    let (width, height) = image.size();
    let mut out = Image::new(format!("{}_conv", image.name()), width, height)?;
    let k = cfg.h_kernel_width as i64;
    let fkw = cfg.f_kernel_width() as i64;

    info!(image = image.name(), "convolving with fitted kernel");
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let in_reach = image.in_bounds(x - k, y - k) && image.in_bounds(x + k, y + k);
            let index = (x + y * width as i64) as usize;
            if !in_reach || mask.is_masked(index, MaskFlags::BAD_INPUT) {
                mask.mask_pix(x as usize, y as usize, MaskFlags::BAD_OUTPUT);
                continue;
            }

            let (kern, _) = kernel.make_kernel(cfg, (width, height), x as usize, y as usize)?;
            let mut acc = 0.0;
            for v in -k..=k {
                for u in -k..=k {
                    let img_index = (x + u) + (y + v) * width as i64;
                    acc += image[img_index as usize] * kern[((k - u) + (k - v) * fkw) as usize];
                }
            }
            acc += background_at(
                &kernel.solution,
                cfg,
                (width, height),
                x as usize,
                y as usize,
            );
            out.set(x as usize, y as usize, acc);
        }
    }
    Ok(out)
}

/// Difference image: `target - convolved`, zeroed wherever the convolution
/// was unusable.
pub fn subtract(target: &Image, convolved: &Image, mask: &mut ImageMask) -> Result<Image> {
    let (width, height) = target.size();
    let mut out = Image::new("diff", width, height)?;

    for y in 0..height {
        for x in 0..width {
            let index = x + y * width;
            if mask.is_masked(index, MaskFlags::BAD_OUTPUT | MaskFlags::BAD_INPUT) {
                mask.mask_pix(x, y, MaskFlags::BAD_OUTPUT);
                continue;
            }
            out.set(x, y, target[index] - convolved[index]);
        }
    }
    Ok(out)
}
