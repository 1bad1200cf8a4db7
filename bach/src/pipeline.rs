// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Stage orchestration: masking, stamp grid, substamp identification,
//! per-direction design assembly, direction choice, the global fit, and the
//! final convolve-and-subtract.

use crate::config::Config;
use crate::difference::{convolve_image, subtract};
use crate::error::{Error, Result};
use crate::fit::{fill_stamps, fit_kernel, test_fit};
use crate::image::Image;
use crate::kernel::Kernel;
use crate::mask::{ImageMask, MaskFlags};
use crate::stamp::{Stamp, create_stamps};
use crate::substamps::identify_substamps;
use crate::util::tracing_wrappers::*;

/// Which image is convolved to match the other.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    ConvolveTemplate,
    ConvolveScience,
}

pub struct PipelineResult {
    pub convolved: Image,
    pub difference: Image,
    pub kernel: Kernel,
    pub direction: Direction,
    pub mask: ImageMask,
}

/// Flags zero, saturated, low and edge pixels of both inputs, and spreads
/// an `OK_CONV` halo around bad input so convolution contamination is
/// tracked without treating those pixels as independently bad.
pub fn mask_input(template: &Image, science: &Image, mask: &mut ImageMask, cfg: &Config) {
    let (width, height) = template.size();
    for y in 0..height {
        for x in 0..width {
            let index = x + y * width;
            if template[index] == 0.0 || science[index] == 0.0 {
                mask.mask_pix(x, y, MaskFlags::BAD_INPUT | MaskFlags::BAD_PIX_VAL);
            }
            if template[index] >= cfg.thresh_high || science[index] >= cfg.thresh_high {
                mask.mask_pix(x, y, MaskFlags::BAD_INPUT | MaskFlags::SAT_PIXEL);
            }
            if template[index] <= cfg.thresh_low || science[index] <= cfg.thresh_low {
                mask.mask_pix(x, y, MaskFlags::BAD_INPUT | MaskFlags::LOW_PIXEL);
            }
        }
    }

    mask.spread(cfg.h_kernel_width);

    let border = cfg.border_size();
    for y in 0..height {
        for x in 0..width {
            if x < border || x >= width - border || y < border || y >= height - border {
                mask.mask_pix(x, y, MaskFlags::BAD_PIXEL_T | MaskFlags::BAD_PIXEL_S);
            }
        }
    }
}

/// Masks the inputs, tiles the grid and identifies substamps. When fewer
/// than 10% of stamps hold substamps the whole pass is retried once with a
/// halved low cutoff; the mask is rebuilt from scratch for the retry.
#[allow(clippy::type_complexity)]
fn find_stamps(
    template: &Image,
    science: &Image,
    mask: &mut ImageMask,
    cfg: &Config,
) -> Result<(Vec<Stamp>, Vec<Stamp>)> {
    mask_input(template, science, mask, cfg);
    let (mut template_stamps, mut science_stamps) = create_stamps(template, science, cfg)?;
    let (filled_t, filled_s) = identify_substamps(
        &mut template_stamps,
        template,
        &mut science_stamps,
        science,
        mask,
        cfg,
    )?;

    if filled_t < 0.1 || filled_s < 0.1 {
        info!(
            filled_t,
            filled_s, "too few usable stamps, retrying with a lower floor cutoff"
        );
        let mut retry_cfg = cfg.clone();
        retry_cfg.thresh_low *= 0.5;
        mask.clear();
        mask_input(template, science, mask, &retry_cfg);
        let (mut t2, mut s2) = create_stamps(template, science, &retry_cfg)?;
        identify_substamps(&mut t2, template, &mut s2, science, mask, &retry_cfg)?;
        if t2.len() > template_stamps.len() || s2.len() > science_stamps.len() {
            template_stamps = t2;
            science_stamps = s2;
        }
    }

    if template_stamps.is_empty() && science_stamps.is_empty() {
        return Err(Error::NoSubstamps);
    }
    Ok((template_stamps, science_stamps))
}

/// Runs the whole differencing pipeline and returns the convolved image,
/// the difference image, the solved kernel and the chosen direction.
pub fn run(template: &Image, science: &Image, cfg: &Config) -> Result<PipelineResult> {
    if template.size() != science.size() {
        let (tw, th) = template.size();
        let (sw, sh) = science.size();
        return Err(Error::DimensionMismatch(tw, th, sw, sh));
    }
    let (width, height) = template.size();
    let cfg = cfg.with_grid_for(width, height)?;
    debug!(
        stamps_x = cfg.stamps_x,
        stamps_y = cfg.stamps_y,
        f_stamp_width = cfg.f_stamp_width,
        "normalized stamp grid"
    );

    let mut mask = ImageMask::new(width, height)?;
    let basis = Kernel::new(&cfg)?;

    let (mut template_stamps, mut science_stamps) =
        find_stamps(template, science, &mut mask, &cfg)?;

    // Assemble both directions: template convolved to match science, and
    // science convolved to match the template.
    fill_stamps(&mut template_stamps, template, science, &basis, &cfg);
    fill_stamps(&mut science_stamps, science, template, &basis, &cfg);

    let merit_template = test_fit(&mut template_stamps, template, science, &mut mask, &cfg);
    let merit_science = test_fit(&mut science_stamps, science, template, &mut mask, &cfg);
    info!(merit_template, merit_science, "direction merits");

    let direction = if merit_science < merit_template {
        Direction::ConvolveScience
    } else {
        Direction::ConvolveTemplate
    };

    let (conv_image, target_image, stamps) = match direction {
        Direction::ConvolveTemplate => (template, science, &mut template_stamps),
        Direction::ConvolveScience => (science, template, &mut science_stamps),
    };
    info!(convolving = conv_image.name(), "direction chosen");

    let mut kernel = Kernel::new(&cfg)?;
    fit_kernel(&mut kernel, stamps, conv_image, target_image, &mut mask, &cfg)?;

    let convolved = convolve_image(conv_image, &kernel, &mut mask, &cfg)?;
    let difference = subtract(target_image, &convolved, &mut mask)?;

    Ok(PipelineResult {
        convolved,
        difference,
        kernel,
        direction,
        mask,
    })
}
