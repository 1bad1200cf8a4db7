// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Per-stamp statistics: a sigma-clipped mean/stddev helper and the
//! adaptive-histogram sky and FWHM estimate.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::mask::{ImageMask, MaskFlags};
use crate::stamp::Stamp;
use crate::util::random::{Ran1, STATS_SEED};
use crate::util::tracing_wrappers::*;

/// Degenerate-data sentinel for the clipped standard deviation.
pub const DEGENERATE_STDDEV: f64 = 1e10;

/// Pixels with `|value| <= NEAR_ZERO` are treated as missing data.
pub const NEAR_ZERO: f64 = 1e-10;

/// Iteratively recomputes mean and standard deviation of `data`, rejecting
/// points beyond `sig_clip_alpha` standard deviations each round. Runs at
/// most `iterations` rounds or until the survivor set is stable. Degenerate
/// input yields `(0.0, DEGENERATE_STDDEV)`.
pub fn sigma_clip(data: &[f64], iterations: usize, cfg: &Config) -> (f64, f64) {
    if data.is_empty() {
        warn!("sigma clip called with no data");
        return (0.0, DEGENERATE_STDDEV);
    }

    let mut mean = 0.0;
    let mut std_dev = 0.0;
    let mut curr_n = 0usize;
    let mut prev_n = data.len();
    let mut clipped = vec![false; data.len()];

    for _ in 0..iterations {
        if curr_n == prev_n {
            break;
        }
        curr_n = prev_n;
        mean = 0.0;
        std_dev = 0.0;
        for (v, dropped) in data.iter().zip(clipped.iter()) {
            if !dropped {
                mean += v;
                std_dev += v * v;
            }
        }

        if prev_n <= 1 {
            warn!(survivors = prev_n, "sigma clip ran out of points");
            return (0.0, DEGENERATE_STDDEV);
        }
        mean /= prev_n as f64;
        std_dev = ((std_dev - prev_n as f64 * mean * mean) / (prev_n - 1) as f64).sqrt();

        prev_n = 0;
        let inv_std_dev = 1.0 / std_dev;
        for (v, dropped) in data.iter().zip(clipped.iter_mut()) {
            if !*dropped {
                if (v - mean).abs() * inv_std_dev > cfg.sig_clip_alpha {
                    *dropped = true;
                } else {
                    prev_n += 1;
                }
            }
        }
    }

    (mean, std_dev)
}

/// Estimates the stamp's sky background (histogram mode) and pixel-value
/// FWHM (scaled half inter-quartile range) with an adaptive 256-bin
/// histogram. NaN pixels are masked `NAN_PIXEL | BAD_INPUT` on first sight.
///
/// Degenerate stamps (no usable pixels, or no pixel-value variation) keep
/// their zeroed statistics and are dropped downstream for lack of
/// substamps.
pub fn calc_stats(
    stamp: &mut Stamp,
    image: &Image,
    mask: &mut ImageMask,
    cfg: &Config,
) -> Result<()> {
    const N_SAMPLE: usize = 100;
    const UP_PROC: f64 = 0.9;
    const MID_PROC: f64 = 0.5;

    let num_pix = stamp.pixels();
    if num_pix < N_SAMPLE {
        return Err(Error::StampTooSmall(num_pix, N_SAMPLE));
    }

    // Reproducible random sample of up to 100 usable pixels.
    let mut rng = Ran1::new(STATS_SEED);
    let mut values = Vec::with_capacity(N_SAMPLE);
    for _ in 0..num_pix {
        if values.len() >= N_SAMPLE {
            break;
        }
        let rand_x = (rng.next_f64() * stamp.size.0 as f64).floor() as usize;
        let rand_y = (rng.next_f64() * stamp.size.1 as f64).floor() as usize;
        let xi = rand_x + stamp.coords.0;
        let yi = rand_y + stamp.coords.1;
        let index_i = image.pixel_index(xi, yi);
        if mask.is_masked_any(index_i) || image[index_i].abs() <= NEAR_ZERO {
            continue;
        }
        values.push(stamp.value(rand_x, rand_y));
    }
    if values.is_empty() {
        warn!(
            coords = ?stamp.coords,
            "no usable pixels in statistics sample"
        );
        return Ok(());
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let mut bin_size = (values[(UP_PROC * values.len() as f64) as usize]
        - values[(MID_PROC * values.len() as f64) as usize])
        / N_SAMPLE as f64;
    let mut lower_bin_val = values[(MID_PROC * values.len() as f64) as usize] - 128.0 * bin_size;

    // All usable pixels of the stamp, for the clip and the histogram.
    let mut usable = Vec::new();
    for y in 0..stamp.size.1 {
        for x in 0..stamp.size.0 {
            let xi = x + stamp.coords.0;
            let yi = y + stamp.coords.1;
            let index_i = image.pixel_index(xi, yi);
            if mask.is_masked_any(index_i) || image[index_i].abs() <= NEAR_ZERO {
                continue;
            }
            if image[index_i].is_nan() {
                mask.mask_pix(xi, yi, MaskFlags::NAN_PIXEL | MaskFlags::BAD_INPUT);
                continue;
            }
            usable.push(stamp.value(x, y));
        }
    }

    let (mean, std_dev) = sigma_clip(&usable, 3, cfg);
    let inv_std_dev = 1.0 / std_dev;

    let mut bins = [0u32; 256];
    let mut attempts = 0;
    let (lower, upper) = loop {
        if attempts >= 5 {
            warn!(coords = ?stamp.coords, "histogram did not settle in 5 attempts");
            return Ok(());
        }

        bins.fill(0);
        let mut ok_count = 0u32;
        for y in 0..stamp.size.1 {
            for x in 0..stamp.size.0 {
                let xi = x + stamp.coords.0;
                let yi = y + stamp.coords.1;
                let index_i = image.pixel_index(xi, yi);
                if mask.is_masked_any(index_i) || image[index_i].abs() <= NEAR_ZERO {
                    continue;
                }
                let v = stamp.value(x, y);
                if (v - mean).abs() * inv_std_dev > cfg.sig_clip_alpha {
                    continue;
                }
                let bin = (((v - lower_bin_val) / bin_size).floor() as i64 + 1).clamp(0, 255);
                bins[bin as usize] += 1;
                ok_count += 1;
            }
        }

        if ok_count == 0 || bin_size == 0.0 {
            warn!(coords = ?stamp.coords, "no good pixels or variation in pixels");
            return Ok(());
        }
        let tenth = ok_count as f64 / 10.0;

        // Densest contiguous window holding 10% of the points.
        let mut max_dens = 0.0;
        let mut max_index: i64 = -1;
        let mut sum_bins = 0.0;
        let mut lower_index = 1usize;
        let mut upper_index = 1usize;
        while upper_index < 255 {
            while sum_bins < tenth && upper_index < 255 {
                sum_bins += bins[upper_index] as f64;
                upper_index += 1;
            }
            let dens = sum_bins / (upper_index - lower_index) as f64;
            if dens > max_dens {
                max_dens = dens;
                max_index = lower_index as i64;
            }
            sum_bins -= bins[lower_index] as f64;
            lower_index += 1;
        }
        let max_index = if (0..=255).contains(&max_index) {
            max_index as usize
        } else {
            0
        };

        // Intensity-weighted mode over that window.
        let mut sum_bins = 0.0;
        let mut sum_expect = 0.0;
        let mut i = max_index;
        while sum_bins < tenth && i < 255 {
            sum_bins += bins[i] as f64;
            sum_expect += (i as f64) * bins[i] as f64;
            i += 1;
        }
        let mode_bin = sum_expect / sum_bins + 0.5;
        stamp.stats.sky_est = lower_bin_val + bin_size * (mode_bin - 1.0);

        // 25%- and 75%-ile bins, linearly interpolated.
        let lower_target = ok_count as f64 * 0.25;
        let upper_target = ok_count as f64 * 0.75;
        let mut sum_bins = 0.0;
        let mut i = 0usize;
        while sum_bins < lower_target {
            sum_bins += bins[i] as f64;
            i += 1;
        }
        let lower = i as f64 - (sum_bins - lower_target) / bins[i - 1] as f64;
        while sum_bins < upper_target {
            sum_bins += bins[i] as f64;
            i += 1;
        }
        let upper = i as f64 - (sum_bins - upper_target) / bins[i - 1] as f64;

        if lower < 1.0 || upper > 255.0 {
            debug!(coords = ?stamp.coords, "expanding bin size");
            lower_bin_val -= 128.0 * bin_size;
            bin_size *= 2.0;
            attempts += 1;
        } else if upper - lower < 40.0 {
            debug!(coords = ?stamp.coords, "shrinking bin size");
            bin_size /= 3.0;
            lower_bin_val = stamp.stats.sky_est - 128.0 * bin_size;
            attempts += 1;
        } else {
            break (lower, upper);
        }
    };

    stamp.stats.fwhm = bin_size * (upper - lower) / cfg.iq_range;
    Ok(())
}
