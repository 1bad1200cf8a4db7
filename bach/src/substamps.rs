// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Substamp identification: bright, isolated pixel peaks inside each stamp,
//! found in passes of descending brightness and ranked by summed flux.

use crate::config::Config;
use crate::error::Result;
use crate::image::Image;
use crate::mask::{ImageMask, MaskFlags};
use crate::stamp::{Stamp, SubStamp};
use crate::stats::calc_stats;
use crate::util::tracing_wrappers::*;

/// Flags that disqualify a pixel for the given image. The other image's
/// bad/skip flags do not count against this one.
fn bad_mask(is_template: bool) -> MaskFlags {
    let mut bad = MaskFlags::ALL & !MaskFlags::OK_CONV;
    if is_template {
        bad = bad & !(MaskFlags::BAD_PIXEL_S | MaskFlags::SKIP_S);
    } else {
        bad = bad & !(MaskFlags::BAD_PIXEL_T | MaskFlags::SKIP_T);
    }
    bad
}

fn bad_pixel_flag(is_template: bool) -> MaskFlags {
    if is_template {
        MaskFlags::BAD_PIXEL_T
    } else {
        MaskFlags::BAD_PIXEL_S
    }
}

fn skip_flag(is_template: bool) -> MaskFlags {
    if is_template {
        MaskFlags::SKIP_T
    } else {
        MaskFlags::SKIP_S
    }
}

/// Sums the usable flux above threshold in the substamp window, clipped to
/// the stamp. Returns 0 (candidate rejected) when any window pixel is
/// disqualified or saturated; saturated pixels get flagged in passing.
fn check_substamp(
    candidate: &SubStamp,
    stamp: &Stamp,
    image: &Image,
    mask: &mut ImageMask,
    bad: MaskFlags,
    is_template: bool,
    cfg: &Config,
) -> f64 {
    let h = cfg.h_substamp_width as i64;
    let (cx, cy) = (
        candidate.image_coords.0 as i64,
        candidate.image_coords.1 as i64,
    );
    let x0 = stamp.coords.0 as i64;
    let y0 = stamp.coords.1 as i64;
    let mut score = 0.0;

    for y in (cy - h)..=(cy + h) {
        if y < y0 || y >= y0 + stamp.size.1 as i64 {
            continue;
        }
        for x in (cx - h)..=(cx + h) {
            if x < x0 || x >= x0 + stamp.size.0 as i64 {
                continue;
            }
            let index = image.pixel_index(x as usize, y as usize);
            if mask.is_masked(index, bad) {
                return 0.0;
            }
            if image[index] >= cfg.thresh_high {
                mask.mask_pix(x as usize, y as usize, bad_pixel_flag(is_template));
                return 0.0;
            }
            if (image[index] - stamp.stats.sky_est) / stamp.stats.fwhm > cfg.thresh_kern_fit {
                score += image[index];
            }
        }
    }
    score
}

/// Finds up to `2 * max_k_substamps` bright peaks in the stamp, in passes
/// of decreasing brightness, then keeps the `max_k_substamps` best by
/// score. Returns whether any substamp survived.
pub fn find_substamps(
    stamp: &mut Stamp,
    image: &Image,
    mask: &mut ImageMask,
    is_template: bool,
    cfg: &Config,
) -> bool {
    let sky = stamp.stats.sky_est;
    let fwhm = stamp.stats.fwhm;
    let floor_lim = sky + cfg.thresh_kern_fit * fwhm;
    let max_candidates = 2 * cfg.max_k_substamps;
    let bad = bad_mask(is_template);
    let h = cfg.h_substamp_width as i64;

    let mut dfrac = 0.9;
    while stamp.substamps.len() < max_candidates {
        let lowest_psf_lim = floor_lim.max(sky + (cfg.thresh_high - sky) * dfrac);
        'scan: for y in 0..stamp.size.1 {
            let abs_y = y + stamp.coords.1;
            for x in 0..stamp.size.0 {
                let abs_x = x + stamp.coords.0;
                let abs_index = image.pixel_index(abs_x, abs_y);

                if mask.is_masked(abs_index, bad) {
                    continue;
                }
                let v = stamp.value(x, y);
                if v > cfg.thresh_high {
                    mask.mask_pix(abs_x, abs_y, bad_pixel_flag(is_template));
                    continue;
                }
                if (v - sky) * (1.0 / fwhm) < cfg.thresh_kern_fit {
                    continue;
                }
                if v <= lowest_psf_lim {
                    continue;
                }

                // Candidate: refine to the brightest usable pixel in the
                // surrounding window, clipped to the stamp.
                let mut candidate = SubStamp {
                    image_coords: (abs_x, abs_y),
                    stamp_coords: (x, y),
                    score: v,
                };
                let x0 = stamp.coords.0 as i64;
                let y0 = stamp.coords.1 as i64;
                for ky in (abs_y as i64 - h)..=(abs_y as i64 + h) {
                    if ky < y0 || ky >= y0 + stamp.size.1 as i64 {
                        continue;
                    }
                    for kx in (abs_x as i64 - h)..=(abs_x as i64 + h) {
                        if kx < x0 || kx >= x0 + stamp.size.0 as i64 {
                            continue;
                        }
                        let k_index = image.pixel_index(kx as usize, ky as usize);
                        if mask.is_masked(k_index, bad) {
                            continue;
                        }
                        if image[k_index] >= cfg.thresh_high {
                            mask.mask_pix(kx as usize, ky as usize, bad_pixel_flag(is_template));
                            continue;
                        }
                        if (image[k_index] - sky) * (1.0 / fwhm) < cfg.thresh_kern_fit {
                            continue;
                        }
                        if image[k_index] > candidate.score {
                            candidate.score = image[k_index];
                            candidate.image_coords = (kx as usize, ky as usize);
                            candidate.stamp_coords =
                                ((kx - x0) as usize, (ky - y0) as usize);
                        }
                    }
                }

                candidate.score =
                    check_substamp(&candidate, stamp, image, mask, bad, is_template, cfg);
                if candidate.score == 0.0 {
                    continue;
                }

                // Accepted: exclude its window from further candidates.
                let (sx, sy) = (
                    candidate.stamp_coords.0 as i64,
                    candidate.stamp_coords.1 as i64,
                );
                for ky in (sy - h)..=(sy + h) {
                    if ky < 0 || ky >= stamp.size.1 as i64 {
                        continue;
                    }
                    for kx in (sx - h)..=(sx + h) {
                        if kx < 0 || kx >= stamp.size.0 as i64 {
                            continue;
                        }
                        mask.mask_pix(
                            (kx + x0) as usize,
                            (ky + y0) as usize,
                            skip_flag(is_template),
                        );
                    }
                }
                stamp.substamps.push(candidate);

                if stamp.substamps.len() >= max_candidates {
                    break 'scan;
                }
            }
        }
        if lowest_psf_lim == floor_lim {
            break;
        }
        dfrac -= 0.2;
    }

    if stamp.substamps.is_empty() {
        debug!(coords = ?stamp.coords, "no suitable substamps found");
        return false;
    }

    stamp
        .substamps
        .sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    stamp.substamps.truncate(cfg.max_k_substamps);
    debug!(
        coords = ?stamp.coords,
        count = stamp.substamps.len(),
        "substamps accepted"
    );
    true
}

/// Runs statistics and substamp finding over both stamp lists, then drops
/// stamps that found nothing. Returns the filled fraction per image.
pub fn identify_substamps(
    template_stamps: &mut Vec<Stamp>,
    template_image: &Image,
    science_stamps: &mut Vec<Stamp>,
    science_image: &Image,
    mask: &mut ImageMask,
    cfg: &Config,
) -> Result<(f64, f64)> {
    debug_assert_eq!(template_stamps.len(), science_stamps.len());
    info!(
        template = template_image.name(),
        science = science_image.name(),
        "identifying substamps"
    );

    for i in 0..template_stamps.len() {
        calc_stats(&mut template_stamps[i], template_image, mask, cfg)?;
        calc_stats(&mut science_stamps[i], science_image, mask, cfg)?;
        find_substamps(&mut template_stamps[i], template_image, mask, true, cfg);
        find_substamps(&mut science_stamps[i], science_image, mask, false, cfg);
    }

    let old_count = template_stamps.len();
    template_stamps.retain(Stamp::has_substamps);
    science_stamps.retain(Stamp::has_substamps);

    info!(
        template = template_stamps.len(),
        science = science_stamps.len(),
        total = old_count,
        "non-empty stamps"
    );
    Ok((
        template_stamps.len() as f64 / old_count as f64,
        science_stamps.len() as f64 / old_count as f64,
    ))
}

#[cfg(test)]
mod test {
    use super::{find_substamps, identify_substamps};
    use crate::config::Config;
    use crate::error::Result;
    use crate::image::Image;
    use crate::mask::{ImageMask, MaskFlags};
    use crate::stamp::create_stamps;
    use crate::stats::calc_stats;
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;
    use test_log::test;

    fn small_config() -> Config {
        let mut cfg = Config::default();
        cfg.stamps_x = 1;
        cfg.stamps_y = 1;
        cfg.h_kernel_width = 2;
        cfg.h_substamp_width = 3;
        cfg.thresh_high = 10_000.0;
        cfg.thresh_kern_fit = 1.0;
        cfg.max_k_substamps = 4;
        cfg
    }

    /// Sky 100 with sigma-2 noise and Gaussian stars of the given
    /// amplitudes and widths.
    fn star_field(name: &str, w: usize, h: usize, stars: &[(usize, usize, f64, f64)]) -> Image {
        let mut rng = XorShiftRng::seed_from_u64(11);
        let mut data = vec![0.0f64; w * h];
        for (i, v) in data.iter_mut().enumerate() {
            let g: f64 = (0..12).map(|_| rng.random::<f64>()).sum::<f64>() - 6.0;
            *v = 100.0 + 2.0 * g;
            let (x, y) = (i % w, i / w);
            for &(sx, sy, amp, sigma) in stars {
                let dx = x as f64 - sx as f64;
                let dy = y as f64 - sy as f64;
                *v += amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
        }
        Image::from_data(name, w, h, data).unwrap()
    }

    #[test]
    fn finds_star_peak() -> Result<()> {
        let cfg = small_config();
        let image = star_field("t", 64, 64, &[(30, 30, 2000.0, 1.5)]);
        let mut mask = ImageMask::new(64, 64)?;
        let (mut stamps, _) = create_stamps(&image, &image, &cfg)?;
        let stamp = &mut stamps[0];
        calc_stats(stamp, &image, &mut mask, &cfg)?;

        assert!(find_substamps(stamp, &image, &mut mask, true, &cfg));
        assert_eq!(stamp.substamps[0].image_coords, (30, 30));
        assert!(stamp.substamps.len() <= cfg.max_k_substamps);
        // The window around the accepted peak is excluded from reuse.
        let index = mask.pixel_index(30, 30);
        assert!(mask.is_masked(index, MaskFlags::SKIP_T));
        Ok(())
    }

    #[test]
    fn ranks_brighter_star_first() -> Result<()> {
        let cfg = small_config();
        let image = star_field(
            "t",
            64,
            64,
            &[(20, 20, 800.0, 1.5), (44, 44, 3000.0, 1.5)],
        );
        let mut mask = ImageMask::new(64, 64)?;
        let (mut stamps, _) = create_stamps(&image, &image, &cfg)?;
        let stamp = &mut stamps[0];
        calc_stats(stamp, &image, &mut mask, &cfg)?;

        assert!(find_substamps(stamp, &image, &mut mask, true, &cfg));
        assert_eq!(stamp.substamps[0].image_coords, (44, 44));
        let scores: Vec<f64> = stamp.substamps.iter().map(|s| s.score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        Ok(())
    }

    #[test]
    fn saturated_peak_is_rejected() -> Result<()> {
        let cfg = small_config();
        let mut image = star_field("t", 64, 64, &[(30, 30, 2000.0, 1.5)]);
        image.set(30, 30, cfg.thresh_high + 1.0);
        let mut mask = ImageMask::new(64, 64)?;
        let (mut stamps, _) = create_stamps(&image, &image, &cfg)?;
        let stamp = &mut stamps[0];
        calc_stats(stamp, &image, &mut mask, &cfg)?;
        find_substamps(stamp, &image, &mut mask, true, &cfg);

        let index = mask.pixel_index(30, 30);
        assert!(mask.is_masked(index, MaskFlags::BAD_PIXEL_T));
        for ss in &stamp.substamps {
            let dx = ss.image_coords.0 as i64 - 30;
            let dy = ss.image_coords.1 as i64 - 30;
            assert!(
                dx.abs() > cfg.h_substamp_width as i64 || dy.abs() > cfg.h_substamp_width as i64,
                "substamp at {:?} overlaps the saturated pixel",
                ss.image_coords
            );
        }
        Ok(())
    }

    #[test]
    fn drops_empty_stamps() -> Result<()> {
        let mut cfg = small_config();
        cfg.stamps_x = 2;
        cfg.stamps_y = 1;
        // One star on the left half only; pure noise stays below the final
        // threshold only if the noise never clears sky + fwhm, so use a
        // high per-pixel cut instead.
        cfg.thresh_kern_fit = 30.0;
        let template = star_field("t", 128, 64, &[(30, 30, 2000.0, 1.5)]);
        let science = star_field("s", 128, 64, &[(30, 30, 2000.0, 1.5)]);
        let mut mask = ImageMask::new(128, 64)?;
        let (mut tstamps, mut sstamps) = create_stamps(&template, &science, &cfg)?;
        let (filled_t, filled_s) = identify_substamps(
            &mut tstamps,
            &template,
            &mut sstamps,
            &science,
            &mut mask,
            &cfg,
        )?;

        assert_eq!(tstamps.len(), 1);
        assert_eq!(sstamps.len(), 1);
        assert!((filled_t - 0.5).abs() < 1e-12);
        assert!((filled_s - 0.5).abs() < 1e-12);
        Ok(())
    }
}
