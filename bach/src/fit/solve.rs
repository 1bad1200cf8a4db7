// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! The global kernel fit: normal-equation assembly over all accepted
//! stamps, LU solve, iterative outlier rejection, and the per-direction
//! merit used to choose which image gets convolved.

use super::design::fill_stamp;
use crate::config::Config;
use crate::error::Result;
use crate::image::Image;
use crate::kernel::{Kernel, background_at};
use crate::mask::{ImageMask, MaskFlags};
use crate::stamp::Stamp;
use crate::stats::{NEAR_ZERO, sigma_clip};
use crate::util::linalg::{lubksb, ludcmp};
use crate::util::tracing_wrappers::*;
use crate::util::tri_num;

/// Merit value for a direction that produced no usable fit.
pub const UNUSABLE_MERIT: f64 = 666.0;

/// Assembles the global normal-equation matrix over all stamps with
/// substamps, 1-indexed: row/column 1 is the DC kernel component, then the
/// per-basis spatial-polynomial block, then the background polynomial.
/// Also returns the per-stamp spatial weights for the right-hand side.
fn create_matrix(
    stamps: &[Stamp],
    img_size: (usize, usize),
    cfg: &Config,
) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
    let n_comp1 = cfg.n_psf() - 1;
    let n_comp2 = tri_num(cfg.kernel_order + 1);
    let n_comp = n_comp1 * n_comp2;
    let n_bg = cfg.n_bg_comp();
    let mat_size = n_comp + n_bg + 1;
    let pix = cfg.f_substamp_width() * cfg.f_substamp_width();
    let half_x = 0.5 * img_size.0 as f64;
    let half_y = 0.5 * img_size.1 as f64;

    let mut matrix = vec![vec![0.0; mat_size + 1]; mat_size + 1];
    let mut weights = vec![vec![0.0; n_comp2]; stamps.len()];

    for (st, stamp) in stamps.iter().enumerate() {
        if stamp.substamps.is_empty() {
            continue;
        }
        let (ssx, ssy) = stamp.substamps[0].image_coords;
        let fx = (ssx as f64 - half_x) / half_x;
        let fy = (ssy as f64 - half_y) / half_y;

        let mut k = 0;
        let mut a1 = 1.0;
        for i in 0..=cfg.kernel_order {
            let mut a2 = 1.0;
            for _ in 0..=(cfg.kernel_order - i) {
                weights[st][k] = a1 * a2;
                k += 1;
                a2 *= fy;
            }
            a1 *= fx;
        }
        let weight = &weights[st];

        for i in 0..n_comp {
            let i1 = i / n_comp2;
            let i2 = i % n_comp2;
            for j in 0..=i {
                let j1 = j / n_comp2;
                let j2 = j % n_comp2;
                matrix[i + 2][j + 2] += weight[i2] * weight[j2] * stamp.q[i1 + 2][j1 + 2];
            }
        }

        matrix[1][1] += stamp.q[1][1];
        for i in 0..n_comp {
            let i1 = i / n_comp2;
            let i2 = i % n_comp2;
            matrix[i + 2][1] += weight[i2] * stamp.q[i1 + 2][1];
        }

        for ibg in 0..n_bg {
            let i = n_comp + ibg + 1;
            let ivec = n_comp1 + ibg + 1;

            for i1 in 1..=n_comp1 {
                let mut p0 = 0.0;
                for p in 0..pix {
                    p0 += stamp.w[i1][p] * stamp.w[ivec][p];
                }
                for i2 in 0..n_comp2 {
                    let jj = (i1 - 1) * n_comp2 + i2 + 1;
                    matrix[i + 1][jj + 1] += p0 * weight[i2];
                }
            }

            let mut p0 = 0.0;
            for p in 0..pix {
                p0 += stamp.w[0][p] * stamp.w[ivec][p];
            }
            matrix[i + 1][1] += p0;

            for jbg in 0..=ibg {
                let mut q = 0.0;
                for p in 0..pix {
                    q += stamp.w[ivec][p] * stamp.w[n_comp1 + jbg + 1][p];
                }
                matrix[i + 1][n_comp + jbg + 2] += q;
            }
        }
    }

    for i in 0..mat_size {
        for j in 0..=i {
            matrix[j + 1][i + 1] = matrix[i + 1][j + 1];
        }
    }

    (matrix, weights)
}

/// Builds the right-hand side of the normal equations from the per-stamp
/// `b` vectors and explicit background dot products against `image`.
fn create_sc_prod(
    stamps: &[Stamp],
    image: &Image,
    weights: &[Vec<f64>],
    cfg: &Config,
) -> Vec<f64> {
    let n_comp1 = cfg.n_psf() - 1;
    let n_comp2 = tri_num(cfg.kernel_order + 1);
    let n_bg = cfg.n_bg_comp();
    let h = cfg.h_substamp_width as i64;
    let fss = cfg.f_substamp_width();
    let width = image.width() as i64;

    let mut res = vec![0.0; cfg.n_solution()];
    for (st, stamp) in stamps.iter().enumerate() {
        if stamp.substamps.is_empty() {
            continue;
        }
        let (ssx, ssy) = stamp.substamps[0].image_coords;
        let (ssx, ssy) = (ssx as i64, ssy as i64);

        res[1] += stamp.b[1];

        for i in 1..=n_comp1 {
            let p0 = stamp.b[i + 1];
            for j in 0..n_comp2 {
                let indx = (i - 1) * n_comp2 + j + 1;
                res[indx + 1] += p0 * weights[st][j];
            }
        }

        for bg in 0..n_bg {
            let mut q = 0.0;
            for x in -h..=h {
                for y in -h..=h {
                    let win = (x + h) as usize + fss * (y + h) as usize;
                    let img_index = (x + ssx) + (y + ssy) * width;
                    q += stamp.w[n_comp1 + bg + 1][win] * image[img_index as usize];
                }
            }
            res[n_comp1 * n_comp2 + bg + 2] += q;
        }
    }
    res
}

/// Evaluates the fitted model on the stamp's substamp window: each design
/// vector scaled by its spatial coefficient at the substamp position.
fn make_model(
    stamp: &Stamp,
    solution: &[f64],
    img_size: (usize, usize),
    cfg: &Config,
) -> Vec<f64> {
    let fss = cfg.f_substamp_width();
    let (ssx, ssy) = stamp.substamps[0].image_coords;
    let half_x = 0.5 * img_size.0 as f64;
    let half_y = 0.5 * img_size.1 as f64;
    let xf = (ssx as f64 - half_x) / half_x;
    let yf = (ssy as f64 - half_y) / half_y;

    let mut model = vec![0.0; fss * fss];
    for (m, w) in model.iter_mut().zip(stamp.w[0].iter()) {
        *m = solution[1] * w;
    }

    let mut k = 2;
    for i in 1..cfg.n_psf() {
        let mut coeff = 0.0;
        let mut ax = 1.0;
        for ix in 0..=cfg.kernel_order {
            let mut ay = 1.0;
            for _ in 0..=(cfg.kernel_order - ix) {
                coeff += solution[k] * ax * ay;
                k += 1;
                ay *= yf;
            }
            ax *= xf;
        }
        for (m, w) in model.iter_mut().zip(stamp.w[i].iter()) {
            *m += coeff * w;
        }
    }
    model
}

/// Mean squared residual of the fitted model against the target image over
/// the stamp's substamp window, flux-normalized. Returns -1 when nothing
/// usable remains (or the residual exploded); NaNs are masked in passing.
pub fn calc_sig(
    stamp: &Stamp,
    solution: &[f64],
    conv_image: &Image,
    target_image: &Image,
    mask: &mut ImageMask,
    cfg: &Config,
) -> f64 {
    if stamp.substamps.is_empty() {
        return -1.0;
    }
    let (ssx, ssy) = stamp.substamps[0].image_coords;
    let background = background_at(solution, cfg, conv_image.size(), ssx, ssy);
    let model = make_model(stamp, solution, conv_image.size(), cfg);

    let h = cfg.h_substamp_width as i64;
    let fss = cfg.f_substamp_width();
    let width = conv_image.width() as i64;
    let mut count = 0usize;
    let mut signal = 0.0;

    for y in 0..fss {
        let abs_y = y as i64 - h + ssy as i64;
        for x in 0..fss {
            let abs_x = x as i64 - h + ssx as i64;
            let abs_index = (abs_x + abs_y * width) as usize;
            let model_value = model[x + y * fss];
            let target = target_image[abs_index];

            if mask.is_masked(abs_index, MaskFlags::BAD_INPUT) || target.abs() <= NEAR_ZERO {
                continue;
            }
            if model_value.is_nan() || target.is_nan() {
                mask.mask_pix(abs_x as usize, abs_y as usize, MaskFlags::NAN_PIXEL);
                continue;
            }

            let diff = model_value - target + background;
            count += 1;
            signal += diff * diff / (conv_image[abs_index].abs() + target.abs());
        }
    }

    if count == 0 {
        return -1.0;
    }
    signal /= count as f64;
    if signal >= 1e10 { -1.0 } else { signal }
}

/// One rejection round: recompute every stamp's residual, drop the best
/// substamp of stamps whose residual is unusable or a sigma-clipped
/// outlier, and refill their designs. Returns whether anything changed
/// (the caller then re-solves).
fn check_fit_solution(
    kernel: &Kernel,
    stamps: &mut [Stamp],
    conv_image: &Image,
    target_image: &Image,
    mask: &mut ImageMask,
    cfg: &Config,
) -> bool {
    let mut ss_values = Vec::new();
    let mut check = false;

    for stamp in stamps.iter_mut() {
        if stamp.substamps.is_empty() {
            continue;
        }
        let sig = calc_sig(stamp, &kernel.solution, conv_image, target_image, mask, cfg);
        if sig == -1.0 {
            stamp.substamps.remove(0);
            fill_stamp(stamp, conv_image, target_image, kernel, cfg);
            check = true;
        } else {
            stamp.stats.chi2 = sig;
            ss_values.push(sig);
        }
    }

    let (mean, std_dev) = sigma_clip(&ss_values, 10, cfg);
    debug!(
        mean,
        std_dev,
        cutoff = mean + cfg.sig_kern_fit * std_dev,
        "rejecting stamps above residual cutoff"
    );

    for stamp in stamps.iter_mut() {
        if stamp.substamps.is_empty() {
            continue;
        }
        if stamp.stats.chi2 - mean > cfg.sig_kern_fit * std_dev {
            stamp.substamps.remove(0);
            fill_stamp(stamp, conv_image, target_image, kernel, cfg);
            check = true;
        }
    }

    let remaining = stamps.iter().filter(|s| s.has_substamps()).count();
    debug!(remaining, "sub-stamps in use");
    check
}

/// Solves the global least-squares system for the kernel, iterating
/// outlier rejection until the stamp set is stable. The result lands in
/// `kernel.solution`.
pub fn fit_kernel(
    kernel: &mut Kernel,
    stamps: &mut [Stamp],
    conv_image: &Image,
    target_image: &Image,
    mask: &mut ImageMask,
    cfg: &Config,
) -> Result<()> {
    let n_comp2 = tri_num(cfg.kernel_order + 1);
    let mat_size = (cfg.n_psf() - 1) * n_comp2 + cfg.n_bg_comp() + 1;
    let mut index = vec![0usize; mat_size + 1];

    let solve = |stamps: &[Stamp], index: &mut Vec<usize>| -> Result<Vec<f64>> {
        let (mut matrix, weights) = create_matrix(stamps, conv_image.size(), cfg);
        let mut solution = create_sc_prod(stamps, target_image, &weights, cfg);
        ludcmp(&mut matrix, mat_size, index)?;
        lubksb(&matrix, mat_size, index, &mut solution);
        Ok(solution)
    };

    kernel.solution = solve(stamps, &mut index)?;
    while check_fit_solution(kernel, stamps, conv_image, target_image, mask, cfg) {
        debug!("re-expanding matrix");
        kernel.solution = solve(stamps, &mut index)?;
    }
    Ok(())
}

/// Fits one direction on a throwaway copy of the stamps and returns its
/// merit: the sigma-clipped mean per-substamp residual over the surviving
/// stamps, divided by the reference kernel sum. Smaller is better;
/// [`UNUSABLE_MERIT`] marks a direction that could not be fit.
pub fn test_fit(
    stamps: &mut [Stamp],
    conv_image: &Image,
    target_image: &Image,
    mask: &mut ImageMask,
    cfg: &Config,
) -> f64 {
    let n_psf = cfg.n_psf();
    let n_comp2 = tri_num(cfg.kernel_order + 1);
    let mat_size = (n_psf - 1) * n_comp2 + cfg.n_bg_comp() + 1;

    // Per-stamp normalization: solve the small stamp-local system and keep
    // its DC component.
    let mut kernel_sums = Vec::new();
    let mut index = vec![0usize; (n_psf + 2).max(mat_size + 1)];
    for stamp in stamps.iter_mut() {
        if stamp.substamps.is_empty() {
            continue;
        }
        let mut test_vec = vec![0.0; n_psf + 2];
        let mut test_mat = vec![vec![0.0; n_psf + 2]; n_psf + 2];
        for i in 1..=(n_psf + 1) {
            test_vec[i] = stamp.b[i];
            for j in 1..=i {
                test_mat[i][j] = stamp.q[i][j];
                test_mat[j][i] = stamp.q[i][j];
            }
        }
        match ludcmp(&mut test_mat, n_psf + 1, &mut index) {
            Ok(_) => {
                lubksb(&test_mat, n_psf + 1, &index, &mut test_vec);
                stamp.stats.norm = test_vec[1];
                kernel_sums.push(test_vec[1]);
            }
            Err(_) => {
                debug!(coords = ?stamp.coords, "degenerate stamp system");
            }
        }
    }

    let (norm_mean, norm_std_dev) = sigma_clip(&kernel_sums, 10, cfg);
    for stamp in stamps.iter_mut() {
        stamp.stats.diff = ((stamp.stats.norm - norm_mean) / norm_std_dev).abs();
    }

    // Global fit over the stamps whose normalization is consistent.
    let test_stamps: Vec<Stamp> = stamps
        .iter()
        .filter(|s| s.stats.diff < cfg.sig_kern_fit && s.has_substamps())
        .cloned()
        .collect();
    if test_stamps.is_empty() {
        return UNUSABLE_MERIT;
    }
    debug!(survivors = test_stamps.len(), "direction test fit");

    let (mut matrix, weights) = create_matrix(&test_stamps, conv_image.size(), cfg);
    let mut solution = create_sc_prod(&test_stamps, target_image, &weights, cfg);
    if ludcmp(&mut matrix, mat_size, &mut index).is_err() {
        return UNUSABLE_MERIT;
    }
    lubksb(&matrix, mat_size, &index, &mut solution);

    let Ok(mut test_kernel) = Kernel::new(cfg) else {
        return UNUSABLE_MERIT;
    };
    test_kernel.solution = solution;
    let Ok((_, kernel_sum)) = test_kernel.make_kernel(cfg, conv_image.size(), 0, 0) else {
        return UNUSABLE_MERIT;
    };

    let mut merit = Vec::new();
    for stamp in &test_stamps {
        let sig = calc_sig(stamp, &test_kernel.solution, conv_image, target_image, mask, cfg);
        if sig != -1.0 && sig <= 1e10 {
            merit.push(sig);
        }
    }
    if merit.is_empty() {
        return UNUSABLE_MERIT;
    }
    let (merit_mean, _) = sigma_clip(&merit, 10, cfg);
    merit_mean / kernel_sum
}

#[cfg(test)]
mod test {
    use super::{calc_sig, fit_kernel, test_fit};
    use crate::config::Config;
    use crate::error::Result;
    use crate::fit::fill_stamps;
    use crate::image::Image;
    use crate::kernel::{Kernel, background_at};
    use crate::mask::ImageMask;
    use crate::stamp::{Stamp, SubStamp};
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;
    use test_log::test;

    fn small_config() -> Config {
        let mut cfg = Config::default();
        cfg.h_kernel_width = 2;
        cfg.h_substamp_width = 3;
        cfg.dg = vec![2, 1];
        cfg.bg = vec![0.5, 0.1];
        cfg.kernel_order = 1;
        cfg.background_order = 1;
        cfg
    }

    /// Template with Gaussian stars on a small sky pedestal.
    fn star_template(w: usize, h: usize, stars: &[(usize, usize)]) -> Image {
        let mut data = vec![10.0f64; w * h];
        for (i, v) in data.iter_mut().enumerate() {
            let (x, y) = ((i % w) as f64, (i / w) as f64);
            for &(sx, sy) in stars {
                let dx = x - sx as f64;
                let dy = y - sy as f64;
                *v += 1000.0 * (-(dx * dx + dy * dy) / (2.0 * 1.2 * 1.2)).exp();
            }
        }
        Image::from_data("t", w, h, data).unwrap()
    }

    /// Science image: the template convolved with `scale` times the
    /// normalized Gaussian basis component 0, so the optimal kernel is
    /// exactly representable.
    fn convolved_science(
        template: &Image,
        kernel: &Kernel,
        cfg: &Config,
        scale: f64,
        noise: f64,
    ) -> Image {
        let (w, h) = template.size();
        let fkw = cfg.f_kernel_width() as i64;
        let k = cfg.h_kernel_width as i64;
        let mut rng = XorShiftRng::seed_from_u64(23);
        let mut data = vec![0.0f64; w * h];
        for y in 0..h as i64 {
            for x in 0..w as i64 {
                let mut acc = 0.0;
                for v in -k..=k {
                    for u in -k..=k {
                        let (xx, yy) = ((x + u).clamp(0, w as i64 - 1), (y + v).clamp(0, h as i64 - 1));
                        acc += template.get(xx as usize, yy as usize)
                            * kernel.kern_vec[0][((k - u) + (k - v) * fkw) as usize];
                    }
                }
                data[(x + y * w as i64) as usize] =
                    scale * acc + noise * (rng.random::<f64>() - 0.5);
            }
        }
        Image::from_data("s", w, h, data).unwrap()
    }

    /// Whole-image stamps around each star, one substamp each.
    fn stamps_for(stars: &[(usize, usize)], image: &Image, tile: usize) -> Vec<Stamp> {
        stars
            .iter()
            .map(|&(sx, sy)| {
                let coords = (sx - tile / 2, sy - tile / 2);
                let mut data = Vec::with_capacity(tile * tile);
                for y in 0..tile {
                    for x in 0..tile {
                        data.push(image.get(coords.0 + x, coords.1 + y));
                    }
                }
                Stamp {
                    coords,
                    size: (tile, tile),
                    data,
                    substamps: vec![SubStamp {
                        image_coords: (sx, sy),
                        stamp_coords: (tile / 2, tile / 2),
                        score: 1.0,
                    }],
                    ..Stamp::default()
                }
            })
            .collect()
    }

    fn star_grid() -> Vec<(usize, usize)> {
        let mut stars = Vec::new();
        for y in 0..3 {
            for x in 0..3 {
                stars.push((16 + 16 * x, 16 + 16 * y));
            }
        }
        stars
    }

    #[test]
    fn recovers_photometric_scale() -> Result<()> {
        let cfg = small_config();
        let kernel = Kernel::new(&cfg)?;
        let stars = star_grid();
        let template = star_template(64, 64, &stars);
        let science = convolved_science(&template, &kernel, &cfg, 2.5, 1e-3);
        let mut mask = ImageMask::new(64, 64)?;

        let mut stamps = stamps_for(&stars, &template, 12);
        fill_stamps(&mut stamps, &template, &science, &kernel, &cfg);

        let mut kernel = Kernel::new(&cfg)?;
        fit_kernel(&mut kernel, &mut stamps, &template, &science, &mut mask, &cfg)?;

        let survivors = stamps.iter().filter(|s| s.has_substamps()).count();
        assert!(survivors >= 4, "only {survivors} stamps survived");

        let (_, sum) = kernel.make_kernel(&cfg, (64, 64), 32, 32)?;
        assert!((sum - 2.5).abs() < 0.01, "kernel sum {sum}");
        // No differential background was injected.
        let bg = background_at(&kernel.solution, &cfg, (64, 64), 32, 32);
        assert!(bg.abs() < 1.0, "background {bg}");
        Ok(())
    }

    #[test]
    fn residuals_respect_rejection_threshold() -> Result<()> {
        let cfg = small_config();
        let basis = Kernel::new(&cfg)?;
        let stars = star_grid();
        let template = star_template(64, 64, &stars);
        let science = convolved_science(&template, &basis, &cfg, 1.4, 1e-2);
        let mut mask = ImageMask::new(64, 64)?;

        let mut stamps = stamps_for(&stars, &template, 12);
        fill_stamps(&mut stamps, &template, &science, &basis, &cfg);
        let mut kernel = Kernel::new(&cfg)?;
        fit_kernel(&mut kernel, &mut stamps, &template, &science, &mut mask, &cfg)?;

        // Every retained stamp sits below the clipped rejection cutoff.
        let sigs: Vec<f64> = stamps
            .iter()
            .filter(|s| s.has_substamps())
            .map(|s| calc_sig(s, &kernel.solution, &template, &science, &mut mask, &cfg))
            .collect();
        assert!(!sigs.is_empty());
        let (mean, std_dev) = crate::stats::sigma_clip(&sigs, 10, &cfg);
        for sig in &sigs {
            assert!(sig - mean <= cfg.sig_kern_fit * std_dev + 1e-12);
        }
        Ok(())
    }

    #[test]
    fn drops_discrepant_stamp() -> Result<()> {
        let cfg = small_config();
        let basis = Kernel::new(&cfg)?;
        let stars = star_grid();
        let template = star_template(64, 64, &stars);
        let mut science = convolved_science(&template, &basis, &cfg, 1.0, 1e-2);
        // A transient right on one substamp makes that stamp inconsistent
        // with every other.
        let (tx, ty) = stars[4];
        for dy in -2i64..=2 {
            for dx in -2i64..=2 {
                let (x, y) = ((tx as i64 + dx) as usize, (ty as i64 + dy) as usize);
                let v = science.get(x, y);
                science.set(x, y, v + 5000.0 * (-((dx * dx + dy * dy) as f64) / 2.0).exp());
            }
        }
        let mut mask = ImageMask::new(64, 64)?;

        let mut stamps = stamps_for(&stars, &template, 12);
        fill_stamps(&mut stamps, &template, &science, &basis, &cfg);
        let mut kernel = Kernel::new(&cfg)?;
        fit_kernel(&mut kernel, &mut stamps, &template, &science, &mut mask, &cfg)?;

        // The contaminated stamp had only one substamp, so rejection
        // empties it; the fit still completes on the rest.
        assert!(stamps[4].substamps.is_empty());
        assert!(stamps.iter().filter(|s| s.has_substamps()).count() >= 4);
        let (_, sum) = kernel.make_kernel(&cfg, (64, 64), 32, 32)?;
        assert!((sum - 1.0).abs() < 0.05, "kernel sum {sum}");
        Ok(())
    }

    #[test]
    fn prefers_matching_direction() -> Result<()> {
        let cfg = small_config();
        let basis = Kernel::new(&cfg)?;
        let stars = star_grid();
        // Science is a smoothed template: convolving the template forward
        // can match it, while deconvolving the science cannot.
        let template = star_template(64, 64, &stars);
        let science = convolved_science(&template, &basis, &cfg, 1.0, 1e-2);
        let mut mask = ImageMask::new(64, 64)?;

        let mut forward = stamps_for(&stars, &template, 12);
        fill_stamps(&mut forward, &template, &science, &basis, &cfg);
        let merit_forward = test_fit(&mut forward, &template, &science, &mut mask, &cfg);

        let mut backward = stamps_for(&stars, &science, 12);
        fill_stamps(&mut backward, &science, &template, &basis, &cfg);
        let merit_backward = test_fit(&mut backward, &science, &template, &mut mask, &cfg);

        assert!(merit_forward >= 0.0);
        assert!(
            merit_forward < merit_backward,
            "forward {merit_forward} vs backward {merit_backward}"
        );
        Ok(())
    }
}
