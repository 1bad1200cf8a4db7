// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! The fixed Gaussian-polynomial kernel basis and the evaluation of the
//! fitted, spatially varying kernel and background.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::util::tri_num;

/// Degrees of one basis component: Gaussian index and x/y polynomial powers.
#[derive(Clone, Copy, Debug)]
pub struct BasisTerm {
    pub gauss: usize,
    pub x: usize,
    pub y: usize,
}

/// The kernel basis plus, after the global fit, the solution vector.
///
/// `kern_vec[0]` is a unit-sum Gaussian; every later component with even
/// x and y degrees is orthogonalized against it by subtraction and sums
/// to zero. Components are separable: `kern_vec[n]` is the outer product
/// of `filter_x[n]` and `filter_y[n]` (minus the component-0 correction).
pub struct Kernel {
    pub kern_vec: Vec<Vec<f64>>,
    pub filter_x: Vec<Vec<f64>>,
    pub filter_y: Vec<Vec<f64>>,
    pub terms: Vec<BasisTerm>,
    /// Global-fit solution, 1-indexed with element 0 unused. Empty until
    /// [`crate::fit::fit_kernel`] runs.
    pub solution: Vec<f64>,
}

impl Kernel {
    pub fn new(cfg: &Config) -> Result<Kernel> {
        cfg.validate()?;
        let mut kernel = Kernel {
            kern_vec: Vec::with_capacity(cfg.n_psf()),
            filter_x: Vec::with_capacity(cfg.n_psf()),
            filter_y: Vec::with_capacity(cfg.n_psf()),
            terms: Vec::with_capacity(cfg.n_psf()),
            solution: Vec::new(),
        };
        for gauss in 0..cfg.dg.len() {
            for x in 0..=cfg.dg[gauss] {
                for y in 0..=(cfg.dg[gauss] - x) {
                    kernel.terms.push(BasisTerm { gauss, x, y });
                    kernel.push_component(cfg);
                }
            }
        }
        debug_assert_eq!(kernel.kern_vec.len(), cfg.n_psf());
        Ok(kernel)
    }

    /// Builds the basis component for the most recently pushed term.
    fn push_component(&mut self, cfg: &Config) {
        let n = self.terms.len() - 1;
        let term = self.terms[n];
        let fkw = cfg.f_kernel_width();
        let both_even = term.x % 2 == 0 && term.y % 2 == 0;

        let mut filter_x = Vec::with_capacity(fkw);
        let mut filter_y = Vec::with_capacity(fkw);
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        for i in 0..fkw {
            let u = i as f64 - cfg.h_kernel_width as f64;
            let qe = (-u * u * cfg.bg[term.gauss]).exp();
            filter_x.push(qe * u.powi(term.x as i32));
            filter_y.push(qe * u.powi(term.y as i32));
            sum_x += filter_x[i];
            sum_y += filter_y[i];
        }

        let mut component = vec![0.0; fkw * fkw];
        if both_even {
            for i in 0..fkw {
                filter_x[i] /= sum_x;
                filter_y[i] /= sum_y;
            }
            for u in 0..fkw {
                for v in 0..fkw {
                    component[u + v * fkw] = filter_x[u] * filter_y[v];
                    if n > 0 {
                        component[u + v * fkw] -= self.kern_vec[0][u + v * fkw];
                    }
                }
            }
        } else {
            for u in 0..fkw {
                for v in 0..fkw {
                    component[u + v * fkw] = filter_x[u] * filter_y[v];
                }
            }
        }

        self.filter_x.push(filter_x);
        self.filter_y.push(filter_y);
        self.kern_vec.push(component);
    }

    /// Evaluates the fitted kernel at image position `(x, y)`: the spatial
    /// polynomial gives one coefficient per basis component, and the
    /// combined kernel image is their weighted sum. Returns the kernel and
    /// its pixel sum (the local photometric scale).
    pub fn make_kernel(
        &self,
        cfg: &Config,
        img_size: (usize, usize),
        x: usize,
        y: usize,
    ) -> Result<(Vec<f64>, f64)> {
        if self.solution.len() != cfg.n_solution() {
            return Err(Error::Unsolved);
        }
        let n_psf = cfg.n_psf();
        let mut coeffs = vec![0.0; n_psf];
        let half_x = 0.5 * img_size.0 as f64;
        let half_y = 0.5 * img_size.1 as f64;
        let xf = (x as f64 - half_x) / half_x;
        let yf = (y as f64 - half_y) / half_y;

        let mut k = 2;
        for coeff in coeffs.iter_mut().skip(1) {
            let mut ax = 1.0;
            for ix in 0..=cfg.kernel_order {
                let mut ay = 1.0;
                for _ in 0..=(cfg.kernel_order - ix) {
                    *coeff += self.solution[k] * ax * ay;
                    k += 1;
                    ay *= yf;
                }
                ax *= xf;
            }
        }
        coeffs[0] = self.solution[1];

        let fkw = cfg.f_kernel_width();
        let mut out = vec![0.0; fkw * fkw];
        let mut sum = 0.0;
        for (i, pix) in out.iter_mut().enumerate() {
            for (coeff, component) in coeffs.iter().zip(self.kern_vec.iter()) {
                *pix += coeff * component[i];
            }
            sum += *pix;
        }
        Ok((out, sum))
    }
}

/// Evaluates the fitted differential background at `(x, y)` from the tail
/// of the solution vector.
pub fn background_at(
    solution: &[f64],
    cfg: &Config,
    img_size: (usize, usize),
    x: usize,
    y: usize,
) -> f64 {
    let bg_base = (cfg.n_psf() - 1) * tri_num(cfg.kernel_order + 1) + 1;
    let half_x = 0.5 * img_size.0 as f64;
    let half_y = 0.5 * img_size.1 as f64;
    let xf = (x as f64 - half_x) / half_x;
    let yf = (y as f64 - half_y) / half_y;

    let mut bg = 0.0;
    let mut k = 1;
    let mut ax = 1.0;
    for i in 0..=cfg.background_order {
        let mut ay = 1.0;
        for _ in 0..=(cfg.background_order - i) {
            bg += solution[bg_base + k] * ax * ay;
            k += 1;
            ay *= yf;
        }
        ax *= xf;
    }
    bg
}

#[cfg(test)]
mod test {
    use super::{Kernel, background_at};
    use crate::config::Config;
    use crate::error::Result;
    use crate::util::test::assert_almost_eq;

    #[test]
    fn component_count_and_sums() -> Result<()> {
        let cfg = Config::default();
        let kernel = Kernel::new(&cfg)?;
        assert_eq!(kernel.kern_vec.len(), cfg.n_psf());

        let sums: Vec<f64> = kernel
            .kern_vec
            .iter()
            .map(|k| k.iter().sum::<f64>())
            .collect();
        // Component 0 is a normalized Gaussian.
        assert_almost_eq(sums[0], 1.0, 1e-12);
        // Even-even components are orthogonalized against it; odd-degree
        // components integrate to zero by antisymmetry.
        for (n, sum) in sums.iter().enumerate().skip(1) {
            assert!(sum.abs() < 1e-8, "component {n} sums to {sum}");
        }
        Ok(())
    }

    #[test]
    fn separable_outer_product() -> Result<()> {
        let mut cfg = Config::default();
        cfg.h_kernel_width = 3;
        let kernel = Kernel::new(&cfg)?;
        let fkw = cfg.f_kernel_width();
        // An odd-degree component is the plain outer product.
        let n = kernel
            .terms
            .iter()
            .position(|t| t.x % 2 == 1)
            .expect("basis has odd components");
        for u in 0..fkw {
            for v in 0..fkw {
                assert_almost_eq(
                    kernel.kern_vec[n][u + v * fkw],
                    kernel.filter_x[n][u] * kernel.filter_y[n][v],
                    1e-15,
                );
            }
        }
        Ok(())
    }

    #[test]
    fn dc_coefficient_at_center() -> Result<()> {
        let mut cfg = Config::default();
        cfg.kernel_order = 0;
        let mut kernel = Kernel::new(&cfg)?;
        kernel.solution = vec![0.0; cfg.n_solution()];
        kernel.solution[1] = 2.5;

        let (_, sum) = kernel.make_kernel(&cfg, (100, 100), 50, 50)?;
        assert_almost_eq(sum, 2.5, 1e-10);
        Ok(())
    }

    #[test]
    fn unsolved_kernel_refuses_evaluation() -> Result<()> {
        let cfg = Config::default();
        let kernel = Kernel::new(&cfg)?;
        assert!(kernel.make_kernel(&cfg, (100, 100), 0, 0).is_err());
        Ok(())
    }

    #[test]
    fn background_polynomial() {
        let mut cfg = Config::default();
        cfg.background_order = 1;
        // Solution tail: constant 3, then the y and x linear terms.
        let bg_base = (cfg.n_psf() - 1) * cfg.n_kernel_spatial() + 1;
        let mut solution = vec![0.0; cfg.n_solution()];
        solution[bg_base + 1] = 3.0;
        solution[bg_base + 2] = 2.0; // y
        solution[bg_base + 3] = 5.0; // x

        let center = background_at(&solution, &cfg, (100, 100), 50, 50);
        assert_almost_eq(center, 3.0, 1e-12);
        let corner = background_at(&solution, &cfg, (100, 100), 100, 100);
        assert_almost_eq(corner, 3.0 + 2.0 + 5.0, 1e-12);
    }
}
