// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! LU decomposition with row-scaled partial pivoting, after the classic
//! Numerical Recipes routines. Everything here is 1-indexed: callers pass
//! `(n+1) x (n+1)` matrices and `n+1` vectors with element 0 unused.

use crate::error::{Error, Result};

/// Decomposes `matrix` in place into its LU form, row-permuted for
/// stability. `index` records the row interchanges for [`lubksb`].
/// Returns the parity of the permutation (+1 or -1).
///
/// An exactly zero pivot is replaced by `1e-20`; a row with no nonzero
/// entry at all makes the system unsolvable.
pub fn ludcmp(matrix: &mut [Vec<f64>], n: usize, index: &mut [usize]) -> Result<f64> {
    let mut vv = vec![0.0f64; n + 1];
    let mut parity = 1.0;

    // Implicit scaling of each row.
    for i in 1..=n {
        let mut big = 0.0f64;
        for j in 1..=n {
            big = big.max(matrix[i][j].abs());
        }
        if big == 0.0 {
            return Err(Error::SingularMatrix);
        }
        vv[i] = 1.0 / big;
    }

    let mut max_i = 0;
    for j in 1..=n {
        for i in 1..j {
            let mut sum = matrix[i][j];
            for k in 1..i {
                sum -= matrix[i][k] * matrix[k][j];
            }
            matrix[i][j] = sum;
        }
        let mut big = 0.0f64;
        for i in j..=n {
            let mut sum = matrix[i][j];
            for k in 1..j {
                sum -= matrix[i][k] * matrix[k][j];
            }
            matrix[i][j] = sum;
            let dum = vv[i] * sum.abs();
            if dum >= big {
                big = dum;
                max_i = i;
            }
        }
        if j != max_i {
            matrix.swap(j, max_i);
            parity = -parity;
            vv[max_i] = vv[j];
        }
        index[j] = max_i;
        if matrix[j][j] == 0.0 {
            matrix[j][j] = 1.0e-20;
        }
        if j != n {
            let dum = 1.0 / matrix[j][j];
            for i in (j + 1)..=n {
                matrix[i][j] *= dum;
            }
        }
    }

    Ok(parity)
}

/// Back-substitution against a matrix decomposed by [`ludcmp`].
/// `result` holds the right-hand side on entry and the solution on exit.
pub fn lubksb(matrix: &[Vec<f64>], n: usize, index: &[usize], result: &mut [f64]) {
    let mut ii = 0usize;

    for i in 1..=n {
        let ip = index[i];
        let mut sum = result[ip];
        result[ip] = result[i];
        if ii != 0 {
            for j in ii..i {
                sum -= matrix[i][j] * result[j];
            }
        } else if sum != 0.0 {
            ii = i;
        }
        result[i] = sum;
    }

    for i in (1..=n).rev() {
        let mut sum = result[i];
        for j in (i + 1)..=n {
            sum -= matrix[i][j] * result[j];
        }
        result[i] = sum / matrix[i][i];
    }
}
