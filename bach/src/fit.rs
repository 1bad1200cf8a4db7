// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! Kernel fitting: per-stamp design assembly and the global least-squares
//! solve with iterative outlier rejection.

mod design;
mod solve;

pub use design::{fill_stamp, fill_stamps};
pub use solve::{calc_sig, fit_kernel, test_fit};
