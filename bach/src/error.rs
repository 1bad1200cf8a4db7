// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::collections::TryReserveError;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Image size too large: {0}x{1}")]
    ImageSizeTooLarge(usize, usize),
    #[error("Invalid image size: {0}x{1}")]
    InvalidImageSize(usize, usize),
    #[error("Image dimensions differ: {0}x{1} vs {2}x{3}")]
    DimensionMismatch(usize, usize, usize, usize),
    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] TryReserveError),
    #[error("Kernel half-width must be positive, got {0}")]
    InvalidKernelWidth(usize),
    #[error("Substamp half-width must be positive, got {0}")]
    InvalidSubstampWidth(usize),
    #[error("Need one Gaussian width per polynomial degree: {0} degrees, {1} widths")]
    MismatchedBasis(usize, usize),
    #[error("Kernel basis is empty")]
    EmptyBasis,
    #[error("Stamp grid {0}x{1} is empty")]
    EmptyGrid(usize, usize),
    #[error("Stamp of {0} pixels is smaller than the {1}-pixel statistics sample")]
    StampTooSmall(usize, usize),
    #[error("No substamps found in either image")]
    NoSubstamps,
    #[error("Singular matrix in least-squares solve")]
    SingularMatrix,
    #[error("Kernel has no solution yet")]
    Unsolved,
}

pub type Result<T> = std::result::Result<T, Error>;
