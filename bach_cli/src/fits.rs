// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

//! FITS input and output for the pipeline: 2D primary HDUs read into the
//! dense f64 image model, and written back out the same way.

use std::path::Path;

use bach::image::Image;
use color_eyre::eyre::{Result, WrapErr, bail, eyre};
use fitrs::{Fits, FitsData, Hdu};

pub fn read_image(path: &Path) -> Result<Image> {
    let fits =
        Fits::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?;
    let hdu = fits
        .get(0)
        .ok_or_else(|| eyre!("no primary HDU in {}", path.display()))?;

    let (shape, data) = match hdu.read_data() {
        FitsData::FloatingPoint64(array) => (array.shape.clone(), array.data.clone()),
        FitsData::FloatingPoint32(array) => (
            array.shape.clone(),
            array.data.iter().map(|&v| v as f64).collect(),
        ),
        FitsData::IntegersI32(array) => (
            array.shape.clone(),
            array
                .data
                .iter()
                .map(|v| v.map_or(f64::NAN, |v| v as f64))
                .collect(),
        ),
        FitsData::IntegersU32(array) => (
            array.shape.clone(),
            array
                .data
                .iter()
                .map(|v| v.map_or(f64::NAN, |v| v as f64))
                .collect(),
        ),
        FitsData::Characters(_) => bail!("{}: unsupported pixel type", path.display()),
    };

    if shape.len() != 2 {
        bail!(
            "{}: expected a 2D image, got {} axes",
            path.display(),
            shape.len()
        );
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    Ok(Image::from_data(name, shape[0], shape[1], data)?)
}

pub fn write_image(path: &Path, image: &Image) -> Result<()> {
    let (width, height) = image.size();
    let hdu = Hdu::new(&[width, height], image.data().to_vec());
    Fits::create(path, hdu).wrap_err_with(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
