// Copyright (c) the BACH Project Authors. All rights reserved.
//
// Use of this source code is governed by a BSD-style
// license that can be found in the LICENSE file.

use std::path::PathBuf;
use std::time::Instant;

use bach::config::Config;
use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::EnvFilter;

mod fits;

/// PSF-matched astronomical image differencing.
#[derive(Parser)]
#[command(name = "bach", version)]
struct Opt {
    /// Template image (FITS)
    #[clap(short = 't', long)]
    template: PathBuf,

    /// Science image (FITS)
    #[clap(short = 's', long)]
    science: PathBuf,

    /// Output image name stem
    #[clap(short = 'o', long, default_value = "diff")]
    out_name: String,

    /// Output directory
    #[clap(long, default_value = "res")]
    out_path: PathBuf,

    /// Directory prepended to relative input paths
    #[clap(long)]
    input_path: Option<PathBuf>,

    /// Verbose progress logging
    #[clap(short = 'v', long, action)]
    verbose: bool,

    /// Report per-stage wall-clock times
    #[clap(long, action)]
    timings: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    };

    let default_level = if opt.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let resolve = |path: &PathBuf| match &opt.input_path {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.clone(),
    };

    let start = Instant::now();
    let template = fits::read_image(&resolve(&opt.template))?;
    let science = fits::read_image(&resolve(&opt.science))?;
    let loaded = Instant::now();

    let cfg = Config::default();
    let result = bach::pipeline::run(&template, &science, &cfg)?;
    let fitted = Instant::now();

    std::fs::create_dir_all(&opt.out_path)?;
    let conv_path = opt.out_path.join(format!("{}_conv.fits", opt.out_name));
    let diff_path = opt.out_path.join(format!("{}_diff.fits", opt.out_name));
    fits::write_image(&conv_path, &result.convolved)?;
    fits::write_image(&diff_path, &result.difference)?;
    let written = Instant::now();

    println!(
        "convolved ({:?}): {}",
        result.direction,
        conv_path.display()
    );
    println!("difference: {}", diff_path.display());
    if opt.timings {
        println!("load:          {:>10.1?}", loaded - start);
        println!("fit + conv:    {:>10.1?}", fitted - loaded);
        println!("write:         {:>10.1?}", written - fitted);
    }
    Ok(())
}
