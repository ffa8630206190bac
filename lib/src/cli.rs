//! # Image assembler CLI
//!
//! Command-line surface and the driver that builds, trims and runs the
//! step pipeline.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::context::{ConfigLocation, RunContext, RunOptions};
use crate::output;
use crate::steps::{Step, StepMachine};

fn parse_size_arg(s: &str) -> Result<u64, String> {
    imager_utils::parse_size(s).map_err(|e| format!("{e:#}"))
}

/// Create an offspot disk image from a config file.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "imager")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub struct Opt {
    /// Offspot config YAML file path or URL
    pub config_src: String,

    /// Where to write the image to
    pub output: String,

    /// Directory to store temporary files in, like files that need to be
    /// extracted. Defaults to a newly-created temporary directory.
    #[clap(long)]
    pub build_dir: Option<Utf8PathBuf>,

    /// Enable the content cache, rooted at this directory.
    #[clap(long)]
    pub cache_dir: Option<Utf8PathBuf>,

    /// Print cache status and exit (combinable with --check).
    #[clap(long)]
    pub show_cache: bool,

    /// Only check inputs, URLs and sizes. Don't download/create an image.
    #[clap(short = 'C', long = "check")]
    pub check: bool,

    /// Don't remove the output image if creation failed.
    #[clap(short = 'K', long = "keep")]
    pub keep: bool,

    /// Don't fail on an existing output image: remove it instead.
    #[clap(short = 'X', long = "overwrite")]
    pub overwrite: bool,

    /// Maximum size of the image to produce (accepts human units).
    #[clap(long, value_parser = parse_size_arg)]
    pub max_size: Option<u64>,

    /// Enable verbose logging.
    #[clap(short = 'D', long)]
    pub debug: bool,
}

fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let absolute = std::path::absolute(path.as_std_path())
        .with_context(|| format!("Resolving {path}"))?;
    Utf8PathBuf::from_path_buf(absolute).map_err(|p| anyhow::anyhow!("non-UTF8 path {p:?}"))
}

fn options_from(opt: &Opt) -> Result<RunOptions> {
    let output_path = absolute(Utf8Path::new(&opt.output))?;

    let (build_dir, build_dir_guard) = match &opt.build_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
            (absolute(dir)?, None)
        }
        None => {
            let guard = tempfile::Builder::new()
                .prefix("imager_build-dir")
                .tempdir()
                .context("Creating build directory")?;
            let dir = Utf8PathBuf::from_path_buf(guard.path().to_path_buf())
                .map_err(|p| anyhow::anyhow!("non-UTF8 temp dir {p:?}"))?;
            (dir, Some(guard))
        }
    };

    let cache_dir = opt.cache_dir.as_deref().map(absolute).transpose()?;

    Ok(RunOptions {
        config_src: ConfigLocation::parse(&opt.config_src),
        output_path,
        build_dir,
        _build_dir_guard: build_dir_guard,
        cache_dir,
        check_only: opt.check,
        keep_failed: opt.keep,
        overwrite: opt.overwrite,
        max_size: opt.max_size,
    })
}

/// Trim the full pipeline according to the requested mode.
fn build_machine(opt: &Opt) -> StepMachine {
    let mut machine = StepMachine::new();
    if opt.cache_dir.is_none() {
        machine.remove_step(Step::ApplyCachePolicy);
    }
    if opt.show_cache {
        if opt.check {
            machine.halt_after(Step::ComputeSizes);
        } else {
            machine.halt_after(Step::PrintingCache);
        }
    } else {
        machine.remove_step(Step::PrintingCache);
        if opt.check {
            machine.halt_after(Step::ComputeSizes);
        }
    }
    machine
}

/// Parse arguments, run the pipeline and return the process exit code.
/// Cleanup runs on every path, success or not.
pub fn run_from_iter<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    imager_utils::initialize_tracing(opt.debug);
    output::banner(env!("CARGO_PKG_VERSION"));

    let options = match options_from(&opt) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e:#}");
            return 1;
        }
    };

    let mut machine = build_machine(&opt);
    let mut ctx = RunContext::new(options);
    let code = match machine.run(&mut ctx) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    machine.halt(&mut ctx);
    code
}
