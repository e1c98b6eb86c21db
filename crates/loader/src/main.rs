//! Runs a pool allocator strategy end to end and reports every allocation.
//!
//! The strategy is chosen once at startup from an optional identifier. An
//! absent or unusable identifier falls back to the OS-backed strategy with a
//! diagnostic on stderr; it is never fatal.

use std::{
    io::{self, Write as _},
    process,
};

use allocator::strategy::Strategy as _;
use argh::FromArgs;
use snafu::ResultExt as _;

use self::{
    exercise::{
        DEFAULT_POOL_SIZE, DEFAULT_SIZES, ExerciseConfig, ExerciseError, WriteReportSnafu,
    },
    log::LogLevel,
    registry::Registry,
    report::Report,
};

#[macro_use]
mod log;

mod exercise;
mod registry;
mod report;

/// Exercise a pool allocator strategy over an OS-mapped memory pool.
#[derive(Debug, FromArgs)]
struct Args {
    /// allocator to use, by name or library path (default: OS-backed fallback)
    #[argh(positional)]
    strategy: Option<String>,

    /// size of the memory pool in bytes
    #[argh(option, default = "DEFAULT_POOL_SIZE")]
    pool_size: usize,

    /// request size in bytes, repeatable (default: 12 13 24 40 56 100 120 400)
    #[argh(option, short = 's')]
    size: Vec<usize>,

    /// most verbose diagnostic level written to stderr
    #[argh(option, default = "LogLevel::Warn")]
    log_level: LogLevel,

    /// print the registered allocator names and exit
    #[argh(switch)]
    list: bool,
}

impl Args {
    fn config(&self) -> ExerciseConfig {
        let sizes = if self.size.is_empty() {
            DEFAULT_SIZES.to_vec()
        } else {
            self.size.clone()
        };
        ExerciseConfig {
            pool_size: self.pool_size,
            sizes,
        }
    }
}

fn main() {
    let args: Args = argh::from_env();
    log::init(args.log_level);

    if let Err(err) = run(&args) {
        let report = Report::new(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), ExerciseError> {
    let registry = Registry::with_builtins();

    if args.list {
        let mut stdout = io::stdout().lock();
        for name in registry.names() {
            writeln!(stdout, "{name}").context(WriteReportSnafu)?;
        }
        return Ok(());
    }

    let binding = registry::bind(&registry, args.strategy.as_deref());
    info!(
        "bound allocator {} ({})",
        binding.strategy.name(),
        binding.source
    );

    let summary = exercise::run(binding.strategy, &args.config(), &mut io::stdout().lock())?;
    debug!(
        "{} of {} requests succeeded",
        summary.succeeded(),
        summary.addresses.len()
    );
    Ok(())
}
