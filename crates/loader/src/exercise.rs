//! The end-to-end allocator run.
//!
//! One pool is mapped from the OS, the bound strategy creates an allocator
//! over it, and a fixed sequence of requests is issued. Every outcome is
//! reported on the output stream:
//!
//! ```text
//! block №1 address: 00007f3a5c2e6078
//! ERROR: Memory allocation failed (size=400)
//! INFO: Memory allocation - FAILURE (7/8)
//! INFO: Memory freed
//! INFO: Allocator destroyed
//! ```

use core::ptr::NonNull;
use std::io::{self, Write};

use allocator::{
    os::{MapError, PageMapping},
    region::Region,
    strategy::{CreateError, Strategy},
};
use snafu::{Location, ResultExt as _, Snafu};

/// Size of the pool mapped for a run.
pub const DEFAULT_POOL_SIZE: usize = 4096;

/// The request sizes issued by a run, in order.
pub const DEFAULT_SIZES: [usize; 8] = [12, 13, 24, 40, 56, 100, 120, 400];

const ADDRESS_WIDTH: usize = size_of::<usize>() * 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExerciseConfig {
    pub pool_size: usize,
    pub sizes: Vec<usize>,
}

impl Default for ExerciseConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            sizes: DEFAULT_SIZES.to_vec(),
        }
    }
}

/// The outcome of a run: one entry per request, the address handed out or
/// `None` if the request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub addresses: Vec<Option<usize>>,
}

impl Summary {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.addresses.iter().flatten().count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.addresses.len() - self.succeeded()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExerciseError {
    #[snafu(display("failed to acquire a {len}-byte memory pool"))]
    AcquirePool {
        len: usize,
        source: MapError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to create allocator {strategy:?}"))]
    CreateAllocator {
        strategy: &'static str,
        source: CreateError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to write the allocation report"))]
    WriteReport {
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ExerciseError {
    #[must_use]
    pub fn location(&self) -> &Location {
        match self {
            Self::AcquirePool { location, .. }
            | Self::CreateAllocator { location, .. }
            | Self::WriteReport { location, .. } => location,
        }
    }
}

/// Maps a pool of `config.pool_size` bytes and exercises `strategy` over it.
///
/// The pool is unmapped when the run ends, whatever the outcome.
pub fn run<W>(
    strategy: &dyn Strategy,
    config: &ExerciseConfig,
    out: &mut W,
) -> Result<Summary, ExerciseError>
where
    W: Write,
{
    let len = config.pool_size;
    let mut pool = PageMapping::new(len).context(AcquirePoolSnafu { len })?;
    info!("mapped a {len}-byte pool at {:#x}", pool.base().addr().get());
    exercise(strategy, pool.region(), &config.sizes, out)
}

/// Creates an allocator over `region`, requests each of `sizes`, then
/// releases everything and destroys the allocator.
///
/// A failed request is reported and skipped. Only a failed `create` or a
/// failed write ends the run early.
pub fn exercise<W>(
    strategy: &dyn Strategy,
    region: Region<'_>,
    sizes: &[usize],
    out: &mut W,
) -> Result<Summary, ExerciseError>
where
    W: Write,
{
    let mut allocator = strategy.create(region).context(CreateAllocatorSnafu {
        strategy: strategy.name(),
    })?;
    debug!("created allocator {}", strategy.name());

    let mut live: Vec<NonNull<u8>> = Vec::with_capacity(sizes.len());
    let mut addresses = Vec::with_capacity(sizes.len());
    let mut written = Ok(());
    for (index, &size) in sizes.iter().enumerate() {
        let block = allocator.allocate(size);
        addresses.push(block.map(|ptr| ptr.addr().get()));
        live.extend(block);
        written = written.and_then(|()| match block {
            Some(ptr) => {
                writeln!(
                    out,
                    "block №{} address: {:0width$x}",
                    index + 1,
                    ptr.addr().get(),
                    width = ADDRESS_WIDTH
                )
            }
            None => writeln!(out, "ERROR: Memory allocation failed (size={size})"),
        });
    }

    let summary = Summary { addresses };
    written = written.and_then(|()| {
        if summary.is_success() {
            writeln!(out, "INFO: Memory allocation - SUCCESS")
        } else {
            writeln!(
                out,
                "INFO: Memory allocation - FAILURE ({}/{})",
                summary.succeeded(),
                summary.addresses.len()
            )
        }
    });

    for ptr in live {
        // SAFETY: every pointer in `live` came from this allocator and is
        // released exactly once.
        unsafe { allocator.release(ptr) };
    }
    written = written.and_then(|()| writeln!(out, "INFO: Memory freed"));

    allocator.destroy();
    written = written.and_then(|()| writeln!(out, "INFO: Allocator destroyed"));

    written.context(WriteReportSnafu)?;
    Ok(summary)
}
