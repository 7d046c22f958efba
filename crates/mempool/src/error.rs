use core::fmt;

use snafu::{Location, Snafu};

use crate::{MAX_SHRINKERS, PAGE_SIZE};

/// Recoverable allocation failures.
///
/// Conditions the allocator cannot recover from (exhausted page source on the
/// small-object path, corrupted page headers, double frees of a range) are not
/// represented here; they abort through a panic.
#[derive(Debug, Snafu)]
#[snafu(module, visibility(pub(crate)))]
#[non_exhaustive]
pub enum AllocError {
    #[snafu(display("alignment {align} is not a power of two"))]
    InvalidAlignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("alignment {align} exceeds the page size ({PAGE_SIZE})"))]
    UnsupportedAlignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("size {size} is not a multiple of alignment {align}"))]
    MisalignedSize {
        size: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocation size overflows, count: {count}, size: {size}"))]
    SizeOverflow {
        count: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("huge page size {size} is not a power of two of at least a page"))]
    InvalidHugeSize {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address {addr:#x} is not page aligned"))]
    MisalignedAddress {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no free range can hold {size} bytes"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("shrinker registry is full (capacity {MAX_SHRINKERS})"))]
    RegistryFull {
        #[snafu(implicit)]
        location: Location,
    },
}

/// Reports an unrecoverable allocator failure and aborts.
#[track_caller]
#[cold]
pub(crate) fn report_fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("mempool: {args}");
    panic!("mempool: {args}");
}

macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::report_fatal(format_args!($($arg)*))
    };
}
pub(crate) use fatal;
