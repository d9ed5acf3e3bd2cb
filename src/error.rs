use thiserror::Error;

use crate::address::Address;

/// Conditions the heap reports to the embedding runtime.
///
/// Allocation overflow of a single belt is never surfaced: it is handled by the
/// slow path (TLAB refill or collection). Everything here is either a
/// configuration mistake caught before any mutator runs or a resource /
/// correctness failure that the runtime is expected to treat as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// Invalid belt count, percentages, sizes or worker count.
    #[error("invalid heap configuration: {0}")]
    Configuration(String),
    /// Two regions handed to the same manager overlap.
    #[error("region {first} overlaps region {second}")]
    RegionOverlap {
        first: &'static str,
        second: &'static str,
    },
    /// A collection finished but the belt still cannot satisfy the request.
    #[error("out of memory: requested {requested} bytes, {free} bytes free after collection")]
    OutOfMemory { requested: usize, free: usize },
    /// The live set did not fit into the copy reserve. The heap is halted.
    #[error("to-space exhausted while copying: {live_bytes} bytes copied into a {capacity} byte belt")]
    ToSpaceExhausted { live_bytes: usize, capacity: usize },
    /// The heap verifier found a broken reference.
    #[error("heap verification failed at {address} (offset {offset}): {message}")]
    Verification {
        address: Address,
        offset: usize,
        message: String,
    },
    /// A previous fatal condition stopped the heap permanently.
    #[error("heap is halted after a fatal collector failure")]
    Halted,
}

pub type HeapResult<T> = Result<T, HeapError>;

/// Reports `err` together with the heap diagnostics and a backtrace, then aborts.
#[cold]
#[inline(never)]
pub fn fatal(diagnostics: &str, err: &HeapError) -> ! {
    log::error!("fatal heap error: {}", err);
    eprintln!("fatal heap error: {}", err);
    eprintln!("{}", diagnostics);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort();
}
