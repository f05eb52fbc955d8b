//! Error types for pagefold.

use thiserror::Error;

/// Result type alias using pagefold's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pagefold operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An environment knob failed validation before init completed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The OS denied a mapping, or the mapping landed outside the heap window.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// The per-process VMA count is too close to `vm.max_map_count`.
    #[error("mapping ceiling reached: {count} of {ceiling} maps in use")]
    MapCeiling {
        /// Current mapping estimate for this process.
        count: i64,
        /// Kernel ceiling read from `/proc/sys/vm/max_map_count`.
        ceiling: i64,
    },

    /// The kernel cannot atomically replace a mapping in place.
    ///
    /// Copy-on-write splitting requires `mremap(MREMAP_FIXED)`; without it a
    /// fault races against an unmapped window at the fault address.
    #[error("atomic remap (MREMAP_FIXED) unsupported on this kernel")]
    AtomicRemapUnsupported,

    /// The shared backing exists but its header does not match this build.
    #[error("shared backing mismatch: {0}")]
    BackingMismatch(String),

    /// More sibling processes joined than the sharing bitmap was sized for.
    #[error("process rank {rank} exceeds node width {width}")]
    NodeWidthExceeded {
        /// Rank this process was assigned at join.
        rank: u32,
        /// Bits per sharing-bitmap slot.
        width: u32,
    },

    /// The named semaphore could not be opened.
    #[error("semaphore error: {0}")]
    Semaphore(String),

    /// Internal metadata disagreed with itself.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
