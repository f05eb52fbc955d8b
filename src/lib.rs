//! # pagefold
//!
//! A cross-process page-deduplicating heap allocator for tightly-coupled
//! compute jobs running many sibling processes on one shared-memory node.
//!
//! When N siblings each carry large working sets with substantial content
//! overlap (zero pages, read-mostly tables, identical post-init state)
//! per-process allocation wastes N× the physical memory. pagefold serves
//! page-and-larger allocations from a fixed 3 GiB *shared heap window*
//! backed by one POSIX shared-memory object, maps them read-only, and
//! folds identical page contents into a single physical backing:
//!
//! - the **write-fault handler** (SIGSEGV) gives a page private backing
//!   on first touch and splits merged pages back out on write,
//!   copy-on-write made explicit;
//! - the **merge engine** periodically scans dirty allocations and remaps
//!   identical pages onto the shared backing or the zero template, in
//!   bulk runs to spare the kernel's mapping table;
//! - a **named semaphore** and per-page sharing bitmap keep the shared
//!   metadata consistent across siblings.
//!
//! The allocator is multi-process but **single-threaded within each
//! process**; all siblings must share one kernel. Linux-only: the
//! splitting path requires `mremap(MREMAP_FIXED)` and init refuses to
//! start without it.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! pagefold::init()?;
//!
//! let p = pagefold::malloc(4 << 20);     // 4 MiB, read-only until written
//! unsafe { *p = 1 };                     // first write faults, page goes private
//! pagefold::free(p);
//!
//! pagefold::finalize();
//! ```
//!
//! Tuning comes from the environment (`MERGE_METRIC`, `MIN_MEM_TH`,
//! `MALLOC_MERGE_FREQ`, ...); see [`config`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod alloc;
pub mod backing;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod layout;
pub mod registry;
pub mod sem;
pub mod stats;

mod fault;
mod merge;
mod policy;
mod runtime;

pub use alloc::{free, malloc, realloc, set_block_allocator, usable_size, BlockAllocator};
pub use error::{Error, Result};
pub use runtime::{finalize, init};
