#![cfg_attr(feature = "no_std", no_std)]

//! Page-granular physical memory allocator.
//!
//! `pagepool` manages a single contiguous memory region, carves it into
//! 4 KiB pages and serves single pages, multi-page contiguous extents
//! ("page links") and the bookkeeping needed by allocators layered on
//! top (a per-page ownership table). The free space is tracked by a
//! dual-ordered skiplist indexed both by start page and by extent size,
//! so frees coalesce and allocations can pick best fit or worst fit.
//! Hot paths are lock-free (a striped stack of cached single pages) or
//! fine-grained locked (per-node try-lock groups in the skiplist); the
//! allocator never calls into a host heap.

pub mod addr;
pub mod error;

mod page_table;
mod pool;
mod quickpool;
mod skiplist;

pub use addr::PhysAddr;
pub use error::{Error, Result};
pub use page_table::PageKind;
pub use pool::PagePool;

/// Base unit of allocation. Everything handed out is a multiple of this.
pub const PAGE_SIZE: usize = 4096;
