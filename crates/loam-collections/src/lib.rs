//! Low-level memory and lookup structures for the loam ECS.
//!
//! Everything in this crate sits below the storage engine and avoids the
//! general-purpose allocator in hot paths.
//!
//! # Key Concepts
//!
//! - **[`OsApi`]**: the injected allocation primitives. Nothing else in the
//!   workspace talks to the system allocator directly.
//! - **[`BlockAllocator`]**: fixed-size chunk allocator. Chunks are carved
//!   out of ~4 KiB blocks and recycled through a free-list.
//! - **[`Allocator`]**: a set of block allocators keyed by size class, with a
//!   direct OS fallback for large or over-aligned requests.
//! - **[`StackAllocator`]**: paged bump allocator with cursors that may be
//!   released out of order.
//! - **[`Map`]** and **[`HashMap`]**: a 64-bit keyed map, and a map for
//!   arbitrary keys built from buckets stored in a [`Map`].

#![allow(unsafe_code)]
#![allow(clippy::missing_safety_doc)]

mod allocator;
mod block;
mod error;
mod hashmap;
mod map;
mod os;
mod stack;

pub use allocator::Allocator;
pub use block::{BLOCK_SIZE, BlockAllocator, CHUNK_ALIGN, MIN_CHUNKS_PER_BLOCK};
pub use error::{CollectionsError, CollectionsResult};
pub use hashmap::{CompareFn, HashFn, HashMap, hash_of};
pub use map::Map;
pub use os::OsApi;
pub use stack::{PAGE_SIZE, StackAllocator, StackCursor, StackSlice};
