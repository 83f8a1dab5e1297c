//! Fixed-size chunk allocator.
//!
//! Chunks are carved out of blocks of roughly [`BLOCK_SIZE`] bytes. Freed
//! chunks go onto an intrusive free-list (the first word of a free chunk
//! links to the next one) and are only returned to the OS when the whole
//! allocator is dropped.

use std::{alloc::Layout, ptr::NonNull};

use tracing::{trace, warn};

use crate::{
    error::{CollectionsError, CollectionsResult},
    os::OsApi,
};

/// Target size of one block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Lower bound on chunks per block, regardless of chunk size.
pub const MIN_CHUNKS_PER_BLOCK: usize = 4;

/// Chunk sizes are rounded up to this alignment.
pub const CHUNK_ALIGN: usize = 16;

type Link = Option<NonNull<u8>>;

/// Allocator for chunks of one fixed size.
pub struct BlockAllocator {
    /// Requested size, before rounding.
    data_size: usize,
    /// Rounded size of one chunk.
    chunk_size: usize,
    chunks_per_block: usize,
    /// Head of the free-list.
    head: Link,
    /// Every block ever allocated, freed on drop.
    blocks: Vec<NonNull<u8>>,
    /// Chunks currently handed out.
    outstanding: usize,
    os: OsApi,
}

// SAFETY: the allocator exclusively owns its blocks; chunk pointers handed
// out carry no thread affinity.
unsafe impl Send for BlockAllocator {}

impl BlockAllocator {
    /// Create an allocator for chunks of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the resulting block layout overflows.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_os(size, OsApi::system())
    }

    /// Create an allocator that requests blocks through `os`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the resulting block layout overflows.
    #[must_use]
    pub fn with_os(size: usize, os: OsApi) -> Self {
        match Self::try_with_os(size, os) {
            Ok(allocator) => allocator,
            Err(err) => panic!("invalid block allocator size {size}: {err}"),
        }
    }

    /// Fallible constructor.
    pub fn try_with_os(size: usize, os: OsApi) -> CollectionsResult<Self> {
        if size == 0 {
            return Err(CollectionsError::ZeroChunkSize);
        }

        let chunk_size = size
            .checked_next_multiple_of(CHUNK_ALIGN)
            .ok_or(CollectionsError::SizeOverflow(size))?;
        let chunks_per_block = (BLOCK_SIZE / chunk_size).max(MIN_CHUNKS_PER_BLOCK);

        // Validate the block layout up front so `grow` can't fail later.
        let block_bytes = chunk_size
            .checked_mul(chunks_per_block)
            .ok_or(CollectionsError::SizeOverflow(size))?;
        Layout::from_size_align(block_bytes, CHUNK_ALIGN)?;

        Ok(Self {
            data_size: size,
            chunk_size,
            chunks_per_block,
            head: None,
            blocks: Vec::new(),
            outstanding: 0,
            os,
        })
    }

    /// Size requested at construction.
    #[must_use]
    pub const fn data_size(&self) -> usize {
        self.data_size
    }

    /// Size of one chunk after rounding.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub const fn chunks_per_block(&self) -> usize {
        self.chunks_per_block
    }

    /// Number of blocks requested from the OS so far.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of chunks currently allocated and not yet freed.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Allocate one chunk. Contents are unspecified.
    #[must_use]
    pub fn alloc(&mut self) -> NonNull<u8> {
        let chunk = match self.head {
            Some(chunk) => chunk,
            None => self.grow(),
        };

        // SAFETY: every chunk on the free-list starts with a link
        self.head = unsafe { chunk.cast::<Link>().read() };
        self.outstanding += 1;
        chunk
    }

    /// Allocate one zero-filled chunk.
    #[must_use]
    pub fn calloc(&mut self) -> NonNull<u8> {
        let chunk = self.alloc();
        // SAFETY: the chunk holds at least `data_size` writable bytes
        unsafe { chunk.as_ptr().write_bytes(0, self.data_size) };
        chunk
    }

    /// Return a chunk to the free-list.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) or
    /// [`calloc`](Self::calloc) on this allocator and must not be used after
    /// this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.owns(ptr), "chunk freed to the wrong block allocator");
        assert!(self.outstanding > 0, "block allocator double free");

        // SAFETY: chunks are at least 16 bytes and 16-aligned, so a link fits
        unsafe { ptr.cast::<Link>().write(self.head) };
        self.head = Some(ptr);
        self.outstanding -= 1;
    }

    /// Move a chunk from `src` into a freshly allocated chunk of `dst`.
    ///
    /// Copies `min(dst, src)` bytes and frees the original. A `None` input
    /// is a plain allocation from `dst`.
    ///
    /// # Safety
    ///
    /// `ptr`, when present, must be a live chunk of `src`.
    #[must_use]
    pub unsafe fn realloc(dst: &mut Self, src: &mut Self, ptr: Option<NonNull<u8>>) -> NonNull<u8> {
        let new = dst.alloc();
        if let Some(old) = ptr {
            let bytes = dst.data_size.min(src.data_size);
            // SAFETY: both chunks hold at least `bytes` bytes and are distinct
            unsafe {
                std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), bytes);
                src.free(old);
            }
        }
        new
    }

    fn block_layout(&self) -> Layout {
        // Checked in `try_with_os`.
        Layout::from_size_align(self.chunk_size * self.chunks_per_block, CHUNK_ALIGN)
            .unwrap_or_else(|_| unreachable!("block layout validated at construction"))
    }

    /// Allocate a new block and thread its chunks onto the free-list.
    fn grow(&mut self) -> NonNull<u8> {
        let block = self.os.malloc(self.block_layout());

        for i in 0..self.chunks_per_block {
            // SAFETY: all offsets lie within the block
            unsafe {
                let chunk = block.add(i * self.chunk_size);
                let next = if i + 1 < self.chunks_per_block {
                    Some(block.add((i + 1) * self.chunk_size))
                } else {
                    self.head
                };
                chunk.cast::<Link>().write(next);
            }
        }

        self.blocks.push(block);
        trace!(
            chunk_size = self.chunk_size,
            blocks = self.blocks.len(),
            "block allocator grew"
        );
        block
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let span = self.chunk_size * self.chunks_per_block;
        self.blocks.iter().any(|block| {
            let start = block.as_ptr() as usize;
            addr >= start && addr < start + span && (addr - start) % self.chunk_size == 0
        })
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        if self.outstanding != 0 {
            warn!(
                chunk_size = self.chunk_size,
                outstanding = self.outstanding,
                "block allocator dropped with live chunks"
            );
        }

        let layout = self.block_layout();
        for block in self.blocks.drain(..) {
            // SAFETY: every block was allocated by `os` with this layout
            unsafe { self.os.free(block, layout) };
        }
    }
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("data_size", &self.data_size)
            .field("chunk_size", &self.chunk_size)
            .field("chunks_per_block", &self.chunks_per_block)
            .field("blocks", &self.blocks.len())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}
