//! # Block Allocators
//!
//! Receive buffers come out of a block allocator with a fixed block size.
//! The default implementation takes blocks from the process heap; embedded
//! deployments substitute a static slab behind the same trait. Receive
//! never stalls waiting for a block: allocation failure maps to a busy
//! response on the wire.

use std::fmt::Debug;

use crate::proto::DEFAULT_BUFFER_SIZE;

/// A provider of fixed-size receive buffers.
pub trait BlockAllocator: Debug {
    /// The size of the blocks this allocator hands out, in bytes.
    fn block_size(&self) -> usize;

    /// Provide an empty block, or `None` when none is available right
    /// now. Must not block.
    fn alloc(&self) -> Option<Vec<u8>>;

    /// Take a block back. Heap-backed allocators simply drop it.
    fn free(&self, block: Vec<u8>) {
        drop(block);
    }
}

/// The default allocator: plain heap allocation with a fixed block size.
#[derive(Debug, Clone, Copy)]
pub struct HeapAllocator {
    block_size: usize,
}

impl HeapAllocator {
    /// An allocator handing out blocks of `block_size` bytes.
    #[must_use]
    pub const fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl BlockAllocator for HeapAllocator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn alloc(&self) -> Option<Vec<u8>> {
        Some(Vec::with_capacity(self.block_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocator_defaults_to_the_protocol_buffer_size() {
        let alloc = HeapAllocator::default();
        assert_eq!(alloc.block_size(), DEFAULT_BUFFER_SIZE);
        assert!(alloc.alloc().is_some());
    }

    #[test]
    fn blocks_come_back_empty() {
        let alloc = HeapAllocator::new(32);
        let block = alloc.alloc().unwrap();
        assert!(block.is_empty());
        assert!(block.capacity() >= 32);
        alloc.free(block);
    }
}
