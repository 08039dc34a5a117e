//! The allocation seam between the runtime channel and the real memory backend.
//!
//! The channel only needs host-visible storage buffers it can map, zero and read back; how
//! those are created (VMA pool, dedicated allocations, ...) belongs to the surrounding
//! layer. [`HostAllocator`] is the backend used by the tests: plain zeroed host memory with
//! fabricated buffer handles, which is exactly what the channel logic observes through the
//! trait in production too.

use crate::OomError;
use ash::vk::{self, Handle};
use foldhash::HashMap;
use parking_lot::Mutex;

/// One GPU-visible buffer owned by the runtime channel.
///
/// Freed through the allocator that created it; dropping the block without destroying it
/// leaks the backing memory, which matches the explicit `Destroy` discipline of the channel.
#[derive(Debug)]
pub struct DeviceMemoryBlock {
    buffer: vk::Buffer,
    allocation: u64,
    size: vk::DeviceSize,
}

impl DeviceMemoryBlock {
    pub const NULL: DeviceMemoryBlock = DeviceMemoryBlock {
        buffer: vk::Buffer::null(),
        allocation: 0,
        size: 0,
    };

    #[inline]
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.buffer == vk::Buffer::null()
    }
}

/// Memory properties requested for a channel buffer.
///
/// Error output and counters are small and read back often; the address-range snapshot can
/// be large, so it is requested cached and flushed manually after rewrites.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    HostVisibleCoherent,
    HostVisibleCached,
}

/// Creates and maps the channel's buffers.
///
/// Mapped contents are always presented as `u32` words, the unit of the host/device shared
/// layouts. Implementations must zero-initialize new buffers.
pub trait MemoryAllocator: Send + Sync + std::fmt::Debug {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        location: MemoryLocation,
    ) -> Result<DeviceMemoryBlock, OomError>;

    /// Maps the block and runs `f` over its contents; unmaps afterwards.
    fn map(
        &self,
        block: &DeviceMemoryBlock,
        f: &mut dyn FnMut(&mut [u32]),
    ) -> Result<(), OomError>;

    /// Makes host writes visible to the device for non-coherent blocks.
    fn flush(&self, block: &DeviceMemoryBlock);

    /// Frees the block and resets it to null. Destroying a null block is a no-op.
    fn destroy_buffer(&self, block: &mut DeviceMemoryBlock);
}

/// Host-memory backend.
#[derive(Debug)]
pub struct HostAllocator {
    inner: Mutex<HostInner>,
}

#[derive(Debug)]
struct HostInner {
    next_allocation: u64,
    slabs: HashMap<u64, Box<[u32]>>,
    /// When set, the next `create_buffer` fails; lets tests exercise the exhaustion path.
    fail_next: bool,
}

impl HostAllocator {
    pub fn new() -> Self {
        HostAllocator {
            inner: Mutex::new(HostInner {
                next_allocation: 1,
                slabs: HashMap::default(),
                fail_next: false,
            }),
        }
    }

    /// Makes the next allocation report device-memory exhaustion.
    pub fn fail_next_allocation(&self) {
        self.inner.lock().fail_next = true;
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.inner.lock().slabs.len()
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAllocator for HostAllocator {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _location: MemoryLocation,
    ) -> Result<DeviceMemoryBlock, OomError> {
        let mut inner = self.inner.lock();
        if std::mem::take(&mut inner.fail_next) {
            return Err(OomError::OutOfDeviceMemory);
        }
        let words = (size as usize).div_ceil(4);
        let allocation = inner.next_allocation;
        inner.next_allocation += 1;
        inner.slabs.insert(allocation, vec![0u32; words].into());
        Ok(DeviceMemoryBlock {
            buffer: vk::Buffer::from_raw(allocation),
            allocation,
            size,
        })
    }

    fn map(
        &self,
        block: &DeviceMemoryBlock,
        f: &mut dyn FnMut(&mut [u32]),
    ) -> Result<(), OomError> {
        let mut inner = self.inner.lock();
        let slab = inner
            .slabs
            .get_mut(&block.allocation)
            .ok_or(OomError::OutOfHostMemory)?;
        f(slab);
        Ok(())
    }

    fn flush(&self, _block: &DeviceMemoryBlock) {}

    fn destroy_buffer(&self, block: &mut DeviceMemoryBlock) {
        if block.is_null() {
            return;
        }
        self.inner.lock().slabs.remove(&block.allocation);
        *block = DeviceMemoryBlock::NULL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_zero_initialized_and_word_addressable() {
        let allocator = HostAllocator::new();
        let block = allocator
            .create_buffer(64, MemoryLocation::HostVisibleCoherent)
            .unwrap();
        assert!(!block.is_null());
        allocator
            .map(&block, &mut |words| {
                assert_eq!(words.len(), 16);
                assert!(words.iter().all(|&w| w == 0));
                words[3] = 0xabcd;
            })
            .unwrap();
        allocator
            .map(&block, &mut |words| assert_eq!(words[3], 0xabcd))
            .unwrap();
    }

    #[test]
    fn destroy_is_idempotent_and_nulls_the_block() {
        let allocator = HostAllocator::new();
        let mut block = allocator
            .create_buffer(16, MemoryLocation::HostVisibleCached)
            .unwrap();
        allocator.destroy_buffer(&mut block);
        assert!(block.is_null());
        allocator.destroy_buffer(&mut block);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn exhaustion_is_reported_once() {
        let allocator = HostAllocator::new();
        allocator.fail_next_allocation();
        assert_eq!(
            allocator
                .create_buffer(16, MemoryLocation::HostVisibleCoherent)
                .unwrap_err(),
            OomError::OutOfDeviceMemory
        );
        assert!(allocator
            .create_buffer(16, MemoryLocation::HostVisibleCoherent)
            .is_ok());
    }
}
