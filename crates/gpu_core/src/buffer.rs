//! Buffer construction, mapping and host-side access
//!
//! A [`Buffer`] is a device-memory region sized as `stride * element_count`,
//! where the stride is the element size rounded up to a minimum offset
//! alignment. The struct also carries its desired usage and memory-property
//! flags so it is self-describing for (re)allocation.
//!
//! Writing requires the buffer to be mapped; flush/invalidate make writes
//! visible device-side / host-side on non-coherent memory. Contract
//! violations (writing to an unmapped buffer, out-of-range offsets) are
//! checked with debug assertions only.

use std::ptr;

use ash::vk;
use vk_mem::Alloc;

use crate::commands::SingleTimeCommands;
use crate::device::{Device, DeviceRuntimeData};
use crate::error::{VulkanError, VulkanResult};

/// Allocations above this size get dedicated device memory
const DEDICATED_ALLOCATION_THRESHOLD: vk::DeviceSize = 512 * 1024 * 1024;

/// Round `size` up to the next multiple of `alignment`.
///
/// Alignments of 0 and 1 are the identity; other alignments must be powers
/// of two.
pub fn align_to(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment > 0 {
        (size + alignment - 1) & !(alignment - 1)
    } else {
        size
    }
}

/// A device-memory region with aligned per-element stride.
///
/// Set `element_count` and the allocation descriptor fields (usage, memory
/// usage, property flags, priority), compute sizes with
/// [`construct`](Self::construct), then [`allocate`](Self::allocate).
pub struct Buffer {
    /// Number of elements the buffer holds (its capacity)
    pub element_count: u32,
    /// Per-element byte distance, aligned to the construction alignment
    pub stride: vk::DeviceSize,
    /// Total byte size (`stride * element_count`)
    pub size: vk::DeviceSize,
    /// Native buffer handle
    pub handle: vk::Buffer,
    /// Backing allocation, present between `allocate` and `destroy`
    pub allocation: Option<vk_mem::Allocation>,
    /// Host-mapped base pointer; non-null only while mapped
    pub mapped: *mut u8,
    /// Buffer usage flags used at allocation time
    pub usage: vk::BufferUsageFlags,
    /// Allocator usage hint
    pub memory_usage: vk_mem::MemoryUsage,
    /// Memory property flags the allocation must have
    pub required_flags: vk::MemoryPropertyFlags,
    /// Memory property flags the allocation should have
    pub preferred_flags: vk::MemoryPropertyFlags,
    /// Allocation priority (0.0 to 1.0) for priority-based eviction
    pub priority: f32,
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            element_count: 0,
            stride: 0,
            size: 0,
            handle: vk::Buffer::null(),
            allocation: None,
            mapped: ptr::null_mut(),
            usage: vk::BufferUsageFlags::empty(),
            memory_usage: vk_mem::MemoryUsage::Unknown,
            required_flags: vk::MemoryPropertyFlags::empty(),
            preferred_flags: vk::MemoryPropertyFlags::empty(),
            priority: 0.5,
        }
    }
}

impl Buffer {
    /// Compute stride and total size from an element size and a minimum
    /// offset alignment
    pub fn construct(&mut self, instance_size: vk::DeviceSize, min_offset_alignment: vk::DeviceSize) {
        self.stride = align_to(instance_size, min_offset_alignment);
        self.size = self.stride * vk::DeviceSize::from(self.element_count);
    }

    /// Compute stride and total size aligned to the device's minimum
    /// uniform-buffer offset alignment
    pub fn construct_ubo(&mut self, instance_size: vk::DeviceSize, rd: &DeviceRuntimeData) {
        self.stride = rd.aligned_ubo_size(instance_size);
        self.size = self.stride * vk::DeviceSize::from(self.element_count);
    }

    /// Create the native buffer and its backing allocation.
    ///
    /// The size must have been computed first (see [`construct`](Self::construct)).
    pub fn allocate(&mut self, device: &Device) -> VulkanResult<()> {
        debug_assert!(self.size > 0, "buffer size must be computed before allocation");

        let mut alloc_info = vk_mem::AllocationCreateInfo {
            usage: self.memory_usage,
            required_flags: self.required_flags,
            preferred_flags: self.preferred_flags,
            priority: self.priority,
            ..Default::default()
        };
        if self.size > DEDICATED_ALLOCATION_THRESHOLD {
            alloc_info.flags = vk_mem::AllocationCreateFlags::DEDICATED_MEMORY;
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(self.size)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (handle, allocation) = unsafe {
            device.allocator().create_buffer(&buffer_info, &alloc_info)
        }
        .map_err(VulkanError::Api)?;

        self.handle = handle;
        self.allocation = Some(allocation);
        log::debug!("Allocated buffer of {} bytes, usage {:?}", self.size, self.usage);
        Ok(())
    }

    /// Map the allocation for host access; a no-op when already mapped
    pub fn map(&mut self, device: &Device) -> VulkanResult<()> {
        if !self.mapped.is_null() {
            return Ok(());
        }
        let allocation = self.allocation.as_mut().ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: "cannot map an unallocated buffer".to_string(),
            }
        })?;
        self.mapped =
            unsafe { device.allocator().map_memory(allocation) }.map_err(VulkanError::Api)?;
        Ok(())
    }

    /// Unmap the allocation; a no-op when not mapped
    pub fn unmap(&mut self, device: &Device) {
        if self.mapped.is_null() {
            return;
        }
        if let Some(allocation) = self.allocation.as_mut() {
            unsafe { device.allocator().unmap_memory(allocation) };
        }
        self.mapped = ptr::null_mut();
    }

    /// Unmap, free the native buffer and its allocation, and reset to the
    /// empty state
    pub fn destroy(&mut self, device: &Device) {
        self.unmap(device);
        if let Some(mut allocation) = self.allocation.take() {
            log::debug!("Destroying buffer {:?} ({} bytes)", self.handle, self.size);
            unsafe { device.allocator().destroy_buffer(self.handle, &mut allocation) };
        }
        *self = Self::default();
    }

    /// Whether the buffer is currently host-mapped
    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }

    /// The host-mapped base pointer; null when unmapped
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped
    }

    /// The mapped region as a byte slice, when mapped
    pub fn mapped_bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.mapped.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(self.mapped, self.size as usize) })
    }

    /// Copy bytes into the mapped region starting at offset 0
    pub fn write(&mut self, data: &[u8]) {
        self.write_at(data, 0);
    }

    /// Copy bytes into the mapped region at a byte offset
    pub fn write_at(&mut self, data: &[u8], offset: vk::DeviceSize) {
        debug_assert!(!self.mapped.is_null(), "buffer must be mapped before writing");
        debug_assert!(
            offset + data.len() as vk::DeviceSize <= self.size,
            "write of {} bytes at offset {} overflows buffer of {} bytes",
            data.len(),
            offset,
            self.size
        );
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.mapped.add(offset as usize), data.len());
        }
    }

    /// Copy `data` into the element slot at `index * stride`
    pub fn write_index(&mut self, data: &[u8], index: usize) {
        self.write_at(data, index as vk::DeviceSize * self.stride);
    }

    /// Move bytes into the mapped region at a byte offset.
    ///
    /// Uses `memmove` semantics, so `src` may point into the mapped region
    /// itself.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `len` bytes.
    pub unsafe fn move_bytes(&mut self, src: *const u8, len: usize, offset: vk::DeviceSize) {
        debug_assert!(!self.mapped.is_null(), "buffer must be mapped before writing");
        debug_assert!(offset as usize + len <= self.size as usize);
        ptr::copy(src, self.mapped.add(offset as usize), len);
    }

    /// Make a range of host writes visible to the device.
    ///
    /// Only required for non-coherent memory; pass `vk::WHOLE_SIZE` to flush
    /// the complete range.
    pub fn flush(
        &self,
        device: &Device,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let allocation = self.allocation.as_ref().ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: "cannot flush an unallocated buffer".to_string(),
            }
        })?;
        device
            .allocator()
            .flush_allocation(allocation, offset as _, size as _)
            .map_err(VulkanError::Api)
    }

    /// Flush the single stride-sized region at `index * stride`
    pub fn flush_index(&self, device: &Device, index: usize) -> VulkanResult<()> {
        self.flush(device, self.stride, index as vk::DeviceSize * self.stride)
    }

    /// Make a range of device writes visible to the host.
    ///
    /// Only required for non-coherent memory; pass `vk::WHOLE_SIZE` to
    /// invalidate the complete range.
    pub fn invalidate(
        &self,
        device: &Device,
        size: vk::DeviceSize,
        offset: vk::DeviceSize,
    ) -> VulkanResult<()> {
        let allocation = self.allocation.as_ref().ok_or_else(|| {
            VulkanError::InvalidOperation {
                reason: "cannot invalidate an unallocated buffer".to_string(),
            }
        })?;
        device
            .allocator()
            .invalidate_allocation(allocation, offset as _, size as _)
            .map_err(VulkanError::Api)
    }

    /// Invalidate the single stride-sized region at `index * stride`
    pub fn invalidate_index(&self, device: &Device, index: usize) -> VulkanResult<()> {
        self.invalidate(device, self.stride, index as vk::DeviceSize * self.stride)
    }
}

/// Copy `size` bytes between buffers in one synchronous single-time execution
pub fn copy_buffer_once(
    device: &Device,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> VulkanResult<()> {
    let mut exec = SingleTimeCommands::new(device)?;
    exec.copy_buffer(src, dst, size);
    exec.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_rounds_up_to_multiple() {
        // Smallest multiple of the alignment that is >= size
        assert_eq!(align_to(0, 64), 0);
        assert_eq!(align_to(1, 64), 64);
        assert_eq!(align_to(64, 64), 64);
        assert_eq!(align_to(65, 64), 128);
        assert_eq!(align_to(100, 16), 112);
        assert_eq!(align_to(256, 256), 256);
    }

    #[test]
    fn align_to_identity_for_zero_and_one() {
        for size in [0u64, 1, 7, 100, 4096] {
            assert_eq!(align_to(size, 0), size);
            assert_eq!(align_to(size, 1), size);
        }
    }

    #[test]
    fn align_to_power_of_two_sweep() {
        for alignment in [2u64, 4, 8, 16, 32, 64, 128, 256] {
            for size in 0..512u64 {
                let aligned = align_to(size, alignment);
                assert!(aligned >= size);
                assert_eq!(aligned % alignment, 0);
                // Smallest such multiple
                assert!(aligned < size + alignment);
            }
        }
    }

    #[test]
    fn construct_derives_size_from_stride() {
        let mut buffer = Buffer {
            element_count: 3,
            ..Buffer::default()
        };
        buffer.construct(4, 256);
        assert_eq!(buffer.stride, 256);
        assert_eq!(buffer.size, 768);

        buffer.construct(4, 1);
        assert_eq!(buffer.stride, 4);
        assert_eq!(buffer.size, 12);
    }
}
