//! The upload decision protocol
//!
//! One upload call behaves correctly whether the destination lives in
//! unified memory (integrated GPU) or in device-local memory on a discrete
//! GPU, without the caller branching: the actual memory-property flags of
//! the destination allocation are queried, and the data is either written
//! straight into the mapped region or shuttled through a temporary staging
//! buffer and a GPU copy.
//!
//! The staging buffer, when one is created, is destroyed on every exit path
//! so a failed submission never leaks device memory.

use std::ptr;
use std::slice;

use ash::vk;

use crate::buffer::Buffer;
use crate::commands::SingleTimeCommands;
use crate::device::Device;
use crate::error::{VulkanError, VulkanResult};

/// Staging allocations rank low for priority-based eviction so they do not
/// compete with device-local allocations
const STAGING_PRIORITY: f32 = 0.1;

/// Where the uploaded bytes come from
pub enum UploadSource<'a> {
    /// A host slice of at least the request's size
    Bytes(&'a [u8]),
    /// A callback that fills the write target (the mapped destination on
    /// the direct path, the staging buffer otherwise); returning `false`
    /// fails the upload
    Fill(Box<dyn FnOnce(&mut [u8]) -> bool + 'a>),
}

/// Callback recording the staging-to-destination transfer
pub type StagingCopyFn<'a> = Box<dyn FnOnce(&mut SingleTimeCommands, &Buffer) + 'a>;

/// Callback for follow-up work once the data is resident; the flag is
/// `true` when a staging buffer was used
pub type PostUploadFn<'a> = Box<dyn FnOnce(&mut SingleTimeCommands, bool) + 'a>;

/// Describes a single transfer into a device allocation
pub struct UploadRequest<'a> {
    /// The destination allocation
    pub allocation: &'a mut vk_mem::Allocation,
    /// Number of bytes to upload
    pub size: vk::DeviceSize,
    /// Source bytes or fill callback
    pub source: UploadSource<'a>,
    /// Records the copy out of the staging buffer when one is in use
    /// (e.g. a buffer-to-buffer or buffer-to-image transfer)
    pub on_copy_staging: Option<StagingCopyFn<'a>>,
    /// Invoked after the data is resident, in the same command buffer,
    /// for work such as layout transitions
    pub on_upload: Option<PostUploadFn<'a>>,
}

impl<'a> UploadRequest<'a> {
    /// Upload request sourced from a byte slice
    pub fn from_bytes(allocation: &'a mut vk_mem::Allocation, data: &'a [u8]) -> Self {
        Self {
            allocation,
            size: data.len() as vk::DeviceSize,
            source: UploadSource::Bytes(data),
            on_copy_staging: None,
            on_upload: None,
        }
    }

    /// Attach a staging-copy callback
    #[must_use]
    pub fn with_staging_copy(mut self, callback: StagingCopyFn<'a>) -> Self {
        self.on_copy_staging = Some(callback);
        self
    }

    /// Attach a post-upload callback
    #[must_use]
    pub fn with_post_upload(mut self, callback: PostUploadFn<'a>) -> Self {
        self.on_upload = Some(callback);
        self
    }

    /// A request is valid when it has a non-zero size and its source can
    /// produce that many bytes
    pub fn is_valid(&self) -> bool {
        if self.size == 0 {
            return false;
        }
        match &self.source {
            UploadSource::Bytes(data) => data.len() as vk::DeviceSize >= self.size,
            UploadSource::Fill(_) => true,
        }
    }
}

/// Produce an [`UploadRequest::on_copy_staging`] callback that records a
/// whole-range staging-to-buffer copy
pub fn copy_buffer_callback<'a>(dst: vk::Buffer, size: vk::DeviceSize) -> StagingCopyFn<'a> {
    Box::new(move |exec: &mut SingleTimeCommands, staging: &Buffer| {
        exec.copy_buffer(staging.handle, dst, size);
    })
}

/// The memory-property flags actually bound to an allocation
pub fn allocation_memory_flags(
    device: &Device,
    allocation: &vk_mem::Allocation,
) -> vk::MemoryPropertyFlags {
    let info = device.allocator().get_allocation_info(allocation);
    device
        .runtime_data()
        .memory_properties()
        .memory_types[info.memory_type as usize]
        .property_flags
}

#[derive(Clone, Copy)]
enum TransferKind {
    Copy,
    Move,
}

/// Copy data into a GPU allocation, directly when it is host-visible and
/// through a staging buffer otherwise
pub fn copy_to_gpu(device: &Device, request: UploadRequest<'_>) -> VulkanResult<()> {
    upload(device, request, TransferKind::Copy)
}

/// Move data into a GPU allocation (`memmove` semantics: the source may
/// overlap the destination's mapped region), directly when it is
/// host-visible and through a staging buffer otherwise
pub fn move_to_gpu(device: &Device, request: UploadRequest<'_>) -> VulkanResult<()> {
    upload(device, request, TransferKind::Move)
}

fn upload(device: &Device, request: UploadRequest<'_>, kind: TransferKind) -> VulkanResult<()> {
    if !request.is_valid() {
        return Err(VulkanError::InvalidOperation {
            reason: "upload request must have a non-zero size and a usable source".to_string(),
        });
    }
    let mem_flags = allocation_memory_flags(device, request.allocation);
    if mem_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        upload_host_visible(device, request, mem_flags, kind)
    } else {
        upload_staging(device, request, kind)
    }
}

fn write_into(
    target: *mut u8,
    size: usize,
    source: UploadSource<'_>,
    kind: TransferKind,
) -> VulkanResult<()> {
    match source {
        UploadSource::Bytes(data) => unsafe {
            match kind {
                TransferKind::Copy => ptr::copy_nonoverlapping(data.as_ptr(), target, size),
                TransferKind::Move => ptr::copy(data.as_ptr(), target, size),
            }
        },
        UploadSource::Fill(fill) => {
            let target = unsafe { slice::from_raw_parts_mut(target, size) };
            if !fill(target) {
                return Err(VulkanError::InvalidOperation {
                    reason: "staging fill callback reported failure".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Direct path: write into the (transiently) mapped destination, flushing
/// the full range when the memory is not host-coherent
fn upload_host_visible(
    device: &Device,
    request: UploadRequest<'_>,
    mem_flags: vk::MemoryPropertyFlags,
    kind: TransferKind,
) -> VulkanResult<()> {
    let UploadRequest {
        allocation,
        size,
        source,
        on_upload,
        ..
    } = request;

    let info = device.allocator().get_allocation_info(allocation);
    let already_mapped = !info.mapped_data.is_null();
    let target = if already_mapped {
        info.mapped_data.cast::<u8>()
    } else {
        unsafe { device.allocator().map_memory(allocation) }.map_err(VulkanError::Api)?
    };

    let write_result = write_into(target, size as usize, source, kind);
    let flush_result = if write_result.is_ok()
        && !mem_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    {
        device
            .allocator()
            .flush_allocation(allocation, 0, vk::WHOLE_SIZE as _)
            .map_err(VulkanError::Api)
    } else {
        Ok(())
    };

    if !already_mapped {
        unsafe { device.allocator().unmap_memory(allocation) };
    }
    write_result?;
    flush_result?;

    if let Some(on_upload) = on_upload {
        let mut exec = SingleTimeCommands::new(device)?;
        on_upload(&mut exec, false);
        return exec.end();
    }
    Ok(())
}

/// Staging path: fill a temporary host-visible buffer, then record the
/// caller's transfer and follow-up work in one single-time execution
fn upload_staging(
    device: &Device,
    request: UploadRequest<'_>,
    kind: TransferKind,
) -> VulkanResult<()> {
    let UploadRequest {
        size,
        source,
        on_copy_staging,
        on_upload,
        ..
    } = request;

    let mut staging = Buffer {
        element_count: 1,
        usage: vk::BufferUsageFlags::TRANSFER_SRC,
        memory_usage: vk_mem::MemoryUsage::CpuOnly,
        required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        preferred_flags: vk::MemoryPropertyFlags::HOST_COHERENT,
        priority: STAGING_PRIORITY,
        ..Buffer::default()
    };
    staging.construct(size, 1);
    staging.allocate(device)?;

    if let Err(e) = staging.map(device) {
        staging.destroy(device);
        return Err(e);
    }
    if let Err(e) = write_into(staging.mapped_ptr(), size as usize, source, kind) {
        staging.destroy(device);
        return Err(e);
    }
    staging.unmap(device);

    let result = (|| {
        let mut exec = SingleTimeCommands::new(device)?;
        if let Some(on_copy_staging) = on_copy_staging {
            on_copy_staging(&mut exec, &staging);
        }
        if let Some(on_upload) = on_upload {
            on_upload(&mut exec, true);
        }
        exec.end()
    })();

    // Destroyed regardless of the submission outcome
    staging.destroy(device);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_into_copies_bytes() {
        let mut target = [0u8; 8];
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        write_into(
            target.as_mut_ptr(),
            target.len(),
            UploadSource::Bytes(&data),
            TransferKind::Copy,
        )
        .expect("copy");
        assert_eq!(target, data);
    }

    #[test]
    fn write_into_runs_fill_callback() {
        let mut target = [0u8; 4];
        write_into(
            target.as_mut_ptr(),
            target.len(),
            UploadSource::Fill(Box::new(|bytes| {
                bytes.copy_from_slice(&[9, 9, 9, 9]);
                true
            })),
            TransferKind::Copy,
        )
        .expect("fill");
        assert_eq!(target, [9, 9, 9, 9]);
    }

    #[test]
    fn failed_fill_callback_fails_the_write() {
        let mut target = [0u8; 4];
        let result = write_into(
            target.as_mut_ptr(),
            target.len(),
            UploadSource::Fill(Box::new(|_| false)),
            TransferKind::Copy,
        );
        assert!(result.is_err());
    }

    #[test]
    fn move_kind_copies_disjoint_regions() {
        let mut target = [0u8; 4];
        let data = [7u8, 6, 5, 4];
        write_into(
            target.as_mut_ptr(),
            target.len(),
            UploadSource::Bytes(&data),
            TransferKind::Move,
        )
        .expect("move");
        assert_eq!(target, data);
    }
}
