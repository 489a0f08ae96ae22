//! Single-time command execution
//!
//! A [`SingleTimeCommands`] is a one-shot, synchronous record/submit/wait
//! cycle on the graphics queue, used for transfers and layout transitions.
//! The command buffer comes from the graphics queue's primary pool and a
//! fence from the device's fence pool; both go back to their pools when the
//! execution finishes, whatever the outcome.
//!
//! `end` blocks the calling thread until the GPU signals completion; there
//! is no cancellation and no overlap between executors beyond queue
//! submission order. Concurrent executors require external synchronization
//! around the device (the pools are not locked internally).

use ash::vk;

use crate::device::Device;
use crate::error::{VulkanError, VulkanResult};

/// One-shot command recording bound to the graphics queue.
///
/// Construction acquires a pooled primary command buffer and begins it with
/// the one-time-submit hint; the caller records into
/// [`command_buffer`](Self::command_buffer) (or the convenience methods)
/// and finishes with [`end`](Self::end).
pub struct SingleTimeCommands<'a> {
    device: &'a Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> SingleTimeCommands<'a> {
    /// Acquire a command buffer and begin recording
    pub fn new(device: &'a Device) -> VulkanResult<Self> {
        let command_buffer = device
            .runtime_data()
            .queues
            .graphics
            .pools
            .primary
            .borrow_mut()
            .request_one()?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe {
            device
                .handle()
                .begin_command_buffer(command_buffer, &begin_info)
        } {
            device
                .runtime_data()
                .queues
                .graphics
                .pools
                .primary
                .borrow_mut()
                .release(command_buffer);
            return Err(VulkanError::Api(e));
        }
        Ok(Self {
            device,
            command_buffer,
        })
    }

    /// The live command buffer, for recording arbitrary commands
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// The device this execution runs on
    pub fn device(&self) -> &Device {
        self.device
    }

    /// Record a whole-range buffer-to-buffer copy
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy::builder()
            .src_offset(0)
            .dst_offset(0)
            .size(size)
            .build();
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.command_buffer, src, dst, &[region]);
        }
    }

    /// End recording, submit to the graphics queue and wait for completion.
    ///
    /// The command buffer and the fence are returned to their pools on both
    /// the success and the failure path; submission and wait failures
    /// propagate the native result code.
    pub fn end(self) -> VulkanResult<()> {
        let rd = self.device.runtime_data();
        let vk_device = self.device.handle();

        let fence = match rd.fence_pool.borrow_mut().request_one() {
            Ok(fence) => fence,
            Err(e) => {
                rd.queues
                    .graphics
                    .pools
                    .primary
                    .borrow_mut()
                    .release(self.command_buffer);
                return Err(e);
            }
        };

        let result = (|| -> VulkanResult<()> {
            unsafe { vk_device.reset_fences(&[fence]) }.map_err(VulkanError::Api)?;
            unsafe { vk_device.end_command_buffer(self.command_buffer) }
                .map_err(VulkanError::Api)?;
            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .build();
            unsafe { vk_device.queue_submit(rd.queues.graphics.queue, &[submit_info], fence) }
                .map_err(VulkanError::Api)?;
            unsafe { vk_device.wait_for_fences(&[fence], true, u64::MAX) }
                .map_err(VulkanError::Api)
        })();

        rd.queues
            .graphics
            .pools
            .primary
            .borrow_mut()
            .release(self.command_buffer);
        rd.fence_pool.borrow_mut().release(fence);
        result
    }
}
