//! # gpu_core
//!
//! GPU resource lifecycle and transfer core built on Vulkan (`ash` +
//! `vk-mem`). It selects a physical device, owns reusable pools of
//! short-lived GPU objects (command buffers, fences), executes single-shot
//! command sequences, and decides per upload whether data can be written
//! directly into device memory or must travel through a staging buffer. On
//! top of those primitives it provides a growable array whose element
//! storage lives entirely in a device buffer.
//!
//! Swapchains, descriptor sets, pipelines and textures are consumers of
//! these primitives and live outside this crate.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gpu_core::{Device, DeviceConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = Device::new(DeviceConfig::new("demo", 1).with_fence_pool_size(4))?;
//!
//!     let mut vertices = gpu_core::Buffer {
//!         element_count: 3,
//!         usage: ash::vk::BufferUsageFlags::VERTEX_BUFFER
//!             | ash::vk::BufferUsageFlags::TRANSFER_DST,
//!         memory_usage: vk_mem::MemoryUsage::GpuOnly,
//!         ..gpu_core::Buffer::default()
//!     };
//!     vertices.construct(12, 1);
//!     vertices.allocate(&device)?;
//!
//!     let data = [0u8; 36];
//!     let dst = vertices.handle;
//!     let size = vertices.size;
//!     let allocation = vertices.allocation.as_mut().ok_or("unallocated")?;
//!     gpu_core::copy_to_gpu(
//!         &device,
//!         gpu_core::UploadRequest::from_bytes(allocation, &data)
//!             .with_staging_copy(gpu_core::copy_buffer_callback(dst, size)),
//!     )?;
//!
//!     vertices.destroy(&device);
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! Everything here is single-threaded per device: the pools are not locked
//! and every transfer is a blocking submit-and-wait round trip. Use one
//! device per thread or synchronize externally.

pub mod buffer;
pub mod commands;
pub mod device;
pub mod device_vec;
pub mod error;
pub mod pool;
pub mod upload;

pub use buffer::{align_to, copy_buffer_once, Buffer};
pub use commands::SingleTimeCommands;
pub use device::{
    max_msaa_samples, max_usable_sample_count, Device, DeviceConfig, DeviceQueues,
    DeviceRuntimeData, PhysicalDeviceSelector, PresentContext, PresentQueue, QueueFamily,
    SwapchainSupport, WindowPresentContext,
};
pub use device_vec::DeviceVec;
pub use error::{VulkanError, VulkanResult};
pub use pool::{PoolAllocator, ResourcePool};
pub use upload::{
    allocation_memory_flags, copy_buffer_callback, copy_to_gpu, move_to_gpu, PostUploadFn,
    StagingCopyFn, UploadRequest, UploadSource,
};
