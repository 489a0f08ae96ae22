//! Device ownership and runtime data
//!
//! The [`Device`] owns every core Vulkan handle: instance, physical and
//! logical device, the vk-mem allocator, an optional presentation surface,
//! and the per-queue command pools and fence pool the rest of the crate
//! draws from. Teardown order is encoded in `Drop` (runtime data, then
//! allocator, logical device, debug messenger, surface, instance) rather
//! than left to caller discipline.
//!
//! A `Device` is single-threaded by contract: the pools live behind
//! `RefCell` and perform no locking. Use one device per thread or wrap
//! access in external synchronization.

mod init;
mod selector;

use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::{c_char, c_void, CString};
use std::mem::ManuallyDrop;

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::buffer::align_to;
use crate::error::{VulkanError, VulkanResult};
use crate::pool::{PoolAllocator, ResourcePool};

/// Custom physical-device selection policy.
///
/// When supplied, the policy's pick is validated against the same
/// suitability rules as the default path and, if it passes, accepted
/// without a rating comparison. The policy is informed of the outcome
/// through [`notify`](Self::notify); an unsuitable pick falls back to the
/// default rating scan.
pub trait PhysicalDeviceSelector {
    /// Choose one device out of the enumerated candidates
    fn select(&mut self, devices: &[vk::PhysicalDevice]) -> Option<vk::PhysicalDevice>;

    /// Called with `true` when the pick was accepted, `false` otherwise
    fn notify(&mut self, _accepted: bool) {}
}

/// Presentation hookup for windowed devices.
///
/// Headless devices simply omit the context; presentation support is then
/// never queried and the present queue family stays unset.
pub trait PresentContext {
    /// Create the presentation surface for the freshly created instance
    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> VulkanResult<vk::SurfaceKHR>;

    /// Instance extensions this surface type requires.
    ///
    /// `available` holds the names the driver reports, for contexts that
    /// want to pick between alternatives.
    fn instance_extensions(
        &self,
        available: &HashSet<String>,
    ) -> VulkanResult<Vec<*const c_char>>;
}

/// [`PresentContext`] over raw window/display handles, using `ash-window`
pub struct WindowPresentContext {
    display: RawDisplayHandle,
    window: RawWindowHandle,
}

impl WindowPresentContext {
    /// Wrap the raw handles of an existing window
    pub fn new(display: RawDisplayHandle, window: RawWindowHandle) -> Self {
        Self { display, window }
    }
}

impl PresentContext for WindowPresentContext {
    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> VulkanResult<vk::SurfaceKHR> {
        unsafe { ash_window::create_surface(entry, instance, self.display, self.window, None) }
            .map_err(VulkanError::Api)
    }

    fn instance_extensions(
        &self,
        _available: &HashSet<String>,
    ) -> VulkanResult<Vec<*const c_char>> {
        ash_window::enumerate_required_extensions(self.display)
            .map(<[*const c_char]>::to_vec)
            .map_err(VulkanError::Api)
    }
}

/// Everything needed to initialize a [`Device`].
///
/// Builder-style setters; `Default` gives a headless configuration with no
/// extra extensions and the standard validation layer (debug builds).
pub struct DeviceConfig {
    /// Application name reported to the driver
    pub app_name: String,
    /// Application version reported to the driver
    pub app_version: u32,
    /// Device extensions that must be present for a device to be suitable
    pub device_extensions: Vec<CString>,
    /// Device extensions enabled when supported; each supported one adds to
    /// the candidate's rating
    pub optional_extensions: Vec<CString>,
    /// Features the logical device is created with
    pub device_features: vk::PhysicalDeviceFeatures,
    /// Number of fences eagerly created in the fence pool
    pub fence_pool_size: usize,
    /// Validation layers enabled in debug builds
    pub validation_layers: Vec<CString>,
    /// Extension chain passed to the physical-device properties query
    pub physical_device_next: *mut c_void,
    /// Extension chain passed to logical-device creation
    pub logical_device_next: *const c_void,
    /// Custom selection policy; the default rating scan runs when absent
    /// or when the policy's pick is unsuitable
    pub selector: Option<Box<dyn PhysicalDeviceSelector>>,
    /// Presentation context; headless when absent
    pub present: Option<Box<dyn PresentContext>>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("gpu_core"),
            app_version: 1,
            device_extensions: Vec::new(),
            optional_extensions: Vec::new(),
            device_features: vk::PhysicalDeviceFeatures::default(),
            fence_pool_size: 0,
            validation_layers: vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()],
            physical_device_next: std::ptr::null_mut(),
            logical_device_next: std::ptr::null(),
            selector: None,
            present: None,
        }
    }
}

impl DeviceConfig {
    /// Start a configuration with the given application identity
    pub fn new(app_name: impl Into<String>, app_version: u32) -> Self {
        Self {
            app_name: app_name.into(),
            app_version,
            ..Self::default()
        }
    }

    /// Set the required device extensions
    #[must_use]
    pub fn with_device_extensions(mut self, extensions: Vec<CString>) -> Self {
        self.device_extensions = extensions;
        self
    }

    /// Set the optional device extensions
    #[must_use]
    pub fn with_optional_extensions(mut self, extensions: Vec<CString>) -> Self {
        self.optional_extensions = extensions;
        self
    }

    /// Set the required device features
    #[must_use]
    pub fn with_device_features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.device_features = features;
        self
    }

    /// Set the fence pool size
    #[must_use]
    pub fn with_fence_pool_size(mut self, size: usize) -> Self {
        self.fence_pool_size = size;
        self
    }

    /// Set the validation layers used in debug builds
    #[must_use]
    pub fn with_validation_layers(mut self, layers: Vec<CString>) -> Self {
        self.validation_layers = layers;
        self
    }

    /// Attach a custom physical-device selection policy
    #[must_use]
    pub fn with_selector(mut self, selector: Box<dyn PhysicalDeviceSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Attach a presentation context
    #[must_use]
    pub fn with_present_context(mut self, present: Box<dyn PresentContext>) -> Self {
        self.present = Some(present);
        self
    }

    /// Chain extension structs onto the physical-device properties query
    #[must_use]
    pub fn with_physical_device_next(mut self, next: *mut c_void) -> Self {
        self.physical_device_next = next;
        self
    }

    /// Chain extension structs onto logical-device creation
    #[must_use]
    pub fn with_logical_device_next(mut self, next: *const c_void) -> Self {
        self.logical_device_next = next;
        self
    }
}

/// Surface handle together with its extension loader
pub(crate) struct SurfaceContext {
    pub(crate) loader: khr::Surface,
    pub(crate) handle: vk::SurfaceKHR,
}

/// Debug messenger handles (debug builds only)
#[cfg(debug_assertions)]
pub(crate) struct DebugMessenger {
    pub(crate) utils: ash::extensions::ext::DebugUtils,
    pub(crate) messenger: vk::DebugUtilsMessengerEXT,
}

/// Surface capabilities, formats and present modes of a physical device
pub struct SwapchainSupport {
    /// Surface capabilities (extent bounds, image counts, transforms)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported presentation modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub(crate) fn query(
        physical_device: vk::PhysicalDevice,
        surface: &SurfaceContext,
    ) -> VulkanResult<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, surface.handle)
                    .map_err(VulkanError::Api)?,
                formats: surface
                    .loader
                    .get_physical_device_surface_formats(physical_device, surface.handle)
                    .map_err(VulkanError::Api)?,
                present_modes: surface
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, surface.handle)
                    .map_err(VulkanError::Api)?,
            })
        }
    }

    /// At least one format and one present mode are available
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Allocates primary or secondary command buffers out of one `vk::CommandPool`
pub struct CommandBufferAlloc {
    device: ash::Device,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
}

impl PoolAllocator<vk::CommandBuffer> for CommandBufferAlloc {
    fn alloc(&mut self, out: &mut [vk::CommandBuffer]) -> VulkanResult<()> {
        if out.is_empty() {
            return Ok(());
        }
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(self.level)
            .command_buffer_count(out.len() as u32);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(VulkanError::Api)?;
        out.copy_from_slice(&buffers);
        Ok(())
    }

    fn release(&mut self, _handle: &mut vk::CommandBuffer) {
        // Freed in bulk when the owning vk::CommandPool is destroyed
    }
}

/// Creates signaled fences for the device's fence pool
pub struct FenceAlloc {
    device: ash::Device,
}

impl PoolAllocator<vk::Fence> for FenceAlloc {
    fn alloc(&mut self, out: &mut [vk::Fence]) -> VulkanResult<()> {
        let create_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        for i in 0..out.len() {
            match unsafe { self.device.create_fence(&create_info, None) } {
                Ok(fence) => out[i] = fence,
                Err(e) => {
                    for created in 0..i {
                        unsafe { self.device.destroy_fence(out[created], None) };
                    }
                    return Err(VulkanError::Api(e));
                }
            }
        }
        Ok(())
    }

    fn release(&mut self, handle: &mut vk::Fence) {
        unsafe { self.device.destroy_fence(*handle, None) };
    }
}

/// One `vk::CommandPool` plus reuse pools for its primary and secondary
/// command buffers
pub struct CommandPools {
    pub(crate) pool: vk::CommandPool,
    /// Primary command buffers (single-time executors draw from here)
    pub primary: RefCell<ResourcePool<vk::CommandBuffer, CommandBufferAlloc>>,
    /// Secondary command buffers for external consumers
    pub secondary: RefCell<ResourcePool<vk::CommandBuffer, CommandBufferAlloc>>,
}

impl CommandPools {
    /// The underlying `vk::CommandPool` handle
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    fn destroy(&mut self, device: &ash::Device) {
        self.primary.borrow_mut().destroy();
        self.secondary.borrow_mut().destroy();
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// A queue family the device submits work to
pub struct QueueFamily {
    /// Queue family index on the physical device
    pub family_index: u32,
    /// The queue handle (index 0 of the family)
    pub queue: vk::Queue,
    /// Command pools bound to this family
    pub pools: CommandPools,
}

/// The presentation queue of a windowed device
pub struct PresentQueue {
    /// Queue family index on the physical device
    pub family_index: u32,
    /// The queue handle (index 0 of the family)
    pub queue: vk::Queue,
}

/// The queues a device was created with.
///
/// Graphics and compute are mandatory; present exists only when the device
/// was configured with a [`PresentContext`].
pub struct DeviceQueues {
    /// Graphics queue family
    pub graphics: QueueFamily,
    /// Compute queue family
    pub compute: QueueFamily,
    /// Present queue family, when a surface was requested
    pub present: Option<PresentQueue>,
}

impl DeviceQueues {
    fn destroy(&mut self, device: &ash::Device) {
        log::info!("Destroying command pools");
        self.graphics.pools.destroy(device);
        self.compute.pools.destroy(device);
    }
}

/// Runtime data attached to a device: queues, pools and cached
/// physical-device information
pub struct DeviceRuntimeData {
    /// Queue families and their command pools
    pub queues: DeviceQueues,
    /// Pool of reusable fences for one-shot submissions
    pub fence_pool: RefCell<ResourcePool<vk::Fence, FenceAlloc>>,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) optional_extensions: HashSet<String>,
}

impl DeviceRuntimeData {
    /// Cached physical-device properties
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Cached physical-device memory properties
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Round a size up to the device's minimum uniform-buffer offset alignment
    pub fn aligned_ubo_size(&self, size: vk::DeviceSize) -> vk::DeviceSize {
        align_to(size, self.properties.limits.min_uniform_buffer_offset_alignment)
    }

    /// Whether the given optional extension was enabled on this device
    pub fn is_extension_supported(&self, name: &str) -> bool {
        self.optional_extensions.contains(name)
    }

    fn destroy(&mut self, device: &ash::Device) {
        log::info!("Destroying device resources");
        self.queues.destroy(device);
        self.fence_pool.borrow_mut().destroy();
    }
}

/// Owner of the logical device and everything attached to it.
///
/// Construction runs the full initialization sequence (instance, optional
/// surface, physical-device selection, logical device, allocator, pools);
/// any failure along the way is fatal for this device and rolls back the
/// partially created state.
pub struct Device {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) allocator: ManuallyDrop<vk_mem::Allocator>,
    pub(crate) surface: Option<SurfaceContext>,
    pub(crate) rd: DeviceRuntimeData,
    #[cfg(debug_assertions)]
    pub(crate) debug: Option<DebugMessenger>,
}

impl Device {
    /// Initialize a device from the given configuration.
    ///
    /// Fatal errors (no suitable GPU, instance/device/allocator creation
    /// failure, missing validation layers in debug builds) abort
    /// initialization; there is no retry.
    pub fn new(config: DeviceConfig) -> VulkanResult<Self> {
        init::initialize(config)
    }

    /// The loaded Vulkan entry points
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// The Vulkan instance
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The selected physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The logical device
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// The vk-mem allocator backing all buffer allocations
    pub fn allocator(&self) -> &vk_mem::Allocator {
        &self.allocator
    }

    /// Runtime data: queues, pools, cached properties
    pub fn runtime_data(&self) -> &DeviceRuntimeData {
        &self.rd
    }

    /// The presentation surface, when one was requested
    pub fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface.as_ref().map(|s| s.handle)
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(VulkanError::Api)
    }

    /// Query swapchain support of the selected device for the device's surface
    pub fn query_swapchain_support(&self) -> VulkanResult<SwapchainSupport> {
        let surface = self.surface.as_ref().ok_or_else(|| VulkanError::InvalidOperation {
            reason: "device was created without a presentation surface".to_string(),
        })?;
        SwapchainSupport::query(self.physical_device, surface)
    }

    /// Find the first candidate format supporting the requested tiling features
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> VulkanResult<vk::Format> {
        for &format in candidates {
            let props = unsafe {
                self.instance
                    .get_physical_device_format_properties(self.physical_device, format)
            };
            let supported = match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                _ => props.optimal_tiling_features.contains(features),
            };
            if supported {
                return Ok(format);
            }
        }
        Err(VulkanError::InvalidOperation {
            reason: "none of the candidate formats is supported".to_string(),
        })
    }

    /// Whether the format supports linear filtering with optimal tiling
    pub fn supports_linear_filter(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.rd.destroy(&self.device);
            ManuallyDrop::drop(&mut self.allocator);
            log::info!("Destroying logical device");
            self.device.destroy_device(None);
            #[cfg(debug_assertions)]
            if let Some(debug) = self.debug.take() {
                debug
                    .utils
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            if let Some(surface) = self.surface.take() {
                log::info!("Destroying window surface");
                surface.loader.destroy_surface(surface.handle, None);
            }
            log::info!("Destroying instance");
            self.instance.destroy_instance(None);
        }
    }
}

/// Highest sample count usable for sampled color images
pub fn max_msaa_samples(properties: &vk::PhysicalDeviceProperties) -> vk::SampleCountFlags {
    max_sample_count(properties.limits.sampled_image_color_sample_counts)
}

/// Highest sample count usable for both color and depth framebuffers
pub fn max_usable_sample_count(properties: &vk::PhysicalDeviceProperties) -> vk::SampleCountFlags {
    max_sample_count(
        properties.limits.framebuffer_color_sample_counts
            & properties.limits.framebuffer_depth_sample_counts,
    )
}

fn max_sample_count(counts: vk::SampleCountFlags) -> vk::SampleCountFlags {
    for candidate in [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ] {
        if counts.contains(candidate) {
            return candidate;
        }
    }
    vk::SampleCountFlags::TYPE_1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_sample_count_picks_highest_bit() {
        let counts = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_sample_count(counts), vk::SampleCountFlags::TYPE_8);
        assert_eq!(
            max_sample_count(vk::SampleCountFlags::TYPE_1),
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn usable_sample_count_intersects_color_and_depth() {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.limits.framebuffer_color_sample_counts =
            vk::SampleCountFlags::TYPE_8 | vk::SampleCountFlags::TYPE_4;
        properties.limits.framebuffer_depth_sample_counts = vk::SampleCountFlags::TYPE_4;
        assert_eq!(
            max_usable_sample_count(&properties),
            vk::SampleCountFlags::TYPE_4
        );
    }
}
