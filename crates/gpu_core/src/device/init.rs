//! Device initialization sequence
//!
//! Instance, debug messenger (debug builds), optional surface, physical
//! device, logical device, allocator, command pools, fence pool — in that
//! order. Partially created state is rolled back on failure; the enabled
//! extension list is owned by this module for the duration of one
//! initialization and nothing outlives it at process scope.

use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::{c_char, c_void, CStr, CString};
use std::mem::ManuallyDrop;

use ash::extensions::khr;
use ash::vk;

use super::selector::{self, SelectedDevice};
use super::{
    CommandBufferAlloc, CommandPools, Device, DeviceConfig, DeviceQueues, DeviceRuntimeData,
    FenceAlloc, PresentQueue, QueueFamily, SurfaceContext,
};
use crate::error::{VulkanError, VulkanResult};
use crate::pool::ResourcePool;

#[cfg(debug_assertions)]
use super::DebugMessenger;

const GRAPHICS_PRIMARY_BUFFERS: usize = 5;
const GRAPHICS_SECONDARY_BUFFERS: usize = 10;
const COMPUTE_PRIMARY_BUFFERS: usize = 2;
const COMPUTE_SECONDARY_BUFFERS: usize = 2;

/// Holds partially initialized handles and destroys them if initialization
/// bails out before the `Device` takes ownership
#[derive(Default)]
struct Bootstrap {
    instance: Option<ash::Instance>,
    #[cfg(debug_assertions)]
    debug: Option<DebugMessenger>,
    surface: Option<SurfaceContext>,
    device: Option<ash::Device>,
    command_pools: Vec<vk::CommandPool>,
    allocator: Option<vk_mem::Allocator>,
}

impl Drop for Bootstrap {
    fn drop(&mut self) {
        unsafe {
            if let Some(allocator) = self.allocator.take() {
                drop(allocator);
            }
            if let Some(device) = self.device.take() {
                for pool in self.command_pools.drain(..) {
                    device.destroy_command_pool(pool, None);
                }
                device.destroy_device(None);
            }
            #[cfg(debug_assertions)]
            if let Some(debug) = self.debug.take() {
                debug
                    .utils
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.handle, None);
            }
            if let Some(instance) = self.instance.take() {
                instance.destroy_instance(None);
            }
        }
    }
}

pub(super) fn initialize(mut config: DeviceConfig) -> VulkanResult<Device> {
    let entry = unsafe { ash::Entry::load() }.map_err(|e| {
        VulkanError::InitializationFailed(format!("Failed to load Vulkan library: {e}"))
    })?;

    let mut boot = Bootstrap::default();

    let instance = create_instance(&entry, &config)?;
    boot.instance = Some(instance.clone());

    #[cfg(debug_assertions)]
    {
        let debug = setup_debug_messenger(&entry, &instance)?;
        boot.debug = Some(debug);
    }

    if let Some(present) = config.present.as_ref() {
        let handle = present.create_surface(&entry, &instance)?;
        let loader = khr::Surface::new(&entry, &instance);
        boot.surface = Some(SurfaceContext { loader, handle });
    }

    let selected = selector::pick_physical_device(&instance, &mut config, boot.surface.as_ref())?;

    let properties = query_properties(
        &instance,
        selected.physical_device,
        config.physical_device_next,
    );
    let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
    log::info!("Selected GPU: {}", device_name.to_string_lossy());

    let memory_properties = unsafe {
        instance.get_physical_device_memory_properties(selected.physical_device)
    };

    let device = create_logical_device(&instance, &selected, &config)?;
    boot.device = Some(device.clone());

    let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
        &instance,
        &device,
        selected.physical_device,
    ))
    .map_err(VulkanError::Api)?;
    boot.allocator = Some(allocator);

    let graphics_queue = unsafe { device.get_device_queue(selected.graphics_family, 0) };
    let compute_queue = unsafe { device.get_device_queue(selected.compute_family, 0) };
    let present = selected.present_family.map(|family_index| PresentQueue {
        family_index,
        queue: unsafe { device.get_device_queue(family_index, 0) },
    });

    let graphics_pools = create_command_pools(
        &device,
        &mut boot,
        selected.graphics_family,
        GRAPHICS_PRIMARY_BUFFERS,
        GRAPHICS_SECONDARY_BUFFERS,
    )?;
    let compute_pools = create_command_pools(
        &device,
        &mut boot,
        selected.compute_family,
        COMPUTE_PRIMARY_BUFFERS,
        COMPUTE_SECONDARY_BUFFERS,
    )?;

    let mut fence_pool = ResourcePool::new(FenceAlloc {
        device: device.clone(),
    });
    fence_pool.allocate(config.fence_pool_size)?;
    log::debug!("Fence pool primed with {} fences", config.fence_pool_size);

    let optional_extensions: HashSet<String> = selected
        .optional_extensions
        .iter()
        .map(|ext| ext.to_string_lossy().into_owned())
        .collect();

    let rd = DeviceRuntimeData {
        queues: DeviceQueues {
            graphics: QueueFamily {
                family_index: selected.graphics_family,
                queue: graphics_queue,
                pools: graphics_pools,
            },
            compute: QueueFamily {
                family_index: selected.compute_family,
                queue: compute_queue,
                pools: compute_pools,
            },
            present,
        },
        fence_pool: RefCell::new(fence_pool),
        properties,
        memory_properties,
        optional_extensions,
    };

    // The Device takes over teardown from here; disarm the bootstrap
    let allocator = boot.allocator.take().map(ManuallyDrop::new).ok_or_else(|| {
        VulkanError::InitializationFailed("allocator was not created".to_string())
    })?;
    let surface = boot.surface.take();
    #[cfg(debug_assertions)]
    let debug = boot.debug.take();
    boot.device = None;
    boot.command_pools.clear();
    boot.instance = None;

    Ok(Device {
        entry,
        instance,
        physical_device: selected.physical_device,
        device,
        allocator,
        surface,
        rd,
        #[cfg(debug_assertions)]
        debug,
    })
}

fn create_instance(entry: &ash::Entry, config: &DeviceConfig) -> VulkanResult<ash::Instance> {
    log::info!("Creating Vulkan instance");

    #[cfg(debug_assertions)]
    if !check_validation_layer_support(entry, &config.validation_layers)? {
        return Err(VulkanError::InitializationFailed(
            "Validation layers requested, but not available".to_string(),
        ));
    }

    let app_name = CString::new(config.app_name.as_str()).map_err(|_| {
        VulkanError::InitializationFailed("application name contains a NUL byte".to_string())
    })?;
    let engine_name = CString::new("gpu_core").unwrap();
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(config.app_version)
        .engine_name(&engine_name)
        .engine_version(1)
        .api_version(vk::API_VERSION_1_2);

    let available: HashSet<String> = entry
        .enumerate_instance_extension_properties(None)
        .map_err(VulkanError::Api)?
        .iter()
        .map(selector::extension_name)
        .collect();

    let mut extensions: Vec<*const c_char> = Vec::new();
    #[cfg(debug_assertions)]
    extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
    if let Some(present) = config.present.as_ref() {
        extensions.extend(present.instance_extensions(&available)?);
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions);

    #[cfg(debug_assertions)]
    let layer_ptrs: Vec<*const c_char> = config
        .validation_layers
        .iter()
        .map(|layer| layer.as_ptr())
        .collect();
    #[cfg(debug_assertions)]
    let mut debug_info = debug_messenger_create_info();
    #[cfg(debug_assertions)]
    let create_info = create_info
        .enabled_layer_names(&layer_ptrs)
        .push_next(&mut debug_info);

    let instance =
        unsafe { entry.create_instance(&create_info, None) }.map_err(VulkanError::Api)?;

    for &extension in &extensions {
        let name = unsafe { CStr::from_ptr(extension) };
        log::info!("Enabling Vulkan instance extension: {}", name.to_string_lossy());
    }
    Ok(instance)
}

#[cfg(debug_assertions)]
fn check_validation_layer_support(
    entry: &ash::Entry,
    layers: &[CString],
) -> VulkanResult<bool> {
    let available = entry
        .enumerate_instance_layer_properties()
        .map_err(VulkanError::Api)?;
    Ok(layers.iter().all(|layer| {
        available.iter().any(|props| {
            let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
            name == layer.as_c_str()
        })
    }))
}

/// Route validation messages into the log facade
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
fn debug_messenger_create_info() -> vk::DebugUtilsMessengerCreateInfoEXTBuilder<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

#[cfg(debug_assertions)]
fn setup_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> VulkanResult<DebugMessenger> {
    log::debug!("Setting up debug messenger");
    let utils = ash::extensions::ext::DebugUtils::new(entry, instance);
    let messenger = unsafe {
        utils.create_debug_utils_messenger(&debug_messenger_create_info(), None)
    }
    .map_err(VulkanError::Api)?;
    Ok(DebugMessenger { utils, messenger })
}

fn query_properties(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    physical_next: *mut c_void,
) -> vk::PhysicalDeviceProperties {
    if physical_next.is_null() {
        unsafe { instance.get_physical_device_properties(physical_device) }
    } else {
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        properties2.p_next = physical_next;
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        properties2.properties
    }
}

fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
    config: &DeviceConfig,
) -> VulkanResult<ash::Device> {
    log::info!("Creating logical device");

    let mut unique_families = vec![selected.graphics_family, selected.compute_family];
    if let Some(present) = selected.present_family {
        unique_families.push(present);
    }
    unique_families.sort_unstable();
    unique_families.dedup();

    let priorities = [1.0f32];
    let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&priorities)
                .build()
        })
        .collect();

    let enabled: Vec<&CString> = config
        .device_extensions
        .iter()
        .chain(selected.optional_extensions.iter())
        .collect();
    for name in &enabled {
        log::info!("Enabling Vulkan device extension: {}", name.to_string_lossy());
    }
    let enabled_ptrs: Vec<*const c_char> = enabled.iter().map(|name| name.as_ptr()).collect();

    let mut create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&enabled_ptrs)
        .enabled_features(&config.device_features)
        .build();
    create_info.p_next = config.logical_device_next;

    unsafe { instance.create_device(selected.physical_device, &create_info, None) }
        .map_err(VulkanError::Api)
}

fn create_command_pools(
    device: &ash::Device,
    boot: &mut Bootstrap,
    family_index: u32,
    primary: usize,
    secondary: usize,
) -> VulkanResult<CommandPools> {
    let create_info = vk::CommandPoolCreateInfo::builder()
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
        .queue_family_index(family_index);
    let pool =
        unsafe { device.create_command_pool(&create_info, None) }.map_err(VulkanError::Api)?;
    boot.command_pools.push(pool);

    let mut primary_pool = ResourcePool::new(CommandBufferAlloc {
        device: device.clone(),
        pool,
        level: vk::CommandBufferLevel::PRIMARY,
    });
    primary_pool.allocate(primary)?;

    let mut secondary_pool = ResourcePool::new(CommandBufferAlloc {
        device: device.clone(),
        pool,
        level: vk::CommandBufferLevel::SECONDARY,
    });
    secondary_pool.allocate(secondary)?;

    log::debug!(
        "Command pools for family {family_index}: {primary} primary, {secondary} secondary"
    );
    Ok(CommandPools {
        pool,
        primary: RefCell::new(primary_pool),
        secondary: RefCell::new(secondary_pool),
    })
}
