//! Physical-device selection
//!
//! Every candidate goes through the same pipeline: build its supported
//! extension set, scan queue families once, then check suitability. Among
//! suitable devices the one with the highest rating wins (strict comparison,
//! ties keep the first found). A custom policy short-circuits the rating
//! scan but never the suitability check.

use std::collections::HashSet;
use std::ffi::{CStr, CString};

use ash::vk;

use super::{DeviceConfig, SurfaceContext, SwapchainSupport};
use crate::error::{VulkanError, VulkanResult};

/// The outcome of physical-device selection
pub(crate) struct SelectedDevice {
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) graphics_family: u32,
    pub(crate) compute_family: u32,
    pub(crate) present_family: Option<u32>,
    pub(crate) optional_extensions: Vec<CString>,
}

#[derive(Default)]
struct QueueFamilyIndices {
    graphics: Option<u32>,
    compute: Option<u32>,
    present: Option<u32>,
}

impl QueueFamilyIndices {
    fn complete(&self, need_present: bool) -> bool {
        let base = self.graphics.is_some() && self.compute.is_some();
        if need_present {
            base && self.present.is_some()
        } else {
            base
        }
    }
}

/// Extension name from the driver's fixed-size char array
pub(crate) fn extension_name(properties: &vk::ExtensionProperties) -> String {
    unsafe { CStr::from_ptr(properties.extension_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn supported_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> HashSet<String> {
    unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .map(|extensions| extensions.iter().map(extension_name).collect())
        .unwrap_or_default()
}

/// Single pass over the queue family properties, recording the first family
/// advertising each capability and stopping once everything is resolved
fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&SurfaceContext>,
) -> QueueFamilyIndices {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let mut indices = QueueFamilyIndices::default();

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if indices.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            indices.graphics = Some(index);
        }
        if indices.compute.is_none() && family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            indices.compute = Some(index);
        }
        if let Some(surface) = surface {
            if indices.present.is_none() {
                let supported = unsafe {
                    surface.loader.get_physical_device_surface_support(
                        physical_device,
                        index,
                        surface.handle,
                    )
                }
                .unwrap_or(false);
                if supported {
                    indices.present = Some(index);
                }
            }
        }
        if indices.complete(surface.is_some()) {
            break;
        }
    }
    indices
}

fn supported_optional(all: &HashSet<String>, optional: &[CString]) -> Vec<CString> {
    optional
        .iter()
        .filter(|ext| all.contains(ext.to_string_lossy().as_ref()))
        .cloned()
        .collect()
}

fn is_suitable(
    physical_device: vk::PhysicalDevice,
    extensions: &HashSet<String>,
    indices: &QueueFamilyIndices,
    required: &[CString],
    surface: Option<&SurfaceContext>,
) -> bool {
    let required_ok = required
        .iter()
        .all(|ext| extensions.contains(ext.to_string_lossy().as_ref()));
    if !required_ok || !indices.complete(surface.is_some()) {
        return false;
    }
    match surface {
        Some(ctx) => SwapchainSupport::query(physical_device, ctx)
            .map(|support| support.is_adequate())
            .unwrap_or(false),
        None => true,
    }
}

/// Rate a suitable device: discrete beats integrated, then tiered bonuses
/// for MSAA, 2D image dimension and compute workgroup count, plus one point
/// per supported optional extension
pub(crate) fn device_rating(
    properties: &vk::PhysicalDeviceProperties,
    optional_extension_count: usize,
) -> i32 {
    let mut rating = 0;

    if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        rating += 10;
    } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
        rating += 5;
    }

    rating += sample_count_rating(properties.limits.framebuffer_color_sample_counts);
    rating += dimension_rating(properties.limits.max_image_dimension2_d);
    rating += dimension_rating(properties.limits.max_compute_work_group_count[0]);
    rating += optional_extension_count as i32;
    rating
}

fn sample_count_rating(counts: vk::SampleCountFlags) -> i32 {
    if counts.contains(vk::SampleCountFlags::TYPE_64) {
        8
    } else if counts.contains(vk::SampleCountFlags::TYPE_32) {
        7
    } else if counts.contains(vk::SampleCountFlags::TYPE_16) {
        6
    } else if counts.contains(vk::SampleCountFlags::TYPE_8) {
        5
    } else if counts.contains(vk::SampleCountFlags::TYPE_4) {
        4
    } else if counts.contains(vk::SampleCountFlags::TYPE_2) {
        2
    } else {
        0
    }
}

fn dimension_rating(limit: u32) -> i32 {
    if limit > 65536 {
        8
    } else if limit > 32768 {
        6
    } else if limit > 16384 {
        4
    } else if limit > 8192 {
        2
    } else if limit > 4096 {
        1
    } else {
        0
    }
}

/// Build the extension set and queue indices for one candidate and run the
/// suitability check; `None` when the device cannot be used
fn validate_candidate(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    required: &[CString],
    optional: &[CString],
    surface: Option<&SurfaceContext>,
) -> Option<SelectedDevice> {
    let extensions = supported_extensions(instance, physical_device);
    let indices = find_queue_families(instance, physical_device, surface);
    if !is_suitable(physical_device, &extensions, &indices, required, surface) {
        return None;
    }
    Some(SelectedDevice {
        physical_device,
        graphics_family: indices.graphics?,
        compute_family: indices.compute?,
        present_family: indices.present,
        optional_extensions: supported_optional(&extensions, optional),
    })
}

/// Choose a physical device per the configured policy.
///
/// A custom selector's pick is validated and accepted unconditionally when
/// suitable; otherwise all candidates are rated and the best one wins.
pub(crate) fn pick_physical_device(
    instance: &ash::Instance,
    config: &mut DeviceConfig,
    surface: Option<&SurfaceContext>,
) -> VulkanResult<SelectedDevice> {
    log::info!("Searching for a physical device");
    let devices =
        unsafe { instance.enumerate_physical_devices() }.map_err(VulkanError::Api)?;

    let mut chosen: Option<SelectedDevice> = None;

    if let Some(selector) = config.selector.as_mut() {
        match selector.select(&devices) {
            Some(pick) => {
                if let Some(candidate) = validate_candidate(
                    instance,
                    pick,
                    &config.device_extensions,
                    &config.optional_extensions,
                    surface,
                ) {
                    selector.notify(true);
                    chosen = Some(candidate);
                } else {
                    log::warn!(
                        "Custom physical-device policy returned an unsuitable device; \
                         falling back to the rating scan"
                    );
                    selector.notify(false);
                }
            }
            None => selector.notify(false),
        }
    }

    if chosen.is_none() {
        let mut best_rating = 0;
        for &physical_device in &devices {
            let Some(candidate) = validate_candidate(
                instance,
                physical_device,
                &config.device_extensions,
                &config.optional_extensions,
                surface,
            ) else {
                continue;
            };
            let properties =
                unsafe { instance.get_physical_device_properties(physical_device) };
            let rating = device_rating(&properties, candidate.optional_extensions.len());
            if rating > best_rating {
                best_rating = rating;
                chosen = Some(candidate);
            }
        }
    }

    chosen.ok_or(VulkanError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(
        device_type: vk::PhysicalDeviceType,
        msaa: vk::SampleCountFlags,
    ) -> vk::PhysicalDeviceProperties {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.device_type = device_type;
        properties.limits.framebuffer_color_sample_counts = msaa;
        properties
    }

    #[test]
    fn discrete_with_higher_msaa_outrates_integrated() {
        // Two otherwise equal candidates: discrete MSAA x8 vs integrated x2
        let discrete = properties(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::SampleCountFlags::TYPE_8
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_2,
        );
        let integrated = properties(
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::SampleCountFlags::TYPE_2,
        );
        assert!(device_rating(&discrete, 0) > device_rating(&integrated, 0));
    }

    #[test]
    fn optional_extensions_add_one_point_each() {
        let base = properties(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::SampleCountFlags::TYPE_4,
        );
        assert_eq!(device_rating(&base, 3), device_rating(&base, 0) + 3);
    }

    #[test]
    fn dimension_rating_tiers() {
        assert_eq!(dimension_rating(4096), 0);
        assert_eq!(dimension_rating(4097), 1);
        assert_eq!(dimension_rating(8193), 2);
        assert_eq!(dimension_rating(16385), 4);
        assert_eq!(dimension_rating(32769), 6);
        assert_eq!(dimension_rating(65537), 8);
    }

    #[test]
    fn sample_count_rating_prefers_highest_supported() {
        assert_eq!(sample_count_rating(vk::SampleCountFlags::TYPE_64), 8);
        assert_eq!(
            sample_count_rating(
                vk::SampleCountFlags::TYPE_8 | vk::SampleCountFlags::TYPE_2
            ),
            5
        );
        assert_eq!(sample_count_rating(vk::SampleCountFlags::TYPE_1), 0);
    }

    #[test]
    fn queue_family_completeness_respects_present_requirement() {
        let indices = QueueFamilyIndices {
            graphics: Some(0),
            compute: Some(0),
            present: None,
        };
        assert!(indices.complete(false));
        assert!(!indices.complete(true));
    }
}
