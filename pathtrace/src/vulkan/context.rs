use crate::backend::RayTracingProperties;
use crate::error::{Error, Result};
use spark::{vk, Builder, Device, DeviceExtensions, Instance, InstanceExtensions, Loader};
use std::ffi::CStr;
use std::os::raw::c_void;
use std::slice;
use tracing::{debug, error, info, warn};

unsafe extern "system" fn debug_messenger(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    if let Some(data) = p_callback_data.as_ref() {
        let message = CStr::from_ptr(data.p_message).to_string_lossy();
        if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            error!(types = %message_types, "{}", message);
        } else {
            warn!(types = %message_types, "{}", message);
        }
    }
    vk::FALSE
}

pub trait DeviceExt {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    unsafe fn create_pipeline_layout_from_ref(
        &self,
        descriptor_set_layout: &vk::DescriptorSetLayout,
    ) -> spark::Result<vk::PipelineLayout>;
}

impl DeviceExt for Device {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo {
            buffer: Some(buffer),
            ..Default::default()
        };
        self.get_buffer_device_address(&info)
    }

    unsafe fn create_pipeline_layout_from_ref(
        &self,
        descriptor_set_layout: &vk::DescriptorSetLayout,
    ) -> spark::Result<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::builder().p_set_layouts(slice::from_ref(descriptor_set_layout));
        self.create_pipeline_layout(&create_info, None)
    }
}

trait PhysicalDeviceMemoryPropertiesExt {
    fn types(&self) -> &[vk::MemoryType];
}

impl PhysicalDeviceMemoryPropertiesExt for vk::PhysicalDeviceMemoryProperties {
    fn types(&self) -> &[vk::MemoryType] {
        &self.memory_types[..self.memory_type_count as usize]
    }
}

/// Parses a core version such as `1.2` for use on the command line.
pub fn try_version_from_str(s: &str) -> std::result::Result<vk::Version, String> {
    let mut parts = s.split('.').map(|part| part.parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), None) => Ok(vk::Version::from_raw_parts(major, minor, 0)),
        (Some(Ok(major)), None, None) => Ok(vk::Version::from_raw_parts(major, 0, 0)),
        _ => Err(format!("expected a version like 1.2, got {:?}", s)),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    pub version: vk::Version,
    pub is_debug: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            version: vk::Version::from_raw_parts(1, 2, 0),
            is_debug: false,
        }
    }
}

/// A headless device with the ray tracing pipeline extensions enabled.
pub struct Context {
    pub instance: Instance,
    pub debug_utils_messenger: Option<vk::DebugUtilsMessengerEXT>,
    pub physical_device: vk::PhysicalDevice,
    pub physical_device_properties: vk::PhysicalDeviceProperties,
    pub physical_device_memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub ray_tracing_pipeline_properties: RayTracingProperties,
    pub supports_host_commands: bool,
    pub queue_family_index: u32,
    pub queue: vk::Queue,
    pub device: Device,
}

impl Context {
    pub fn new(params: &ContextParams) -> Result<Self> {
        let instance = {
            let loader = Loader::new().map_err(|err| Error::backend("Loader::new", format!("{:?}", err)))?;
            let instance_version = unsafe { loader.enumerate_instance_version() }
                .map_err(|err| Error::backend("vkEnumerateInstanceVersion", err))?;
            info!(
                "loading instance version {} ({} supported)",
                params.version, instance_version
            );
            if instance_version < params.version {
                return Err(Error::backend(
                    "vkCreateInstance",
                    format!(
                        "requested instance version {} is greater than the available version {}",
                        params.version, instance_version
                    ),
                ));
            }

            let mut extensions = InstanceExtensions::new(params.version);
            if params.is_debug {
                extensions.enable_ext_debug_utils();
            }
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                debug!("loading instance extension {:?}", name);
            }

            let app_info = vk::ApplicationInfo::builder()
                .p_application_name(Some(CStr::from_bytes_with_nul(b"pathtrace\0").unwrap()))
                .api_version(params.version);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let instance_create_info = vk::InstanceCreateInfo::builder()
                .p_application_info(Some(&app_info))
                .pp_enabled_extension_names(&extension_name_ptrs);
            unsafe { loader.create_instance(&instance_create_info, None) }
                .map_err(|err| Error::backend("vkCreateInstance", err))?
        };

        let debug_utils_messenger = if params.is_debug {
            let create_info = vk::DebugUtilsMessengerCreateInfoEXT {
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_messenger),
                ..Default::default()
            };
            Some(
                unsafe { instance.create_debug_utils_messenger_ext(&create_info, None) }
                    .map_err(|err| Error::backend("vkCreateDebugUtilsMessengerEXT", err))?,
            )
        } else {
            None
        };

        let supports_ray_tracing = |physical_device: vk::PhysicalDevice| -> bool {
            unsafe { instance.enumerate_device_extension_properties_to_vec(physical_device, None) }
                .map(|extension_properties| {
                    let available = DeviceExtensions::from_properties(params.version, &extension_properties);
                    available.supports_khr_acceleration_structure() && available.supports_khr_ray_tracing_pipeline()
                })
                .unwrap_or(false)
        };

        let physical_device = {
            let physical_devices = unsafe { instance.enumerate_physical_devices_to_vec() }
                .map_err(|err| Error::backend("vkEnumeratePhysicalDevices", err))?;
            for physical_device in &physical_devices {
                let props = unsafe { instance.get_physical_device_properties(*physical_device) };
                info!("physical device ({}): {:?}", props.device_type, unsafe {
                    CStr::from_ptr(props.device_name.as_ptr())
                });
            }
            physical_devices
                .iter()
                .copied()
                .find(|&physical_device| supports_ray_tracing(physical_device))
                .ok_or_else(|| {
                    Error::backend(
                        "vkEnumeratePhysicalDevices",
                        "no physical device supports ray tracing pipelines",
                    )
                })?
        };
        let physical_device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_version = physical_device_properties.api_version;

        let ray_tracing_pipeline_properties = {
            let mut rtpp = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::builder().insert_next(&mut rtpp);
            unsafe { instance.get_physical_device_properties2(physical_device, properties2.as_mut()) };
            RayTracingProperties {
                shader_group_handle_size: rtpp.shader_group_handle_size,
                shader_group_handle_alignment: rtpp.shader_group_handle_alignment,
                shader_group_base_alignment: rtpp.shader_group_base_alignment,
            }
        };
        debug!(?ray_tracing_pipeline_properties, "ray tracing pipeline properties");

        let supports_host_commands = {
            let mut asf = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::builder().insert_next(&mut asf);
            unsafe { instance.get_physical_device_features2(physical_device, features2.as_mut()) };
            asf.acceleration_structure_host_commands.as_bool()
        };

        let physical_device_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        for (i, mt) in physical_device_memory_properties.types().iter().enumerate() {
            debug!("memory type {}: {}, heap {}", i, mt.property_flags, mt.heap_index);
        }

        let queue_family_index = {
            let queue_flags = vk::QueueFlags::COMPUTE;
            unsafe { instance.get_physical_device_queue_family_properties_to_vec(physical_device) }
                .iter()
                .position(|info| info.queue_flags.contains(queue_flags))
                .map(|index| index as u32)
                .ok_or_else(|| Error::backend("vkGetPhysicalDeviceQueueFamilyProperties", "no compute queue"))?
        };

        let device = {
            info!(
                "loading device version {} ({} supported)",
                params.version, device_version
            );
            if device_version < params.version {
                return Err(Error::backend(
                    "vkCreateDevice",
                    format!(
                        "requested device version {} is greater than the available version {}",
                        params.version, device_version
                    ),
                ));
            }

            let queue_priorities = [1.0];
            let device_queue_create_info = vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue_family_index)
                .p_queue_priorities(&queue_priorities);

            let enabled_features = vk::PhysicalDeviceFeatures {
                shader_sampled_image_array_dynamic_indexing: vk::TRUE,
                shader_int64: vk::TRUE,
                ..Default::default()
            };

            let mut extensions = DeviceExtensions::new(params.version);
            extensions.enable_khr_acceleration_structure();
            extensions.enable_khr_ray_tracing_pipeline();
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                debug!("loading device extension {:?}", name);
            }

            let mut buffer_device_address_features =
                vk::PhysicalDeviceBufferDeviceAddressFeaturesKHR::builder().buffer_device_address(true);
            let mut acceleration_structure_features =
                vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
            let mut ray_tracing_pipeline_features =
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let device_create_info = vk::DeviceCreateInfo::builder()
                .p_queue_create_infos(slice::from_ref(&device_queue_create_info))
                .pp_enabled_extension_names(&extension_name_ptrs)
                .p_enabled_features(Some(&enabled_features))
                .insert_next(&mut buffer_device_address_features)
                .insert_next(&mut acceleration_structure_features)
                .insert_next(&mut ray_tracing_pipeline_features);

            unsafe { instance.create_device(physical_device, &device_create_info, None, params.version) }
                .map_err(|err| Error::backend("vkCreateDevice", err))?
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        Ok(Self {
            instance,
            debug_utils_messenger,
            physical_device,
            physical_device_properties,
            physical_device_memory_properties,
            ray_tracing_pipeline_properties,
            supports_host_commands,
            queue_family_index,
            queue,
            device,
        })
    }

    pub fn get_memory_type_index(&self, type_filter: u32, property_flags: vk::MemoryPropertyFlags) -> Option<u32> {
        for (i, mt) in self.physical_device_memory_properties.types().iter().enumerate() {
            let i = i as u32;
            if (type_filter & (1 << i)) != 0 && mt.property_flags.contains(property_flags) {
                return Some(i);
            }
        }
        None
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            if self.debug_utils_messenger.is_some() {
                self.instance
                    .destroy_debug_utils_messenger_ext(self.debug_utils_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versions() {
        assert!(try_version_from_str("1.2") == Ok(vk::Version::from_raw_parts(1, 2, 0)));
        assert!(try_version_from_str("1") == Ok(vk::Version::from_raw_parts(1, 0, 0)));
        assert!(try_version_from_str("1.x").is_err());
        assert!(try_version_from_str("1.2.3").is_err());
    }
}
