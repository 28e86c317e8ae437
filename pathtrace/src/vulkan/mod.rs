//! Ray tracing on a Vulkan device through `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline`.
//!
//! Every buffer and image gets a dedicated allocation. Host-visible memory is
//! coherent and stays mapped for the lifetime of the buffer.

mod command_buffer;
mod context;

pub use self::context::{try_version_from_str, Context, ContextParams, DeviceExt};

use self::command_buffer::OneTimeCommandPool;
use crate::backend::*;
use crate::error::{Error, Result};
use crate::maths::UVec2;
use spark::{vk, Builder, Device};
use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{mem, ptr, slice};
use tracing::{debug, info, warn};

#[derive(Clone, Copy)]
pub struct VulkanBuffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    mapping: *mut u8,
    size: DeviceSize,
}

#[derive(Clone, Copy)]
pub struct VulkanImage {
    image: vk::Image,
    view: vk::ImageView,
    memory: vk::DeviceMemory,
}

/// A texture owned by the caller, bound into the texture array.
#[derive(Clone, Copy)]
pub struct VulkanSampledImage {
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

#[derive(Clone, Copy)]
pub struct VulkanBindingSet {
    layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

fn read_file_words(path: &Path) -> io::Result<Vec<u32>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.len() % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{:?} is not a whole number of SPIR-V words", path),
        ));
    }
    Ok(bytes
        .chunks(4)
        .map(|c| u32::from(c[3]) << 24 | u32::from(c[2]) << 16 | u32::from(c[1]) << 8 | u32::from(c[0]))
        .collect())
}

fn load_shader_module(device: &Device, path: &Path) -> Result<vk::ShaderModule> {
    let words = read_file_words(path)?;
    let shader_module_create_info = vk::ShaderModuleCreateInfo {
        code_size: words.len() * mem::size_of::<u32>(),
        p_code: words.as_ptr(),
        ..Default::default()
    };
    unsafe { device.create_shader_module(&shader_module_create_info, None) }
        .map_err(|err| Error::backend("vkCreateShaderModule", err))
}

fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::DEVICE_ADDRESS, vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS_KHR),
        (
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        ),
        (
            BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        ),
        (
            BufferUsage::SHADER_BINDING_TABLE,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        ),
    ]
    .iter()
    .filter(|(usage_bit, _)| usage.contains(*usage_bit))
    .fold(vk::BufferUsageFlags::empty(), |flags, (_, vk_flag)| flags | *vk_flag)
}

fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut vk_flags = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        vk_flags = vk_flags | vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANY_HIT_INVOCATION) {
        vk_flags = vk_flags | vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    vk_flags
}

fn acceleration_structure_type(level: AccelerationStructureLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelerationStructureLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn image_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
    }
}

fn descriptor_type(kind: BindingKind) -> (vk::DescriptorType, u32) {
    match kind {
        BindingKind::AccelerationStructure => (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1),
        BindingKind::StorageImage => (vk::DescriptorType::STORAGE_IMAGE, 1),
        BindingKind::UniformBuffer => (vk::DescriptorType::UNIFORM_BUFFER, 1),
        BindingKind::StorageBuffer => (vk::DescriptorType::STORAGE_BUFFER, 1),
        BindingKind::SampledImageArray { count } => (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count),
    }
}

fn geometry_khr(desc: &GeometryDesc) -> vk::AccelerationStructureGeometryKHR {
    match desc.data {
        GeometryData::Triangles(triangles) => {
            let geometry_triangles_data = vk::AccelerationStructureGeometryTrianglesDataKHR {
                vertex_format: vertex_format(triangles.vertex_format),
                vertex_data: vk::DeviceOrHostAddressConstKHR {
                    device_address: triangles.vertex_data,
                },
                vertex_stride: vk::DeviceSize::from(triangles.vertex_stride),
                max_vertex: triangles.max_vertex,
                index_type: vk::IndexType::UINT32,
                index_data: vk::DeviceOrHostAddressConstKHR {
                    device_address: triangles.index_data,
                },
                transform_data: vk::DeviceOrHostAddressConstKHR {
                    device_address: triangles.transform_data,
                },
                ..Default::default()
            };
            vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    triangles: geometry_triangles_data,
                },
                flags: geometry_flags(desc.flags),
                ..Default::default()
            }
        }
        GeometryData::Instances { instance_data } => {
            let geometry_instance_data = vk::AccelerationStructureGeometryInstancesDataKHR {
                data: vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_data,
                },
                ..Default::default()
            };
            vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::INSTANCES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    instances: geometry_instance_data,
                },
                flags: geometry_flags(desc.flags),
                ..Default::default()
            }
        }
    }
}

fn build_geometry_info(
    level: AccelerationStructureLevel,
    geometry: &vk::AccelerationStructureGeometryKHR,
    dst: Option<vk::AccelerationStructureKHR>,
    scratch_address: DeviceAddress,
) -> vk::AccelerationStructureBuildGeometryInfoKHR {
    vk::AccelerationStructureBuildGeometryInfoKHR {
        ty: acceleration_structure_type(level),
        flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        mode: vk::BuildAccelerationStructureModeKHR::BUILD,
        dst_acceleration_structure: dst,
        geometry_count: 1,
        p_geometries: geometry,
        scratch_data: vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        },
        ..Default::default()
    }
}

fn strided_region(region: &StridedRegion) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR {
        device_address: region.device_address,
        stride: region.stride,
        size: region.size,
    }
}

fn memory_error(call: &'static str, what: &'static str, size: DeviceSize, err: vk::Result) -> Error {
    match err {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            Error::Allocation { what, size }
        }
        err => Error::backend(call, err),
    }
}

enum DescriptorInfo {
    Images { first: usize, count: u32 },
    Buffer(usize),
    AccelerationStructure(usize),
}

/// Path tracing on a real device. Acceleration structures are always built on the device.
pub struct VulkanBackend {
    commands: OneTimeCommandPool,
    context: Arc<Context>,
}

impl VulkanBackend {
    pub fn new(params: &ContextParams) -> Result<Self> {
        let context = Arc::new(Context::new(params)?);
        let commands = OneTimeCommandPool::new(&context)?;
        if context.supports_host_commands {
            info!("device supports host acceleration structure commands, scene geometry is device-local so builds stay on the device");
        }
        Ok(Self { commands, context })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    fn allocate_memory(
        &self,
        what: &'static str,
        mem_req: &vk::MemoryRequirements,
        property_flags: vk::MemoryPropertyFlags,
        device_address: bool,
    ) -> Result<vk::DeviceMemory> {
        let memory_type_index = self
            .context
            .get_memory_type_index(mem_req.memory_type_bits, property_flags)
            .ok_or(Error::Allocation {
                what,
                size: mem_req.size,
            })?;

        let mut memory_allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_req.size)
            .memory_type_index(memory_type_index);
        let mut flags_info = vk::MemoryAllocateFlagsInfo {
            flags: vk::MemoryAllocateFlagsKHR::DEVICE_ADDRESS_KHR,
            ..Default::default()
        };
        if device_address {
            memory_allocate_info = memory_allocate_info.insert_next(&mut flags_info);
        }

        unsafe { self.context.device.allocate_memory(&memory_allocate_info, None) }
            .map_err(|err| memory_error("vkAllocateMemory", what, mem_req.size, err))
    }

    fn transition_to_general(&self, image: vk::Image) -> Result<()> {
        let cmd = self.commands.begin()?;
        let image_memory_barrier = vk::ImageMemoryBarrier {
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::GENERAL,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: Some(image),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe {
            self.context.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                slice::from_ref(&image_memory_barrier),
            )
        };
        self.commands.submit_and_wait(cmd)
    }

    fn create_binding_set_inner(
        &self,
        layout: vk::DescriptorSetLayout,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<VulkanBindingSet> {
        let device = &self.context.device;

        let pool = {
            let descriptor_pool_create_info = vk::DescriptorPoolCreateInfo::builder()
                .max_sets(1)
                .p_pool_sizes(pool_sizes);
            unsafe { device.create_descriptor_pool(&descriptor_pool_create_info, None) }
                .map_err(|err| Error::backend("vkCreateDescriptorPool", err))?
        };

        let set = {
            let descriptor_set_allocate_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .p_set_layouts(slice::from_ref(&layout));
            unsafe { device.allocate_descriptor_sets_single(&descriptor_set_allocate_info) }
        };
        let set = match set {
            Ok(set) => set,
            Err(err) => {
                unsafe { device.destroy_descriptor_pool(Some(pool), None) };
                return Err(Error::backend("vkAllocateDescriptorSets", err));
            }
        };

        match unsafe { device.create_pipeline_layout_from_ref(&layout) } {
            Ok(pipeline_layout) => Ok(VulkanBindingSet {
                layout,
                pipeline_layout,
                pool,
                set,
            }),
            Err(err) => {
                unsafe { device.destroy_descriptor_pool(Some(pool), None) };
                Err(Error::backend("vkCreatePipelineLayout", err))
            }
        }
    }

    fn create_ray_tracing_pipeline_inner(
        &self,
        binding_set: VulkanBindingSet,
        groups: &[ShaderGroupDesc],
        max_recursion_depth: u32,
        modules: &mut Vec<(PathBuf, vk::ShaderModule)>,
    ) -> Result<vk::Pipeline> {
        let device = &self.context.device;
        let shader_entry_name = CStr::from_bytes_with_nul(b"main\0").unwrap();

        let mut shader_stage_create_info = Vec::new();
        let mut get_stage_index = |stage: vk::ShaderStageFlags, path: &PathBuf| -> Result<u32> {
            let module = match modules.iter().find(|(p, _)| p == path) {
                Some((_, module)) => *module,
                None => {
                    let module = load_shader_module(device, path)?;
                    modules.push((path.clone(), module));
                    module
                }
            };
            if let Some(i) = shader_stage_create_info
                .iter()
                .position(|info: &vk::PipelineShaderStageCreateInfo| info.stage == stage && info.module == Some(module))
            {
                return Ok(i as u32);
            }
            shader_stage_create_info.push(vk::PipelineShaderStageCreateInfo {
                stage,
                module: Some(module),
                p_name: shader_entry_name.as_ptr(),
                ..Default::default()
            });
            Ok((shader_stage_create_info.len() - 1) as u32)
        };

        let shader_group_create_info = groups
            .iter()
            .map(|group| {
                Ok(match group {
                    ShaderGroupDesc::Raygen(raygen) => vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                        general_shader: get_stage_index(vk::ShaderStageFlags::RAYGEN_KHR, raygen)?,
                        closest_hit_shader: vk::SHADER_UNUSED_KHR,
                        any_hit_shader: vk::SHADER_UNUSED_KHR,
                        intersection_shader: vk::SHADER_UNUSED_KHR,
                        ..Default::default()
                    },
                    ShaderGroupDesc::Miss(miss) => vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                        general_shader: get_stage_index(vk::ShaderStageFlags::MISS_KHR, miss)?,
                        closest_hit_shader: vk::SHADER_UNUSED_KHR,
                        any_hit_shader: vk::SHADER_UNUSED_KHR,
                        intersection_shader: vk::SHADER_UNUSED_KHR,
                        ..Default::default()
                    },
                    ShaderGroupDesc::TrianglesHit { closest_hit, any_hit } => vk::RayTracingShaderGroupCreateInfoKHR {
                        ty: vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                        general_shader: vk::SHADER_UNUSED_KHR,
                        closest_hit_shader: get_stage_index(vk::ShaderStageFlags::CLOSEST_HIT_KHR, closest_hit)?,
                        any_hit_shader: match any_hit {
                            Some(path) => get_stage_index(vk::ShaderStageFlags::ANY_HIT_KHR, path)?,
                            None => vk::SHADER_UNUSED_KHR,
                        },
                        intersection_shader: vk::SHADER_UNUSED_KHR,
                        ..Default::default()
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let pipeline_create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .p_stages(&shader_stage_create_info)
            .p_groups(&shader_group_create_info)
            .layout(binding_set.pipeline_layout)
            .max_pipeline_ray_recursion_depth(max_recursion_depth);

        unsafe { device.create_ray_tracing_pipelines_khr_single(None, None, &pipeline_create_info, None) }
            .map_err(|err| Error::backend("vkCreateRayTracingPipelinesKHR", err))
    }
}

impl Backend for VulkanBackend {
    type Buffer = VulkanBuffer;
    type AccelerationStructure = vk::AccelerationStructureKHR;
    type Image = VulkanImage;
    type SampledImage = VulkanSampledImage;
    type BindingSet = VulkanBindingSet;
    type Pipeline = vk::Pipeline;
    type CommandBuffer = vk::CommandBuffer;

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.context.ray_tracing_pipeline_properties
    }

    fn supports_host_builds(&self) -> bool {
        false
    }

    fn create_buffer(&self, size: DeviceSize, usage: BufferUsage, location: MemoryLocation) -> Result<VulkanBuffer> {
        let device = &self.context.device;

        let buffer_create_info = vk::BufferCreateInfo {
            size,
            usage: buffer_usage_flags(usage),
            ..Default::default()
        };
        let buffer = unsafe { device.create_buffer(&buffer_create_info, None) }
            .map_err(|err| memory_error("vkCreateBuffer", "buffer", size, err))?;

        let property_flags = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        };
        let mem_req = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match self.allocate_memory(
            "buffer",
            &mem_req,
            property_flags,
            usage.contains(BufferUsage::DEVICE_ADDRESS),
        ) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(Some(buffer), None) };
                return Err(err);
            }
        };

        let bind_and_map = || -> Result<*mut u8> {
            unsafe { device.bind_buffer_memory(buffer, memory, 0) }
                .map_err(|err| Error::backend("vkBindBufferMemory", err))?;
            match location {
                MemoryLocation::DeviceLocal => Ok(ptr::null_mut()),
                MemoryLocation::HostVisible => {
                    let mapping = unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, Default::default()) }
                        .map_err(|err| Error::backend("vkMapMemory", err))?;
                    Ok(mapping as *mut _)
                }
            }
        };
        match bind_and_map() {
            Ok(mapping) => Ok(VulkanBuffer {
                buffer,
                memory,
                mapping,
                size,
            }),
            Err(err) => {
                unsafe {
                    device.destroy_buffer(Some(buffer), None);
                    device.free_memory(Some(memory), None);
                }
                Err(err)
            }
        }
    }

    fn buffer_device_address(&self, buffer: VulkanBuffer) -> DeviceAddress {
        unsafe { self.context.device.get_buffer_device_address_helper(buffer.buffer) }
    }

    fn write_buffer(&self, buffer: VulkanBuffer, offset: DeviceSize, data: &[u8]) -> Result<()> {
        if buffer.mapping.is_null() {
            return Err(Error::backend("write_buffer", "buffer is not host visible"));
        }
        let end = offset + data.len() as DeviceSize;
        if end > buffer.size {
            return Err(Error::backend(
                "write_buffer",
                format!("write of {} bytes at {} overruns a {} byte buffer", data.len(), offset, buffer.size),
            ));
        }
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), buffer.mapping.add(offset as usize), data.len()) };
        Ok(())
    }

    fn destroy_buffer(&self, buffer: VulkanBuffer) {
        let device = &self.context.device;
        unsafe {
            if !buffer.mapping.is_null() {
                device.unmap_memory(buffer.memory);
            }
            device.destroy_buffer(Some(buffer.buffer), None);
            device.free_memory(Some(buffer.memory), None);
        }
    }

    fn create_storage_image(&self, format: ImageFormat, size: UVec2) -> Result<VulkanImage> {
        let device = &self.context.device;
        let format = image_format(format);

        let image_create_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::N2D,
            format,
            extent: vk::Extent3D {
                width: size.x.max(1),
                height: size.y.max(1),
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::N1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { device.create_image(&image_create_info, None) }
            .map_err(|err| memory_error("vkCreateImage", "storage image", 0, err))?;

        let mem_req = unsafe { device.get_image_memory_requirements(image) };
        let memory = match self.allocate_memory(
            "storage image",
            &mem_req,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(Some(image), None) };
                return Err(err);
            }
        };

        let bind_and_view = || -> Result<vk::ImageView> {
            unsafe { device.bind_image_memory(image, memory, 0) }
                .map_err(|err| Error::backend("vkBindImageMemory", err))?;
            let image_view_create_info = vk::ImageViewCreateInfo {
                image: Some(image),
                view_type: vk::ImageViewType::N2D,
                format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            unsafe { device.create_image_view(&image_view_create_info, None) }
                .map_err(|err| Error::backend("vkCreateImageView", err))
        };
        let view = match bind_and_view() {
            Ok(view) => view,
            Err(err) => {
                unsafe {
                    device.destroy_image(Some(image), None);
                    device.free_memory(Some(memory), None);
                }
                return Err(err);
            }
        };

        let created = VulkanImage { image, view, memory };
        if let Err(err) = self.transition_to_general(image) {
            self.destroy_image(created);
            return Err(err);
        }
        Ok(created)
    }

    fn destroy_image(&self, image: VulkanImage) {
        let device = &self.context.device;
        unsafe {
            device.destroy_image_view(Some(image.view), None);
            device.destroy_image(Some(image.image), None);
            device.free_memory(Some(image.memory), None);
        }
    }

    fn acceleration_structure_build_sizes(
        &self,
        geometry: &GeometryDesc,
        max_primitive_count: u32,
    ) -> Result<BuildSizes> {
        let geometry_vk = geometry_khr(geometry);
        let build_info = build_geometry_info(geometry.level(), &geometry_vk, None, 0);
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.context.device.get_acceleration_structure_build_sizes_khr(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                Some(slice::from_ref(&max_primitive_count)),
                &mut sizes,
            )
        };
        Ok(BuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        level: AccelerationStructureLevel,
        buffer: VulkanBuffer,
        size: DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR {
            buffer: Some(buffer.buffer),
            size,
            ty: acceleration_structure_type(level),
            ..Default::default()
        };
        unsafe { self.context.device.create_acceleration_structure_khr(&create_info, None) }
            .map_err(|err| Error::backend("vkCreateAccelerationStructureKHR", err))
    }

    fn acceleration_structure_device_address(&self, accel: vk::AccelerationStructureKHR) -> DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR {
            acceleration_structure: Some(accel),
            ..Default::default()
        };
        unsafe { self.context.device.get_acceleration_structure_device_address_khr(&info) }
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        unsafe {
            self.context
                .device
                .destroy_acceleration_structure_khr(Some(accel), None)
        };
    }

    fn build_acceleration_structure_on_host(&self, _desc: &BuildDesc<vk::AccelerationStructureKHR>) -> Result<()> {
        warn!("host build requested on a device that only builds from device memory");
        Err(Error::backend(
            "vkBuildAccelerationStructuresKHR",
            "host builds need host-addressable geometry",
        ))
    }

    fn begin_commands(&self) -> Result<vk::CommandBuffer> {
        self.commands.begin()
    }

    fn cmd_build_acceleration_structure(
        &self,
        cmd: &mut vk::CommandBuffer,
        desc: &BuildDesc<vk::AccelerationStructureKHR>,
    ) {
        let device = &self.context.device;
        let geometry = geometry_khr(desc.geometry);
        let build_info = build_geometry_info(desc.geometry.level(), &geometry, Some(desc.dst), desc.scratch_address);
        let build_range_info = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: desc.primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };
        let memory_barrier = vk::MemoryBarrier {
            src_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            dst_access_mask: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            ..Default::default()
        };
        unsafe {
            device.cmd_build_acceleration_structures_khr(*cmd, slice::from_ref(&build_info), &[&build_range_info]);
            device.cmd_pipeline_barrier(
                *cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                slice::from_ref(&memory_barrier),
                &[],
                &[],
            );
        }
    }

    fn cmd_copy_buffer(&self, cmd: &mut vk::CommandBuffer, src: VulkanBuffer, dst: VulkanBuffer, size: DeviceSize) {
        let device = &self.context.device;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        let memory_barrier = vk::MemoryBarrier {
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::MEMORY_READ,
            ..Default::default()
        };
        unsafe {
            device.cmd_copy_buffer(*cmd, src.buffer, dst.buffer, slice::from_ref(&region));
            device.cmd_pipeline_barrier(
                *cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                slice::from_ref(&memory_barrier),
                &[],
                &[],
            );
        }
    }

    fn cmd_trace_rays(
        &self,
        cmd: &mut vk::CommandBuffer,
        pipeline: vk::Pipeline,
        binding_set: VulkanBindingSet,
        regions: &TraceRegions,
        size: UVec2,
    ) {
        let device = &self.context.device;
        unsafe {
            device.cmd_bind_pipeline(*cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline);
            device.cmd_bind_descriptor_sets(
                *cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                binding_set.pipeline_layout,
                0,
                slice::from_ref(&binding_set.set),
                &[],
            );
            device.cmd_trace_rays_khr(
                *cmd,
                &strided_region(&regions.raygen),
                &strided_region(&regions.miss),
                &strided_region(&regions.hit),
                &strided_region(&regions.callable),
                size.x,
                size.y,
                1,
            );
        }
    }

    fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.commands.submit_and_wait(cmd)
    }

    fn create_binding_set(&self, layout: &[BindingKind]) -> Result<VulkanBindingSet> {
        let device = &self.context.device;

        let bindings_vk: Vec<_> = layout
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let (descriptor_type, descriptor_count) = descriptor_type(*kind);
                vk::DescriptorSetLayoutBinding {
                    binding: i as u32,
                    descriptor_type,
                    descriptor_count,
                    stage_flags: vk::ShaderStageFlags::ALL,
                    ..Default::default()
                }
            })
            .collect();
        let pool_sizes: Vec<_> = bindings_vk
            .iter()
            .map(|binding| vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: binding.descriptor_count,
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().p_bindings(&bindings_vk);
        let descriptor_set_layout = unsafe { device.create_descriptor_set_layout(&create_info, None) }
            .map_err(|err| Error::backend("vkCreateDescriptorSetLayout", err))?;

        self.create_binding_set_inner(descriptor_set_layout, &pool_sizes)
            .map_err(|err| {
                unsafe { device.destroy_descriptor_set_layout(Some(descriptor_set_layout), None) };
                err
            })
    }

    fn update_binding_set(&self, binding_set: VulkanBindingSet, writes: &[BindingWrite<Self>]) {
        let mut image_info = Vec::new();
        let mut buffer_info = Vec::new();
        let mut accels = Vec::new();

        let infos: Vec<_> = writes
            .iter()
            .map(|write| {
                let info = match &write.data {
                    BindingData::AccelerationStructure(accel) => {
                        accels.push(*accel);
                        DescriptorInfo::AccelerationStructure(accels.len() - 1)
                    }
                    BindingData::StorageImage(image) => {
                        image_info.push(vk::DescriptorImageInfo {
                            sampler: None,
                            image_view: Some(image.view),
                            image_layout: vk::ImageLayout::GENERAL,
                        });
                        DescriptorInfo::Images {
                            first: image_info.len() - 1,
                            count: 1,
                        }
                    }
                    BindingData::UniformBuffer(buffer) | BindingData::StorageBuffer(buffer) => {
                        buffer_info.push(vk::DescriptorBufferInfo {
                            buffer: Some(buffer.buffer),
                            offset: 0,
                            range: vk::WHOLE_SIZE,
                        });
                        DescriptorInfo::Buffer(buffer_info.len() - 1)
                    }
                    BindingData::SampledImages(textures) => {
                        let first = image_info.len();
                        image_info.extend(textures.iter().map(|texture| vk::DescriptorImageInfo {
                            sampler: Some(texture.sampler),
                            image_view: Some(texture.view),
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        }));
                        DescriptorInfo::Images {
                            first,
                            count: textures.len() as u32,
                        }
                    }
                };
                let descriptor_type = match &write.data {
                    BindingData::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    BindingData::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
                    BindingData::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
                    BindingData::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
                    BindingData::SampledImages(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                };
                (write.binding, descriptor_type, info)
            })
            .collect();

        let acceleration_structure_writes: Vec<_> = accels
            .iter()
            .map(|accel| vk::WriteDescriptorSetAccelerationStructureKHR {
                acceleration_structure_count: 1,
                p_acceleration_structures: accel,
                ..Default::default()
            })
            .collect();

        let writes_vk: Vec<_> = infos
            .iter()
            .map(|(binding, descriptor_type, info)| {
                let mut write = vk::WriteDescriptorSet {
                    dst_set: Some(binding_set.set),
                    dst_binding: *binding,
                    descriptor_count: 1,
                    descriptor_type: *descriptor_type,
                    ..Default::default()
                };
                match *info {
                    DescriptorInfo::Images { first, count } => {
                        write.descriptor_count = count;
                        write.p_image_info = image_info[first..].as_ptr();
                    }
                    DescriptorInfo::Buffer(index) => write.p_buffer_info = &buffer_info[index],
                    DescriptorInfo::AccelerationStructure(index) => {
                        write.p_next = &acceleration_structure_writes[index] as *const _ as *const _;
                    }
                }
                write
            })
            .collect();

        debug!(write_count = writes_vk.len(), "updating descriptor set");
        unsafe { self.context.device.update_descriptor_sets(&writes_vk, &[]) };
    }

    fn destroy_binding_set(&self, binding_set: VulkanBindingSet) {
        let device = &self.context.device;
        unsafe {
            device.destroy_pipeline_layout(Some(binding_set.pipeline_layout), None);
            device.destroy_descriptor_pool(Some(binding_set.pool), None);
            device.destroy_descriptor_set_layout(Some(binding_set.layout), None);
        }
    }

    fn create_ray_tracing_pipeline(
        &self,
        binding_set: VulkanBindingSet,
        groups: &[ShaderGroupDesc],
        max_recursion_depth: u32,
    ) -> Result<vk::Pipeline> {
        let mut modules = Vec::new();
        let result = self.create_ray_tracing_pipeline_inner(binding_set, groups, max_recursion_depth, &mut modules);
        for (_, module) in modules {
            unsafe { self.context.device.destroy_shader_module(Some(module), None) };
        }
        result
    }

    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> Result<Vec<u8>> {
        let handle_size = self.context.ray_tracing_pipeline_properties.shader_group_handle_size as usize;
        let mut handle_data = vec![0u8; (group_count as usize) * handle_size];
        unsafe {
            self.context
                .device
                .get_ray_tracing_shader_group_handles_khr(pipeline, 0, group_count, &mut handle_data)
        }
        .map_err(|err| Error::backend("vkGetRayTracingShaderGroupHandlesKHR", err))?;
        Ok(handle_data)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.context.device.destroy_pipeline(Some(pipeline), None) };
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.context.device.device_wait_idle() } {
            warn!(%err, "failed to wait for the device to go idle");
        }
    }
}
