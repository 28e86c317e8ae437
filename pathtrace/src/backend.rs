use crate::error::Result;
use crate::maths::UVec2;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

pub type DeviceAddress = u64;
pub type DeviceSize = u64;

macro_rules! flags_impl {
    ($flags:ident { $($name:ident = $bit:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $flags(u32);

        impl $flags {
            $(pub const $name: $flags = $flags(1 << $bit);)+

            pub fn empty() -> Self {
                Self(0)
            }

            pub fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }
        }

        impl BitOr for $flags {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $flags {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

flags_impl!(BufferUsage {
    TRANSFER_SRC = 0,
    TRANSFER_DST = 1,
    UNIFORM = 2,
    STORAGE = 3,
    DEVICE_ADDRESS = 4,
    ACCELERATION_STRUCTURE_STORAGE = 5,
    ACCELERATION_STRUCTURE_BUILD_INPUT = 6,
    SHADER_BINDING_TABLE = 7,
});

flags_impl!(GeometryFlags {
    OPAQUE = 0,
    NO_DUPLICATE_ANY_HIT_INVOCATION = 1,
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Only reachable from the GPU, filled by copies or builds.
    DeviceLocal,
    /// Persistently mapped and writable from the host.
    HostVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureLevel {
    Bottom,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_format: VertexFormat,
    pub vertex_data: DeviceAddress,
    pub vertex_stride: u32,
    pub max_vertex: u32,
    pub index_data: DeviceAddress,
    pub transform_data: DeviceAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryData {
    Triangles(TriangleGeometry),
    Instances { instance_data: DeviceAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDesc {
    pub data: GeometryData,
    pub flags: GeometryFlags,
}

impl GeometryDesc {
    pub fn level(&self) -> AccelerationStructureLevel {
        match self.data {
            GeometryData::Triangles(_) => AccelerationStructureLevel::Bottom,
            GeometryData::Instances { .. } => AccelerationStructureLevel::Top,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: DeviceSize,
    pub build_scratch_size: DeviceSize,
}

/// A single build of one acceleration structure from one geometry.
#[derive(Debug, Clone, Copy)]
pub struct BuildDesc<'a, A> {
    pub geometry: &'a GeometryDesc,
    pub primitive_count: u32,
    pub dst: A,
    pub scratch_address: DeviceAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Rgba8Unorm,
    Rgba32Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    AccelerationStructure,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    SampledImageArray { count: u32 },
}

pub enum BindingData<'a, B: Backend> {
    AccelerationStructure(B::AccelerationStructure),
    StorageImage(B::Image),
    UniformBuffer(B::Buffer),
    StorageBuffer(B::Buffer),
    SampledImages(&'a [B::SampledImage]),
}

pub struct BindingWrite<'a, B: Backend> {
    pub binding: u32,
    pub data: BindingData<'a, B>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderGroupDesc {
    Raygen(PathBuf),
    Miss(PathBuf),
    TrianglesHit {
        closest_hit: PathBuf,
        any_hit: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StridedRegion {
    pub device_address: DeviceAddress,
    pub stride: DeviceSize,
    pub size: DeviceSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceRegions {
    pub raygen: StridedRegion,
    pub miss: StridedRegion,
    pub hit: StridedRegion,
    pub callable: StridedRegion,
}

/// The GPU ray tracing device consumed by scene preparation and the frame loop.
///
/// Handles are plain copyable values; ownership and destruction order are
/// managed by the wrappers in this crate, which always destroy what they create.
pub trait Backend: Sized {
    type Buffer: Copy;
    type AccelerationStructure: Copy;
    type Image: Copy;
    type SampledImage: Copy;
    type BindingSet: Copy;
    type Pipeline: Copy;
    type CommandBuffer;

    fn ray_tracing_properties(&self) -> RayTracingProperties;

    /// Whether acceleration structures can be built by the host without a command stream.
    fn supports_host_builds(&self) -> bool;

    fn create_buffer(&self, size: DeviceSize, usage: BufferUsage, location: MemoryLocation) -> Result<Self::Buffer>;
    fn buffer_device_address(&self, buffer: Self::Buffer) -> DeviceAddress;
    /// Writes into a `HostVisible` buffer.
    fn write_buffer(&self, buffer: Self::Buffer, offset: DeviceSize, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: Self::Buffer);

    fn create_storage_image(&self, format: ImageFormat, size: UVec2) -> Result<Self::Image>;
    fn destroy_image(&self, image: Self::Image);

    fn acceleration_structure_build_sizes(
        &self,
        geometry: &GeometryDesc,
        max_primitive_count: u32,
    ) -> Result<BuildSizes>;
    fn create_acceleration_structure(
        &self,
        level: AccelerationStructureLevel,
        buffer: Self::Buffer,
        size: DeviceSize,
    ) -> Result<Self::AccelerationStructure>;
    fn acceleration_structure_device_address(&self, accel: Self::AccelerationStructure) -> DeviceAddress;
    fn destroy_acceleration_structure(&self, accel: Self::AccelerationStructure);
    fn build_acceleration_structure_on_host(&self, desc: &BuildDesc<Self::AccelerationStructure>) -> Result<()>;

    fn begin_commands(&self) -> Result<Self::CommandBuffer>;
    fn cmd_build_acceleration_structure(
        &self,
        cmd: &mut Self::CommandBuffer,
        desc: &BuildDesc<Self::AccelerationStructure>,
    );
    fn cmd_copy_buffer(&self, cmd: &mut Self::CommandBuffer, src: Self::Buffer, dst: Self::Buffer, size: DeviceSize);
    fn cmd_trace_rays(
        &self,
        cmd: &mut Self::CommandBuffer,
        pipeline: Self::Pipeline,
        binding_set: Self::BindingSet,
        regions: &TraceRegions,
        size: UVec2,
    );
    /// Submits the commands and blocks until the device has retired them.
    fn submit_and_wait(&self, cmd: Self::CommandBuffer) -> Result<()>;

    fn create_binding_set(&self, layout: &[BindingKind]) -> Result<Self::BindingSet>;
    /// Applies all writes as one update.
    fn update_binding_set(&self, binding_set: Self::BindingSet, writes: &[BindingWrite<Self>]);
    fn destroy_binding_set(&self, binding_set: Self::BindingSet);

    fn create_ray_tracing_pipeline(
        &self,
        binding_set: Self::BindingSet,
        groups: &[ShaderGroupDesc],
        max_recursion_depth: u32,
    ) -> Result<Self::Pipeline>;
    /// Returns `group_count` handles packed at `shader_group_handle_size` intervals.
    fn shader_group_handles(&self, pipeline: Self::Pipeline, group_count: u32) -> Result<Vec<u8>>;
    fn destroy_pipeline(&self, pipeline: Self::Pipeline);
}
