use crate::backend::*;
use crate::buffer::DeviceBuffer;
use crate::error::{Error, Result};
use crate::maths::Transform3x4;
use crate::scratch::ScratchBuffer;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;
use strum::{EnumString, EnumVariantNames};
use tracing::{debug, info, instrument, warn};

/// Which build strategy the caller would like, resolved once against device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, EnumVariantNames)]
#[strum(serialize_all = "kebab_case")]
pub enum BuildPreference {
    Auto,
    Host,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Built synchronously by the host, scratch can be freed as soon as the call returns.
    Host,
    /// Recorded into a command stream, scratch is freed once the stream has retired.
    Device,
}

impl BuildMode {
    pub fn select<B: Backend>(backend: &B, preference: BuildPreference) -> Self {
        let host_supported = backend.supports_host_builds();
        let mode = match preference {
            BuildPreference::Auto | BuildPreference::Host if host_supported => BuildMode::Host,
            BuildPreference::Host => {
                warn!("host acceleration structure builds not supported, using device builds");
                BuildMode::Device
            }
            BuildPreference::Auto | BuildPreference::Device => BuildMode::Device,
        };
        info!(?mode, host_supported, "selected acceleration structure build mode");
        mode
    }

    /// Returns once the build has completed.
    fn execute<B: Backend>(self, backend: &B, desc: &BuildDesc<B::AccelerationStructure>) -> Result<()> {
        match self {
            BuildMode::Host => backend.build_acceleration_structure_on_host(desc),
            BuildMode::Device => {
                let mut cmd = backend.begin_commands()?;
                backend.cmd_build_acceleration_structure(&mut cmd, desc);
                backend.submit_and_wait(cmd)
            }
        }
    }
}

/// A built acceleration structure together with its backing storage.
///
/// Only constructed after its build has completed, so the device address is
/// always safe to reference from another build or from shaders.
pub struct AccelerationStructure<B: Backend> {
    backend: Arc<B>,
    level: AccelerationStructureLevel,
    accel: B::AccelerationStructure,
    storage: DeviceBuffer<B>,
    device_address: DeviceAddress,
}

impl<B: Backend> AccelerationStructure<B> {
    fn build(
        backend: &Arc<B>,
        mode: BuildMode,
        geometry: &GeometryDesc,
        primitive_count: u32,
    ) -> Result<Self> {
        let level = geometry.level();
        let sizes = backend.acceleration_structure_build_sizes(geometry, primitive_count)?;
        debug!(
            ?level,
            primitive_count,
            acceleration_structure_size = sizes.acceleration_structure_size,
            build_scratch_size = sizes.build_scratch_size,
            "queried build sizes"
        );

        let storage = DeviceBuffer::new(
            backend,
            sizes.acceleration_structure_size,
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE | BufferUsage::DEVICE_ADDRESS,
            MemoryLocation::DeviceLocal,
        )?;
        let accel = backend.create_acceleration_structure(level, storage.buffer(), storage.size())?;
        let mut result = Self {
            backend: Arc::clone(backend),
            level,
            accel,
            storage,
            device_address: 0,
        };

        let scratch = ScratchBuffer::acquire(backend.as_ref(), sizes.build_scratch_size)?;
        mode.execute(
            backend.as_ref(),
            &BuildDesc {
                geometry,
                primitive_count,
                dst: accel,
                scratch_address: scratch.device_address(),
            },
        )?;
        drop(scratch);

        result.device_address = backend.acceleration_structure_device_address(accel);
        Ok(result)
    }

    pub fn level(&self) -> AccelerationStructureLevel {
        self.level
    }

    pub fn handle(&self) -> B::AccelerationStructure {
        self.accel
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.device_address
    }

    pub fn storage_size(&self) -> DeviceSize {
        self.storage.size()
    }
}

impl<B: Backend> Drop for AccelerationStructure<B> {
    fn drop(&mut self) {
        self.backend.destroy_acceleration_structure(self.accel);
    }
}

/// Triangle mesh whose vertex and index data already live in device buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mesh {
    /// Tightly packed `f32` positions at the start of each vertex.
    pub vertex_buffer: DeviceAddress,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    /// `u32` indices, three per triangle.
    pub index_buffer: DeviceAddress,
    pub index_count: u32,
    /// Baked into the bottom level build.
    pub transform: Transform3x4,
}

impl Mesh {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

pub struct BottomLevelBuilder<'a, B: Backend> {
    backend: &'a Arc<B>,
    mode: BuildMode,
}

impl<'a, B: Backend> BottomLevelBuilder<'a, B> {
    pub fn new(backend: &'a Arc<B>, mode: BuildMode) -> Self {
        Self { backend, mode }
    }

    #[instrument(skip_all, fields(triangle_count = mesh.triangle_count()))]
    pub fn build(&self, mesh: &Mesh) -> Result<AccelerationStructure<B>> {
        if mesh.index_count % 3 != 0 {
            warn!(
                index_count = mesh.index_count,
                "index count is not a multiple of 3, ignoring trailing indices"
            );
        }
        if mesh.vertex_count == 0 && mesh.triangle_count() != 0 {
            return Err(Error::InvalidMesh(format!(
                "{} triangles reference an empty vertex buffer",
                mesh.triangle_count()
            )));
        }
        if mesh.vertex_stride < 12 {
            return Err(Error::InvalidMesh(format!(
                "vertex stride {} is smaller than a position",
                mesh.vertex_stride
            )));
        }

        // must stay alive until the build has completed
        let transform_buffer = DeviceBuffer::with_data(
            self.backend,
            bytemuck::bytes_of(&mesh.transform),
            BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT | BufferUsage::DEVICE_ADDRESS,
        )?;

        let geometry = GeometryDesc {
            data: GeometryData::Triangles(TriangleGeometry {
                vertex_format: VertexFormat::Float3,
                vertex_data: mesh.vertex_buffer,
                vertex_stride: mesh.vertex_stride,
                max_vertex: mesh.vertex_count.saturating_sub(1),
                index_data: mesh.index_buffer,
                transform_data: transform_buffer.device_address().unwrap_or_default(),
            }),
            // not opaque: the any-hit stage must run, but at most once per primitive
            flags: GeometryFlags::NO_DUPLICATE_ANY_HIT_INVOCATION,
        };

        let accel = AccelerationStructure::build(self.backend, self.mode, &geometry, mesh.triangle_count())?;
        drop(transform_buffer);
        Ok(accel)
    }
}

/// Layout of one record in the top level instance buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
pub struct AccelerationStructureInstance {
    pub transform: Transform3x4,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl AccelerationStructureInstance {
    pub const MAX_CUSTOM_INDEX: u32 = 0x00ff_ffff;
    pub const MASK_ALL: u32 = 0xff;
    pub const TRIANGLE_FACING_CULL_DISABLE: u32 = 0x1;

    pub fn new(instance: &Instance) -> Self {
        Self {
            transform: Transform3x4::identity(),
            instance_custom_index_and_mask: (Self::MASK_ALL << 24)
                | (instance.instance_index & Self::MAX_CUSTOM_INDEX),
            instance_shader_binding_table_record_offset_and_flags: Self::TRIANGLE_FACING_CULL_DISABLE << 24,
            acceleration_structure_reference: instance.blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & Self::MAX_CUSTOM_INDEX
    }
}

/// Reference from the top level to one built bottom level structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    pub blas_address: DeviceAddress,
    /// Exposed to shaders as the custom index, used to find the scene descriptor record.
    pub instance_index: u32,
}

impl Instance {
    pub fn new<B: Backend>(blas: &AccelerationStructure<B>, instance_index: u32) -> Self {
        Self {
            blas_address: blas.device_address(),
            instance_index,
        }
    }
}

pub struct TopLevelBuilder<'a, B: Backend> {
    backend: &'a Arc<B>,
    mode: BuildMode,
}

impl<'a, B: Backend> TopLevelBuilder<'a, B> {
    pub fn new(backend: &'a Arc<B>, mode: BuildMode) -> Self {
        Self { backend, mode }
    }

    /// Instances are written in the order given; an empty list builds an empty hierarchy.
    #[instrument(skip_all, fields(instance_count = instances.len()))]
    pub fn build(&self, instances: &[Instance]) -> Result<AccelerationStructure<B>> {
        let mut records = Vec::with_capacity(instances.len());
        for (position, instance) in instances.iter().enumerate() {
            if instance.blas_address == 0 {
                return Err(Error::BuildOrderViolation(format!(
                    "instance {} references a bottom level structure with no device address",
                    position
                )));
            }
            if instance.instance_index > AccelerationStructureInstance::MAX_CUSTOM_INDEX {
                return Err(Error::InvalidMesh(format!(
                    "instance index {} does not fit in 24 bits",
                    instance.instance_index
                )));
            }
            records.push(AccelerationStructureInstance::new(instance));
        }

        // must stay alive until the build has completed
        let instance_buffer = DeviceBuffer::with_data(
            self.backend,
            bytemuck::cast_slice(&records),
            BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT | BufferUsage::DEVICE_ADDRESS,
        )?;

        let geometry = GeometryDesc {
            data: GeometryData::Instances {
                instance_data: instance_buffer.device_address().unwrap_or_default(),
            },
            flags: GeometryFlags::NO_DUPLICATE_ANY_HIT_INVOCATION,
        };

        let accel = AccelerationStructure::build(self.backend, self.mode, &geometry, records.len() as u32)?;
        drop(instance_buffer);
        Ok(accel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn instance_record_matches_device_layout() {
        assert_eq!(mem::size_of::<AccelerationStructureInstance>(), 64);

        let record = AccelerationStructureInstance::new(&Instance {
            blas_address: 0x1234_0000,
            instance_index: 7,
        });
        assert_eq!(record.custom_index(), 7);
        assert_eq!(record.instance_custom_index_and_mask >> 24, 0xff);
        assert_eq!(record.instance_shader_binding_table_record_offset_and_flags, 0x0100_0000);
        assert_eq!(record.acceleration_structure_reference, 0x1234_0000);
        assert_eq!(record.transform, Transform3x4::identity());
    }

    #[test]
    fn triangle_count_truncates() {
        let mesh = Mesh {
            vertex_buffer: 0x1000,
            vertex_stride: 12,
            vertex_count: 4,
            index_buffer: 0x2000,
            index_count: 7,
            transform: Transform3x4::identity(),
        };
        assert_eq!(mesh.triangle_count(), 2);
    }
}
