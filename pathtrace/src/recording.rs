//! An in-memory backend that records every call and simulates the effects that
//! scene preparation and the frame loop rely on.
//!
//! Buffer contents, copies and build completion are tracked, so the ordering
//! rules of acceleration structure builds can be checked without a GPU.

use crate::accel::AccelerationStructureInstance;
use crate::backend::*;
use crate::error::{Error, Result};
use crate::maths::{AlignUp, UVec2};
use crate::uniform::UniformFrameState;
use bytemuck::Pod;
use slotmap::{new_key_type, SlotMap};
use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::mem;
use tracing::trace;

new_key_type! {
    pub struct BufferId;
    pub struct AccelId;
    pub struct ImageId;
    pub struct SampledImageId;
    pub struct BindingSetId;
    pub struct PipelineId;
}

/// A bottom level reference found in an instance buffer when a top level build ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencedBlas {
    pub address: DeviceAddress,
    pub custom_index: u32,
    /// Whether the address belonged to a live, completed bottom level build.
    pub built: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateBuffer {
        buffer: BufferId,
        size: DeviceSize,
        usage: BufferUsage,
        location: MemoryLocation,
    },
    DestroyBuffer {
        buffer: BufferId,
    },
    QueryBuildSizes {
        level: AccelerationStructureLevel,
        primitive_count: u32,
        flags: GeometryFlags,
        sizes: BuildSizes,
    },
    CreateAccelerationStructure {
        accel: AccelId,
        level: AccelerationStructureLevel,
        buffer: BufferId,
        size: DeviceSize,
    },
    DestroyAccelerationStructure {
        accel: AccelId,
    },
    AccelerationStructureAddress {
        accel: AccelId,
        built: bool,
    },
    /// A build that has executed, on the host or at submission.
    Build {
        accel: AccelId,
        level: AccelerationStructureLevel,
        primitive_count: u32,
        on_host: bool,
        /// Size of the live buffer backing the scratch address, if any.
        scratch_size: Option<DeviceSize>,
        referenced_blas: Vec<ReferencedBlas>,
    },
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        size: DeviceSize,
    },
    Submit {
        command_count: usize,
    },
    CreateImage {
        image: ImageId,
        format: ImageFormat,
        size: UVec2,
    },
    DestroyImage {
        image: ImageId,
    },
    CreateBindingSet {
        binding_set: BindingSetId,
        layout: Vec<BindingKind>,
    },
    UpdateBindingSet {
        binding_set: BindingSetId,
        bindings: Vec<u32>,
    },
    DestroyBindingSet {
        binding_set: BindingSetId,
    },
    CreatePipeline {
        pipeline: PipelineId,
        group_count: usize,
        max_recursion_depth: u32,
    },
    GetShaderGroupHandles {
        pipeline: PipelineId,
        group_count: u32,
    },
    DestroyPipeline {
        pipeline: PipelineId,
    },
    TraceRays {
        size: UVec2,
        regions: TraceRegions,
        /// Uniform contents seen by the dispatch.
        uniforms: Option<UniformFrameState>,
        top_level_built: bool,
    },
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Build {
        geometry: GeometryDesc,
        primitive_count: u32,
        dst: AccelId,
        scratch_address: DeviceAddress,
    },
    Copy {
        src: BufferId,
        dst: BufferId,
        size: DeviceSize,
    },
    TraceRays {
        binding_set: BindingSetId,
        regions: TraceRegions,
        size: UVec2,
    },
}

pub struct RecordedCommands {
    commands: Vec<Command>,
}

struct BufferEntry {
    size: DeviceSize,
    location: MemoryLocation,
    address: DeviceAddress,
    contents: Vec<u8>,
}

struct AccelEntry {
    address: DeviceAddress,
    built: bool,
}

#[derive(Debug, Clone)]
enum Bound {
    AccelerationStructure(AccelId),
    Image(ImageId),
    Buffer(BufferId),
    SampledImages(Vec<SampledImageId>),
}

struct BindingSetEntry {
    layout: Vec<BindingKind>,
    bound: HashMap<u32, Bound>,
}

struct State {
    buffers: SlotMap<BufferId, BufferEntry>,
    accels: SlotMap<AccelId, AccelEntry>,
    images: SlotMap<ImageId, UVec2>,
    sampled_images: SlotMap<SampledImageId, ()>,
    binding_sets: SlotMap<BindingSetId, BindingSetEntry>,
    pipelines: SlotMap<PipelineId, usize>,
    next_address: DeviceAddress,
    events: Vec<Event>,
    allocation_limit: Option<DeviceSize>,
    fail_submissions: bool,
}

fn read_pod<T: Pod>(bytes: &[u8]) -> T {
    let mut value = T::zeroed();
    bytemuck::bytes_of_mut(&mut value).copy_from_slice(&bytes[..mem::size_of::<T>()]);
    value
}

impl State {
    const ADDRESS_ALIGNMENT: DeviceAddress = 256;

    fn allocate_address(&mut self, size: DeviceSize) -> DeviceAddress {
        let address = self.next_address;
        self.next_address = (address + size.max(1)).align_up(Self::ADDRESS_ALIGNMENT);
        address
    }

    fn buffer_at(&self, address: DeviceAddress) -> Option<&BufferEntry> {
        self.buffers.values().find(|entry| entry.address == address)
    }

    fn read_instances(&self, address: DeviceAddress, count: u32) -> Vec<ReferencedBlas> {
        let record_size = mem::size_of::<AccelerationStructureInstance>();
        let contents = match self.buffer_at(address) {
            Some(entry) => &entry.contents,
            None => return Vec::new(),
        };
        contents
            .chunks_exact(record_size)
            .take(count as usize)
            .map(|chunk| {
                let record: AccelerationStructureInstance = read_pod(chunk);
                let address = record.acceleration_structure_reference;
                ReferencedBlas {
                    address,
                    custom_index: record.custom_index(),
                    built: self
                        .accels
                        .values()
                        .any(|accel| accel.address == address && accel.built),
                }
            })
            .collect()
    }

    fn execute(&mut self, command: Command, on_host: bool) {
        match command {
            Command::Build {
                geometry,
                primitive_count,
                dst,
                scratch_address,
            } => {
                let scratch_size = self.buffer_at(scratch_address).map(|entry| entry.size);
                let referenced_blas = match geometry.data {
                    GeometryData::Instances { instance_data } => self.read_instances(instance_data, primitive_count),
                    GeometryData::Triangles(_) => Vec::new(),
                };
                if let Some(accel) = self.accels.get_mut(dst) {
                    accel.built = true;
                }
                self.events.push(Event::Build {
                    accel: dst,
                    level: geometry.level(),
                    primitive_count,
                    on_host,
                    scratch_size,
                    referenced_blas,
                });
            }
            Command::Copy { src, dst, size } => {
                let data = self
                    .buffers
                    .get(src)
                    .map(|entry| entry.contents[..(size as usize).min(entry.contents.len())].to_vec());
                if let (Some(data), Some(entry)) = (data, self.buffers.get_mut(dst)) {
                    let len = data.len().min(entry.contents.len());
                    entry.contents[..len].copy_from_slice(&data[..len]);
                }
                self.events.push(Event::CopyBuffer { src, dst, size });
            }
            Command::TraceRays {
                binding_set,
                regions,
                size,
            } => {
                let mut uniforms = None;
                let mut top_level_built = false;
                if let Some(entry) = self.binding_sets.get(binding_set) {
                    for (binding, kind) in entry.layout.iter().enumerate() {
                        match (kind, entry.bound.get(&(binding as u32))) {
                            (BindingKind::UniformBuffer, Some(Bound::Buffer(buffer))) => {
                                uniforms = self
                                    .buffers
                                    .get(*buffer)
                                    .filter(|b| b.contents.len() >= mem::size_of::<UniformFrameState>())
                                    .map(|b| read_pod(&b.contents));
                            }
                            (BindingKind::AccelerationStructure, Some(Bound::AccelerationStructure(accel))) => {
                                top_level_built = self.accels.get(*accel).map_or(false, |a| a.built);
                            }
                            _ => {}
                        }
                    }
                }
                self.events.push(Event::TraceRays {
                    size,
                    regions,
                    uniforms,
                    top_level_built,
                });
            }
        }
    }
}

/// Backend that records calls instead of talking to a device.
pub struct RecordingBackend {
    properties: RayTracingProperties,
    host_builds: bool,
    state: RefCell<State>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::with_properties(
            RayTracingProperties {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
            },
            false,
        )
    }

    pub fn with_properties(properties: RayTracingProperties, host_builds: bool) -> Self {
        Self {
            properties,
            host_builds,
            state: RefCell::new(State {
                buffers: SlotMap::with_key(),
                accels: SlotMap::with_key(),
                images: SlotMap::with_key(),
                sampled_images: SlotMap::with_key(),
                binding_sets: SlotMap::with_key(),
                pipelines: SlotMap::with_key(),
                next_address: 0x1000_0000,
                events: Vec::new(),
                allocation_limit: None,
                fail_submissions: false,
            }),
        }
    }

    /// Deterministic sizes so that tests can predict allocations.
    pub fn build_sizes_for(level: AccelerationStructureLevel, primitive_count: u32) -> BuildSizes {
        let count = u64::from(primitive_count);
        match level {
            AccelerationStructureLevel::Bottom => BuildSizes {
                acceleration_structure_size: 1024 + 96 * count,
                build_scratch_size: 1000 + 40 * count,
            },
            AccelerationStructureLevel::Top => BuildSizes {
                acceleration_structure_size: 512 + 128 * count,
                build_scratch_size: 600 + 24 * count,
            },
        }
    }

    fn state(&self) -> RefMut<State> {
        self.state.borrow_mut()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Buffer allocations larger than `limit` fail.
    pub fn set_allocation_limit(&self, limit: Option<DeviceSize>) {
        self.state().allocation_limit = limit;
    }

    pub fn set_fail_submissions(&self, fail: bool) {
        self.state().fail_submissions = fail;
    }

    pub fn create_sampled_image(&self) -> SampledImageId {
        self.state().sampled_images.insert(())
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state.borrow().buffers.get(buffer).map(|entry| entry.contents.clone())
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_acceleration_structure_count(&self) -> usize {
        self.state.borrow().accels.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.borrow().images.len()
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for RecordingBackend {
    type Buffer = BufferId;
    type AccelerationStructure = AccelId;
    type Image = ImageId;
    type SampledImage = SampledImageId;
    type BindingSet = BindingSetId;
    type Pipeline = PipelineId;
    type CommandBuffer = RecordedCommands;

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn supports_host_builds(&self) -> bool {
        self.host_builds
    }

    fn create_buffer(&self, size: DeviceSize, usage: BufferUsage, location: MemoryLocation) -> Result<BufferId> {
        let mut state = self.state();
        if state.allocation_limit.map_or(false, |limit| size > limit) {
            return Err(Error::Allocation { what: "buffer", size });
        }
        let address = state.allocate_address(size);
        let buffer = state.buffers.insert(BufferEntry {
            size,
            location,
            address,
            contents: vec![0; size as usize],
        });
        trace!(?buffer, size, "create buffer");
        state.events.push(Event::CreateBuffer {
            buffer,
            size,
            usage,
            location,
        });
        Ok(buffer)
    }

    fn buffer_device_address(&self, buffer: BufferId) -> DeviceAddress {
        self.state.borrow().buffers.get(buffer).map_or(0, |entry| entry.address)
    }

    fn write_buffer(&self, buffer: BufferId, offset: DeviceSize, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .buffers
            .get_mut(buffer)
            .ok_or_else(|| Error::backend("write_buffer", "unknown buffer"))?;
        if entry.location != MemoryLocation::HostVisible {
            return Err(Error::backend("write_buffer", "buffer is not host visible"));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > entry.contents.len() {
            return Err(Error::backend("write_buffer", "write out of range"));
        }
        entry.contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state();
        state.buffers.remove(buffer);
        state.events.push(Event::DestroyBuffer { buffer });
    }

    fn create_storage_image(&self, format: ImageFormat, size: UVec2) -> Result<ImageId> {
        let mut state = self.state();
        let image = state.images.insert(size);
        state.events.push(Event::CreateImage { image, format, size });
        Ok(image)
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.state();
        state.images.remove(image);
        state.events.push(Event::DestroyImage { image });
    }

    fn acceleration_structure_build_sizes(&self, geometry: &GeometryDesc, max_primitive_count: u32) -> Result<BuildSizes> {
        let level = geometry.level();
        let sizes = Self::build_sizes_for(level, max_primitive_count);
        self.state().events.push(Event::QueryBuildSizes {
            level,
            primitive_count: max_primitive_count,
            flags: geometry.flags,
            sizes,
        });
        Ok(sizes)
    }

    fn create_acceleration_structure(
        &self,
        level: AccelerationStructureLevel,
        buffer: BufferId,
        size: DeviceSize,
    ) -> Result<AccelId> {
        let mut state = self.state();
        let address = match state.buffers.get(buffer) {
            Some(entry) if entry.size >= size => entry.address,
            Some(_) => return Err(Error::backend("create_acceleration_structure", "storage buffer too small")),
            None => return Err(Error::backend("create_acceleration_structure", "unknown buffer")),
        };
        let accel = state.accels.insert(AccelEntry { address, built: false });
        state.events.push(Event::CreateAccelerationStructure {
            accel,
            level,
            buffer,
            size,
        });
        Ok(accel)
    }

    fn acceleration_structure_device_address(&self, accel: AccelId) -> DeviceAddress {
        let mut state = self.state();
        let (address, built) = state
            .accels
            .get(accel)
            .map_or((0, false), |entry| (entry.address, entry.built));
        state
            .events
            .push(Event::AccelerationStructureAddress { accel, built });
        address
    }

    fn destroy_acceleration_structure(&self, accel: AccelId) {
        let mut state = self.state();
        state.accels.remove(accel);
        state.events.push(Event::DestroyAccelerationStructure { accel });
    }

    fn build_acceleration_structure_on_host(&self, desc: &BuildDesc<AccelId>) -> Result<()> {
        if !self.host_builds {
            return Err(Error::backend(
                "build_acceleration_structures",
                "host builds are not supported",
            ));
        }
        self.state().execute(
            Command::Build {
                geometry: *desc.geometry,
                primitive_count: desc.primitive_count,
                dst: desc.dst,
                scratch_address: desc.scratch_address,
            },
            true,
        );
        Ok(())
    }

    fn begin_commands(&self) -> Result<RecordedCommands> {
        Ok(RecordedCommands { commands: Vec::new() })
    }

    fn cmd_build_acceleration_structure(&self, cmd: &mut RecordedCommands, desc: &BuildDesc<AccelId>) {
        cmd.commands.push(Command::Build {
            geometry: *desc.geometry,
            primitive_count: desc.primitive_count,
            dst: desc.dst,
            scratch_address: desc.scratch_address,
        });
    }

    fn cmd_copy_buffer(&self, cmd: &mut RecordedCommands, src: BufferId, dst: BufferId, size: DeviceSize) {
        cmd.commands.push(Command::Copy { src, dst, size });
    }

    fn cmd_trace_rays(
        &self,
        cmd: &mut RecordedCommands,
        _pipeline: PipelineId,
        binding_set: BindingSetId,
        regions: &TraceRegions,
        size: UVec2,
    ) {
        cmd.commands.push(Command::TraceRays {
            binding_set,
            regions: *regions,
            size,
        });
    }

    fn submit_and_wait(&self, cmd: RecordedCommands) -> Result<()> {
        let mut state = self.state();
        if state.fail_submissions {
            return Err(Error::backend("queue_submit", "submission failed"));
        }
        state.events.push(Event::Submit {
            command_count: cmd.commands.len(),
        });
        for command in cmd.commands {
            state.execute(command, false);
        }
        Ok(())
    }

    fn create_binding_set(&self, layout: &[BindingKind]) -> Result<BindingSetId> {
        let mut state = self.state();
        let binding_set = state.binding_sets.insert(BindingSetEntry {
            layout: layout.to_vec(),
            bound: HashMap::new(),
        });
        state.events.push(Event::CreateBindingSet {
            binding_set,
            layout: layout.to_vec(),
        });
        Ok(binding_set)
    }

    fn update_binding_set(&self, binding_set: BindingSetId, writes: &[BindingWrite<Self>]) {
        let mut state = self.state();
        if let Some(entry) = state.binding_sets.get_mut(binding_set) {
            for write in writes {
                let bound = match write.data {
                    BindingData::AccelerationStructure(accel) => Bound::AccelerationStructure(accel),
                    BindingData::StorageImage(image) => Bound::Image(image),
                    BindingData::UniformBuffer(buffer) | BindingData::StorageBuffer(buffer) => Bound::Buffer(buffer),
                    BindingData::SampledImages(images) => Bound::SampledImages(images.to_vec()),
                };
                entry.bound.insert(write.binding, bound);
            }
        }
        state.events.push(Event::UpdateBindingSet {
            binding_set,
            bindings: writes.iter().map(|write| write.binding).collect(),
        });
    }

    fn destroy_binding_set(&self, binding_set: BindingSetId) {
        let mut state = self.state();
        state.binding_sets.remove(binding_set);
        state.events.push(Event::DestroyBindingSet { binding_set });
    }

    fn create_ray_tracing_pipeline(
        &self,
        binding_set: BindingSetId,
        groups: &[ShaderGroupDesc],
        max_recursion_depth: u32,
    ) -> Result<PipelineId> {
        let mut state = self.state();
        if !state.binding_sets.contains_key(binding_set) {
            return Err(Error::backend("create_ray_tracing_pipelines", "unknown binding set"));
        }
        let pipeline = state.pipelines.insert(groups.len());
        state.events.push(Event::CreatePipeline {
            pipeline,
            group_count: groups.len(),
            max_recursion_depth,
        });
        Ok(pipeline)
    }

    fn shader_group_handles(&self, pipeline: PipelineId, group_count: u32) -> Result<Vec<u8>> {
        let mut state = self.state();
        match state.pipelines.get(pipeline) {
            Some(&count) if group_count as usize <= count => {}
            _ => {
                return Err(Error::backend(
                    "get_ray_tracing_shader_group_handles",
                    "group count exceeds pipeline",
                ))
            }
        }
        state.events.push(Event::GetShaderGroupHandles { pipeline, group_count });
        let handle_size = self.properties.shader_group_handle_size as usize;
        Ok((0..group_count)
            .flat_map(|group| std::iter::repeat(group as u8 + 1).take(handle_size))
            .collect())
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        let mut state = self.state();
        state.pipelines.remove(pipeline);
        state.events.push(Event::DestroyPipeline { pipeline });
    }
}
