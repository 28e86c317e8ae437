use crate::accel::*;
use crate::accumulate::{AccumulationController, FrameEvents};
use crate::backend::*;
use crate::buffer::DeviceBuffer;
use crate::descriptor::{DescriptorBinder, SceneBindings};
use crate::error::{Error, Result};
use crate::images::StorageImages;
use crate::material::{MaterialDesc, MaterialTable};
use crate::maths::UVec2;
use crate::options::RenderOptions;
use crate::pipeline::{RayTracingPipeline, ShaderPaths};
use crate::scene_desc::SceneDescriptorTable;
use crate::shader_binding::ShaderBindingTable;
use crate::uniform::{Camera, UniformBuffer, UniformFrameState};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// One mesh of the scene together with the materials it indexes.
#[derive(Debug, Clone)]
pub struct SceneMesh {
    pub mesh: Mesh,
    pub materials: Vec<MaterialDesc>,
}

#[derive(Debug, Clone)]
pub struct PathTracerParams {
    pub shaders: ShaderPaths,
    pub build_preference: BuildPreference,
    pub size: UVec2,
    pub options: RenderOptions,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInput {
    pub camera: Camera,
    pub size: UVec2,
    pub camera_changed: bool,
    pub resized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub sample_count: u32,
    pub converged: bool,
}

/// Everything created by scene preparation, destroyed together at teardown.
///
/// Fields drop in declaration order, so users of a resource are listed before it.
pub struct PreparedScene<B: Backend> {
    shader_binding_table: ShaderBindingTable<B>,
    pipeline: RayTracingPipeline<B>,
    binder: DescriptorBinder<B>,
    uniforms: UniformBuffer<B>,
    images: StorageImages<B>,
    scene_descriptors: SceneDescriptorTable<B>,
    materials: DeviceBuffer<B>,
    material_table: MaterialTable,
    top_level: AccelerationStructure<B>,
    bottom_levels: Vec<AccelerationStructure<B>>,
    vertex_stride: u32,
}

impl<B: Backend> PreparedScene<B> {
    pub fn bottom_levels(&self) -> &[AccelerationStructure<B>] {
        &self.bottom_levels
    }

    pub fn top_level(&self) -> &AccelerationStructure<B> {
        &self.top_level
    }

    pub fn material_table(&self) -> &MaterialTable {
        &self.material_table
    }

    pub fn material_base_address(&self) -> Option<DeviceAddress> {
        self.materials.device_address()
    }

    pub fn scene_descriptors(&self) -> &SceneDescriptorTable<B> {
        &self.scene_descriptors
    }

    pub fn shader_binding_table(&self) -> &ShaderBindingTable<B> {
        &self.shader_binding_table
    }

    pub fn binding_set(&self) -> B::BindingSet {
        self.binder.binding_set()
    }

    pub fn uniform_buffer(&self) -> B::Buffer {
        self.uniforms.buffer()
    }

    pub fn images(&self) -> &StorageImages<B> {
        &self.images
    }

    fn dispatch(&self, backend: &B, state: &UniformFrameState) -> Result<()> {
        self.uniforms.write(state)?;
        let mut cmd = backend.begin_commands()?;
        backend.cmd_trace_rays(
            &mut cmd,
            self.pipeline.pipeline(),
            self.binder.binding_set(),
            &self.shader_binding_table.trace_regions(),
            self.images.size(),
        );
        // the single uniform buffer is rewritten next frame, so this dispatch must retire first
        backend.submit_and_wait(cmd)
    }
}

/// Every mesh is read with the same stride by the shaders.
fn common_vertex_stride(meshes: &[SceneMesh]) -> Result<u32> {
    let mut strides = meshes.iter().map(|m| m.mesh.vertex_stride);
    let first = strides.next().unwrap_or(0);
    match strides.find(|&stride| stride != first) {
        Some(stride) => Err(Error::InvalidMesh(format!(
            "vertex stride {} differs from the scene stride {}",
            stride, first
        ))),
        None => Ok(first),
    }
}

/// Owns the scene resources and drives the progressive frame loop.
pub struct PathTracer<B: Backend> {
    backend: Arc<B>,
    build_mode: BuildMode,
    shaders: ShaderPaths,
    size: UVec2,
    accumulation: AccumulationController,
    scene: Option<PreparedScene<B>>,
}

impl<B: Backend> PathTracer<B> {
    pub fn new(backend: Arc<B>, params: PathTracerParams) -> Result<Self> {
        params.options.validate()?;
        let build_mode = BuildMode::select(backend.as_ref(), params.build_preference);
        Ok(Self {
            backend,
            build_mode,
            shaders: params.shaders,
            size: params.size,
            accumulation: AccumulationController::new(params.options),
            scene: None,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn build_mode(&self) -> BuildMode {
        self.build_mode
    }

    pub fn accumulation(&self) -> &AccumulationController {
        &self.accumulation
    }

    pub fn scene(&self) -> Option<&PreparedScene<B>> {
        self.scene.as_ref()
    }

    pub fn set_options(&mut self, options: RenderOptions) -> Result<()> {
        options.validate()?;
        self.accumulation.set_options(options);
        Ok(())
    }

    /// Builds all acceleration structures and binds everything needed for dispatch.
    ///
    /// Runs to completion or fails without keeping any partial scene.
    #[instrument(skip_all, fields(mesh_count = meshes.len(), texture_count = textures.len()))]
    pub fn prepare_scene(&mut self, meshes: &[SceneMesh], textures: &[B::SampledImage]) -> Result<()> {
        self.scene = None;
        let backend = &self.backend;
        let vertex_stride = common_vertex_stride(meshes)?;

        let bottom_level_builder = BottomLevelBuilder::new(backend, self.build_mode);
        let bottom_levels = meshes
            .iter()
            .map(|scene_mesh| bottom_level_builder.build(&scene_mesh.mesh))
            .collect::<Result<Vec<_>>>()?;

        let instances: Vec<_> = bottom_levels
            .iter()
            .enumerate()
            .map(|(index, blas)| Instance::new(blas, index as u32))
            .collect();
        let top_level = TopLevelBuilder::new(backend, self.build_mode).build(&instances)?;

        let mut material_table = MaterialTable::new();
        for scene_mesh in meshes {
            material_table.push_mesh(&scene_mesh.materials);
        }
        let materials = DeviceBuffer::upload(
            backend,
            material_table.as_bytes(),
            BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
        )?;
        let material_base = materials
            .device_address()
            .ok_or_else(|| Error::BuildOrderViolation("material table has no device address".to_owned()))?;

        let mesh_list: Vec<Mesh> = meshes.iter().map(|scene_mesh| scene_mesh.mesh).collect();
        let scene_descriptors =
            SceneDescriptorTable::assemble(backend, &mesh_list, material_table.ranges(), material_base)?;

        let images = StorageImages::new(backend, self.size)?;
        let uniforms = UniformBuffer::new(backend)?;

        let mut binder = DescriptorBinder::new(backend, textures.len() as u32)?;
        let pipeline = RayTracingPipeline::new(backend, binder.binding_set(), &self.shaders)?;
        let shader_binding_table = ShaderBindingTable::new(backend, pipeline.pipeline(), pipeline.group_counts())?;

        binder.bind(&SceneBindings {
            top_level: top_level.handle(),
            output_image: images.output(),
            accumulation_image: images.accumulation(),
            uniform_buffer: uniforms.buffer(),
            scene_descriptors: scene_descriptors.buffer(),
            textures,
        })?;

        info!(
            material_count = material_table.records().len(),
            top_level_size = top_level.storage_size(),
            "scene prepared"
        );

        self.accumulation.reset();
        self.scene = Some(PreparedScene {
            shader_binding_table,
            pipeline,
            binder,
            uniforms,
            images,
            scene_descriptors,
            materials,
            material_table,
            top_level,
            bottom_levels,
            vertex_stride,
        });
        Ok(())
    }

    /// Advances accumulation and dispatches one frame.
    ///
    /// A failed frame is not retried; accumulation restarts with the next frame.
    pub fn render_frame(&mut self, frame: &FrameInput) -> Result<FrameStats> {
        let scene = self
            .scene
            .as_mut()
            .ok_or_else(|| Error::BuildOrderViolation("frame rendered before the scene was prepared".to_owned()))?;

        let size_changed = frame.size != scene.images.size();
        if size_changed {
            let images = StorageImages::new(&self.backend, frame.size)?;
            scene.binder.rebind_images(images.output(), images.accumulation())?;
            scene.images = images;
            self.size = frame.size;
        }

        let sample_count = self.accumulation.advance(FrameEvents {
            camera_changed: frame.camera_changed,
            resized: frame.resized || size_changed,
        });
        let state = UniformFrameState::new(
            &frame.camera,
            self.accumulation.options(),
            scene.vertex_stride,
            sample_count,
        );

        if let Err(err) = scene.dispatch(self.backend.as_ref(), &state) {
            warn!(%err, "frame failed, skipping");
            self.accumulation.reset();
            return Err(err);
        }

        Ok(FrameStats {
            sample_count,
            converged: self.accumulation.is_converged(),
        })
    }
}
