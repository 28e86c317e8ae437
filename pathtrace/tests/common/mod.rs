#![allow(dead_code)]

use pathtrace::prelude::*;
use pathtrace::recording::RecordingBackend;
use std::sync::Arc;

pub const VERTEX_STRIDE: u32 = 12;

/// Meshes whose geometry buffers stay alive for the duration of a test.
pub struct TestScene {
    pub meshes: Vec<SceneMesh>,
    _buffers: Vec<DeviceBuffer<RecordingBackend>>,
}

impl TestScene {
    pub fn new() -> Self {
        Self {
            meshes: Vec::new(),
            _buffers: Vec::new(),
        }
    }

    /// Adds a mesh of separate triangles with the given material names.
    pub fn with_mesh(mut self, backend: &Arc<RecordingBackend>, triangle_count: u32, materials: &[&str]) -> Self {
        let vertex_count = 3 * triangle_count;
        let positions: Vec<f32> = (0..vertex_count)
            .flat_map(|i| vec![i as f32, (i % 3) as f32, 0.0])
            .collect();
        let indices: Vec<u32> = (0..vertex_count).collect();

        let usage = BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS | BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT;
        let vertex_buffer = DeviceBuffer::upload(backend, bytemuck::cast_slice(&positions), usage).unwrap();
        let index_buffer = DeviceBuffer::upload(backend, bytemuck::cast_slice(&indices), usage).unwrap();

        self.meshes.push(SceneMesh {
            mesh: Mesh {
                vertex_buffer: vertex_buffer.device_address().unwrap(),
                vertex_stride: VERTEX_STRIDE,
                vertex_count,
                index_buffer: index_buffer.device_address().unwrap(),
                index_count: indices.len() as u32,
                transform: Transform3x4::identity(),
            },
            materials: materials
                .iter()
                .map(|name| MaterialDesc::new(*name, Vec4::new(0.5, 0.5, 0.5, 1.0)))
                .collect(),
        });
        self._buffers.push(vertex_buffer);
        self._buffers.push(index_buffer);
        self
    }
}

pub fn params(size: UVec2, options: RenderOptions) -> PathTracerParams {
    PathTracerParams {
        shaders: ShaderPaths::in_dir("spv/bin"),
        build_preference: BuildPreference::Auto,
        size,
        options,
    }
}

pub fn options(max_samples: u32, samples_per_frame: u32) -> RenderOptions {
    RenderOptions {
        max_samples,
        samples_per_frame,
        ..RenderOptions::default()
    }
}

pub fn frame(size: UVec2) -> FrameInput {
    FrameInput {
        camera: Camera {
            view: Mat4::identity(),
            projection: Mat4::identity(),
        },
        size,
        camera_changed: false,
        resized: false,
    }
}

pub fn prepared_tracer(
    backend: &Arc<RecordingBackend>,
    scene: &TestScene,
    options: RenderOptions,
) -> PathTracer<RecordingBackend> {
    let mut tracer = PathTracer::new(Arc::clone(backend), params(UVec2::new(64, 32), options)).unwrap();
    tracer.prepare_scene(&scene.meshes, &[]).unwrap();
    tracer
}
