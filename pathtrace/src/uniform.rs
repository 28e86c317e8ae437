use crate::backend::*;
use crate::buffer::DeviceBuffer;
use crate::error::Result;
use crate::maths::Mat4;
use crate::options::RenderOptions;
use bytemuck::{Pod, Zeroable};
use std::mem;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
}

/// Per-frame constants read by every shader stage, std140 layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct UniformFrameState {
    pub view_inverse: Mat4,
    pub projection_inverse: Mat4,
    pub vertex_stride: u32,
    pub current_sample_count: u32,
    pub samples_per_frame: u32,
    pub ray_bounces: u32,
    pub sky: u32,
    pub sky_intensity: f32,
    _pad: [u32; 2],
}

impl UniformFrameState {
    pub fn new(camera: &Camera, options: &RenderOptions, vertex_stride: u32, current_sample_count: u32) -> Self {
        Self {
            view_inverse: camera.view.inversed(),
            projection_inverse: camera.projection.inversed(),
            vertex_stride,
            current_sample_count,
            samples_per_frame: options.samples_per_frame,
            ray_bounces: options.ray_bounces,
            sky: options.sky as u32,
            sky_intensity: options.sky_intensity,
            _pad: [0; 2],
        }
    }
}

/// The persistently mapped uniform buffer, overwritten every frame.
pub struct UniformBuffer<B: Backend> {
    buffer: DeviceBuffer<B>,
}

impl<B: Backend> UniformBuffer<B> {
    pub fn new(backend: &Arc<B>) -> Result<Self> {
        let buffer = DeviceBuffer::new(
            backend,
            mem::size_of::<UniformFrameState>() as DeviceSize,
            BufferUsage::UNIFORM,
            MemoryLocation::HostVisible,
        )?;
        Ok(Self { buffer })
    }

    pub fn write(&self, state: &UniformFrameState) -> Result<()> {
        self.buffer.write(0, bytemuck::bytes_of(state))
    }

    pub fn buffer(&self) -> B::Buffer {
        self.buffer.buffer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maths::Vec3;

    #[test]
    fn layout_matches_shader_block() {
        assert_eq!(mem::size_of::<UniformFrameState>(), 160);

        let state = UniformFrameState::new(
            &Camera {
                view: Mat4::identity(),
                projection: Mat4::identity(),
            },
            &RenderOptions::default(),
            32,
            12,
        );
        let words: &[u32] = bytemuck::cast_slice(bytemuck::bytes_of(&state));
        assert_eq!(words[32], 32);
        assert_eq!(words[33], 12);
        assert_eq!(words[34], 4);
        assert_eq!(words[35], 8);
        assert_eq!(words[36], 1);
        assert_eq!(f32::from_bits(words[37]), 5.0);
    }

    #[test]
    fn stores_inverse_matrices() {
        let view = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let projection = Mat4::from_scale(2.0);
        let state = UniformFrameState::new(&Camera { view, projection }, &RenderOptions::default(), 12, 0);
        let round_trip = state.view_inverse * view;
        for (col, expected) in round_trip.cols.iter().zip(Mat4::identity().cols.iter()) {
            assert!((*col - *expected).mag() < 1.0e-5);
        }
        assert!((state.projection_inverse.cols[0].x - 0.5).abs() < 1.0e-6);
    }
}
