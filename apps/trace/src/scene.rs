use bytemuck::{Pod, Zeroable};
use pathtrace::prelude::*;
use std::mem;
use std::sync::Arc;
use tracing::debug;

/// Vertex layout read by the hit shaders, position first.
#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct Vertex {
    position: Vec3,
    normal: Vec3,
}

#[derive(Default)]
struct Geometry {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
}

impl Geometry {
    fn with_quad(mut self, v0: Vec3, v1: Vec3, v2: Vec3, v3: Vec3) -> Self {
        let normal = (v1 - v0).cross(v2 - v0).normalized();
        let base = self.vertices.len() as u32;
        for &position in [v0, v1, v2, v3].iter() {
            self.vertices.push(Vertex { position, normal });
        }
        self.indices
            .extend([0, 1, 2, 2, 3, 0].iter().map(|&index| base + index));
        self
    }
}

/// The Cornell box, with one mesh per surface group and a `Light` quad under the ceiling.
pub struct CornellBox<B: Backend> {
    meshes: Vec<SceneMesh>,
    // read by shaders through the scene descriptors
    _buffers: Vec<DeviceBuffer<B>>,
}

impl<B: Backend> CornellBox<B> {
    pub const VERTEX_STRIDE: u32 = mem::size_of::<Vertex>() as u32;

    pub fn new(backend: &Arc<B>) -> Result<Self> {
        let grey = Vec4::new(0.730, 0.735, 0.729, 1.0);
        let red = Vec4::new(0.611, 0.058, 0.062, 1.0);
        let green = Vec4::new(0.117, 0.449, 0.115, 1.0);
        let light = Vec4::new(17.0, 12.0, 4.0, 1.0);

        let parts = vec![
            (
                Geometry::default()
                    .with_quad(
                        Vec3::new(0.5528, 0.0, 0.0),
                        Vec3::new(0.0, 0.0, 0.0),
                        Vec3::new(0.0, 0.0, 0.5592),
                        Vec3::new(0.5496, 0.0, 0.5592),
                    )
                    .with_quad(
                        Vec3::new(0.556, 0.5488, 0.0),
                        Vec3::new(0.556, 0.5488, 0.5592),
                        Vec3::new(0.0, 0.5488, 0.5592),
                        Vec3::new(0.0, 0.5488, 0.0),
                    )
                    .with_quad(
                        Vec3::new(0.5496, 0.0, 0.5592),
                        Vec3::new(0.0, 0.0, 0.5592),
                        Vec3::new(0.0, 0.5488, 0.5592),
                        Vec3::new(0.556, 0.5488, 0.5592),
                    ),
                vec![MaterialDesc::new("Wall", grey)],
            ),
            (
                Geometry::default().with_quad(
                    Vec3::new(0.5528, 0.0, 0.0),
                    Vec3::new(0.5496, 0.0, 0.5592),
                    Vec3::new(0.556, 0.5488, 0.5592),
                    Vec3::new(0.556, 0.5488, 0.0),
                ),
                vec![MaterialDesc::new("RedWall", red)],
            ),
            (
                Geometry::default().with_quad(
                    Vec3::new(0.0, 0.0, 0.5592),
                    Vec3::new(0.0, 0.0, 0.0),
                    Vec3::new(0.0, 0.548, 0.0),
                    Vec3::new(0.0, 0.548, 0.5592),
                ),
                vec![MaterialDesc::new("GreenWall", green)],
            ),
            (
                Geometry::default()
                    .with_quad(
                        Vec3::new(0.130, 0.165, 0.065),
                        Vec3::new(0.082, 0.165, 0.225),
                        Vec3::new(0.240, 0.165, 0.272),
                        Vec3::new(0.290, 0.165, 0.114),
                    )
                    .with_quad(
                        Vec3::new(0.290, 0.0, 0.114),
                        Vec3::new(0.290, 0.165, 0.114),
                        Vec3::new(0.240, 0.165, 0.272),
                        Vec3::new(0.240, 0.0, 0.272),
                    )
                    .with_quad(
                        Vec3::new(0.130, 0.0, 0.065),
                        Vec3::new(0.130, 0.165, 0.065),
                        Vec3::new(0.290, 0.165, 0.114),
                        Vec3::new(0.290, 0.0, 0.114),
                    )
                    .with_quad(
                        Vec3::new(0.082, 0.0, 0.225),
                        Vec3::new(0.082, 0.165, 0.225),
                        Vec3::new(0.130, 0.165, 0.065),
                        Vec3::new(0.130, 0.0, 0.065),
                    )
                    .with_quad(
                        Vec3::new(0.240, 0.0, 0.272),
                        Vec3::new(0.240, 0.165, 0.272),
                        Vec3::new(0.082, 0.165, 0.225),
                        Vec3::new(0.082, 0.0, 0.225),
                    ),
                vec![MaterialDesc::new("ShortBlock", grey)],
            ),
            (
                Geometry::default()
                    .with_quad(
                        Vec3::new(0.423, 0.330, 0.247),
                        Vec3::new(0.265, 0.330, 0.296),
                        Vec3::new(0.314, 0.330, 0.456),
                        Vec3::new(0.472, 0.330, 0.406),
                    )
                    .with_quad(
                        Vec3::new(0.423, 0.0, 0.247),
                        Vec3::new(0.423, 0.330, 0.247),
                        Vec3::new(0.472, 0.330, 0.406),
                        Vec3::new(0.472, 0.0, 0.406),
                    )
                    .with_quad(
                        Vec3::new(0.472, 0.0, 0.406),
                        Vec3::new(0.472, 0.330, 0.406),
                        Vec3::new(0.314, 0.330, 0.456),
                        Vec3::new(0.314, 0.0, 0.456),
                    )
                    .with_quad(
                        Vec3::new(0.314, 0.0, 0.456),
                        Vec3::new(0.314, 0.330, 0.456),
                        Vec3::new(0.265, 0.330, 0.296),
                        Vec3::new(0.265, 0.0, 0.296),
                    )
                    .with_quad(
                        Vec3::new(0.265, 0.0, 0.296),
                        Vec3::new(0.265, 0.330, 0.296),
                        Vec3::new(0.423, 0.330, 0.247),
                        Vec3::new(0.423, 0.0, 0.247),
                    ),
                vec![MaterialDesc::new("TallBlock", grey)],
            ),
            (
                Geometry::default().with_quad(
                    Vec3::new(0.343, 0.5478, 0.227),
                    Vec3::new(0.343, 0.5478, 0.332),
                    Vec3::new(0.213, 0.5478, 0.332),
                    Vec3::new(0.213, 0.5478, 0.227),
                ),
                vec![MaterialDesc::new(MaterialKind::LIGHT_NAME, light)],
            ),
        ];

        let geometry_usage =
            BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS | BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT;
        let mut meshes = Vec::with_capacity(parts.len());
        let mut buffers = Vec::with_capacity(2 * parts.len());
        for (geometry, materials) in parts {
            let vertex_buffer = DeviceBuffer::upload(backend, bytemuck::cast_slice(&geometry.vertices), geometry_usage)?;
            let index_buffer = DeviceBuffer::upload(backend, bytemuck::cast_slice(&geometry.indices), geometry_usage)?;
            let address_of = |buffer: &DeviceBuffer<B>| {
                buffer
                    .device_address()
                    .ok_or_else(|| Error::BuildOrderViolation("geometry buffer has no device address".to_owned()))
            };
            meshes.push(SceneMesh {
                mesh: Mesh {
                    vertex_buffer: address_of(&vertex_buffer)?,
                    vertex_stride: Self::VERTEX_STRIDE,
                    vertex_count: geometry.vertices.len() as u32,
                    index_buffer: address_of(&index_buffer)?,
                    index_count: geometry.indices.len() as u32,
                    transform: Transform3x4::identity(),
                },
                materials,
            });
            buffers.push(vertex_buffer);
            buffers.push(index_buffer);
        }
        debug!(mesh_count = meshes.len(), "uploaded cornell box geometry");

        Ok(Self {
            meshes,
            _buffers: buffers,
        })
    }

    pub fn meshes(&self) -> &[SceneMesh] {
        &self.meshes
    }

    pub fn camera(size: UVec2) -> Camera {
        let eye = Vec3::new(0.278, 0.273, -0.8);
        let target = Vec3::new(0.278, 0.273, 0.0);
        let vertical_fov = 2.0 * (0.025f32 / (2.0 * 0.035)).atan();
        let aspect_ratio = (size.x as f32) / (size.y.max(1) as f32);
        Camera {
            view: Mat4::look_at(eye, target, Vec3::unit_y()),
            projection: uv::projection::rh_yup::perspective_reversed_infinite_z_vk(vertical_fov, aspect_ratio, 0.1),
        }
    }
}
