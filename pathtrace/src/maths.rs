use bytemuck::{Pod, Zeroable};
pub use ultraviolet as uv;

pub type UVec2 = uv::UVec2;

pub type Vec3 = uv::Vec3;
pub type Vec4 = uv::Vec4;

pub type Mat4 = uv::Mat4;

pub trait AlignUp {
    fn align_up(self, alignment: Self) -> Self;
}

macro_rules! align_up_impl {
    ($t:ty) => {
        impl AlignUp for $t {
            fn align_up(self, alignment: Self) -> Self {
                debug_assert!(alignment.is_power_of_two());
                (self + alignment - 1) & !(alignment - 1)
            }
        }
    };
}

align_up_impl!(u32);
align_up_impl!(u64);

/// Affine transform stored as the top 3 rows of a row-major 4x4 matrix,
/// which is the layout ray tracing build inputs and instance records expect.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct Transform3x4 {
    pub rows: [Vec4; 3],
}

impl Transform3x4 {
    pub fn identity() -> Self {
        Self {
            rows: [Vec4::unit_x(), Vec4::unit_y(), Vec4::unit_z()],
        }
    }

    pub fn from_translation(offset: Vec3) -> Self {
        Self {
            rows: [
                Vec4::new(1.0, 0.0, 0.0, offset.x),
                Vec4::new(0.0, 1.0, 0.0, offset.y),
                Vec4::new(0.0, 0.0, 1.0, offset.z),
            ],
        }
    }

    pub fn as_floats(&self) -> [f32; 12] {
        bytemuck::cast(self.rows)
    }
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::identity()
    }
}
