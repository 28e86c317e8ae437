mod accel;
mod accumulate;
mod backend;
mod buffer;
mod descriptor;
mod error;
mod images;
mod material;
mod maths;
mod options;
mod pipeline;
mod renderer;
mod scene_desc;
mod scratch;
mod shader_binding;
mod uniform;

pub mod recording;
pub mod vulkan;

pub mod prelude {
    pub use crate::accel::*;
    pub use crate::accumulate::*;
    pub use crate::backend::*;
    pub use crate::buffer::*;
    pub use crate::descriptor::*;
    pub use crate::error::*;
    pub use crate::images::*;
    pub use crate::material::*;
    pub use crate::maths::*;
    pub use crate::options::*;
    pub use crate::pipeline::*;
    pub use crate::renderer::*;
    pub use crate::scene_desc::*;
    pub use crate::scratch::*;
    pub use crate::shader_binding::*;
    pub use crate::uniform::*;
}
