use crate::backend::*;
use crate::error::Result;
use crate::shader_binding::ShaderGroupCounts;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// SPIR-V files for the path tracing shader stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderPaths {
    pub raygen: PathBuf,
    pub miss: PathBuf,
    pub closest_hit: PathBuf,
    pub any_hit: PathBuf,
}

impl ShaderPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            raygen: dir.join("raygen.rgen.spv"),
            miss: dir.join("miss.rmiss.spv"),
            closest_hit: dir.join("closesthit.rchit.spv"),
            any_hit: dir.join("anyhit.rahit.spv"),
        }
    }

    fn groups(&self) -> [ShaderGroupDesc; 3] {
        [
            ShaderGroupDesc::Raygen(self.raygen.clone()),
            ShaderGroupDesc::Miss(self.miss.clone()),
            ShaderGroupDesc::TrianglesHit {
                closest_hit: self.closest_hit.clone(),
                any_hit: Some(self.any_hit.clone()),
            },
        ]
    }
}

pub struct RayTracingPipeline<B: Backend> {
    backend: Arc<B>,
    pipeline: B::Pipeline,
}

impl<B: Backend> RayTracingPipeline<B> {
    pub const MAX_RECURSION_DEPTH: u32 = 1;

    pub fn new(backend: &Arc<B>, binding_set: B::BindingSet, shaders: &ShaderPaths) -> Result<Self> {
        let pipeline = backend.create_ray_tracing_pipeline(binding_set, &shaders.groups(), Self::MAX_RECURSION_DEPTH)?;
        debug!(raygen = ?shaders.raygen, "created ray tracing pipeline");
        Ok(Self {
            backend: Arc::clone(backend),
            pipeline,
        })
    }

    /// One raygen, one miss and one triangle hit group, in that order.
    pub fn group_counts(&self) -> ShaderGroupCounts {
        ShaderGroupCounts::default()
    }

    pub fn pipeline(&self) -> B::Pipeline {
        self.pipeline
    }
}

impl<B: Backend> Drop for RayTracingPipeline<B> {
    fn drop(&mut self) {
        self.backend.destroy_pipeline(self.pipeline);
    }
}
