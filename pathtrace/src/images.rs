use crate::backend::*;
use crate::error::Result;
use crate::maths::UVec2;
use std::sync::Arc;
use tracing::debug;

/// The dispatch targets: the displayable output and the running sample sum.
pub struct StorageImages<B: Backend> {
    backend: Arc<B>,
    size: UVec2,
    output: B::Image,
    accumulation: B::Image,
}

impl<B: Backend> StorageImages<B> {
    pub const OUTPUT_FORMAT: ImageFormat = ImageFormat::Rgba8Unorm;
    pub const ACCUMULATION_FORMAT: ImageFormat = ImageFormat::Rgba32Float;

    pub fn new(backend: &Arc<B>, size: UVec2) -> Result<Self> {
        let output = backend.create_storage_image(Self::OUTPUT_FORMAT, size)?;
        let accumulation = match backend.create_storage_image(Self::ACCUMULATION_FORMAT, size) {
            Ok(image) => image,
            Err(err) => {
                backend.destroy_image(output);
                return Err(err);
            }
        };
        debug!(width = size.x, height = size.y, "created storage images");
        Ok(Self {
            backend: Arc::clone(backend),
            size,
            output,
            accumulation,
        })
    }

    pub fn size(&self) -> UVec2 {
        self.size
    }

    pub fn output(&self) -> B::Image {
        self.output
    }

    pub fn accumulation(&self) -> B::Image {
        self.accumulation
    }
}

impl<B: Backend> Drop for StorageImages<B> {
    fn drop(&mut self) {
        self.backend.destroy_image(self.accumulation);
        self.backend.destroy_image(self.output);
    }
}
