use crate::backend::*;
use crate::error::{Error, Result};
use arrayvec::ArrayVec;
use std::sync::Arc;
use tracing::debug;

const MAX_BINDINGS: usize = 6;

/// Resources bound for dispatch once scene preparation has finished.
pub struct SceneBindings<'a, B: Backend> {
    pub top_level: B::AccelerationStructure,
    pub output_image: B::Image,
    pub accumulation_image: B::Image,
    pub uniform_buffer: B::Buffer,
    pub scene_descriptors: B::Buffer,
    pub textures: &'a [B::SampledImage],
}

/// Owns the dispatch binding set and keeps its slots in a fixed order.
pub struct DescriptorBinder<B: Backend> {
    backend: Arc<B>,
    binding_set: B::BindingSet,
    texture_count: u32,
    is_bound: bool,
}

impl<B: Backend> DescriptorBinder<B> {
    pub const TOP_LEVEL: u32 = 0;
    pub const OUTPUT_IMAGE: u32 = 1;
    pub const ACCUMULATION_IMAGE: u32 = 2;
    pub const UNIFORM_BUFFER: u32 = 3;
    pub const SCENE_DESCRIPTORS: u32 = 4;
    pub const TEXTURES: u32 = 5;

    /// Slot kinds in binding order; the texture array is only present when there are textures.
    pub fn layout(texture_count: u32) -> ArrayVec<BindingKind, MAX_BINDINGS> {
        let mut layout = ArrayVec::new();
        layout.push(BindingKind::AccelerationStructure);
        layout.push(BindingKind::StorageImage);
        layout.push(BindingKind::StorageImage);
        layout.push(BindingKind::UniformBuffer);
        layout.push(BindingKind::StorageBuffer);
        if texture_count > 0 {
            layout.push(BindingKind::SampledImageArray { count: texture_count });
        }
        layout
    }

    pub fn new(backend: &Arc<B>, texture_count: u32) -> Result<Self> {
        let binding_set = backend.create_binding_set(&Self::layout(texture_count))?;
        Ok(Self {
            backend: Arc::clone(backend),
            binding_set,
            texture_count,
            is_bound: false,
        })
    }

    pub fn binding_set(&self) -> B::BindingSet {
        self.binding_set
    }

    /// Writes every slot in a single update.
    pub fn bind(&mut self, bindings: &SceneBindings<B>) -> Result<()> {
        if bindings.textures.len() != self.texture_count as usize {
            return Err(Error::BuildOrderViolation(format!(
                "binding set was laid out for {} textures but {} were supplied",
                self.texture_count,
                bindings.textures.len()
            )));
        }

        let mut writes = ArrayVec::<BindingWrite<B>, MAX_BINDINGS>::new();
        writes.push(BindingWrite {
            binding: Self::TOP_LEVEL,
            data: BindingData::AccelerationStructure(bindings.top_level),
        });
        writes.push(BindingWrite {
            binding: Self::OUTPUT_IMAGE,
            data: BindingData::StorageImage(bindings.output_image),
        });
        writes.push(BindingWrite {
            binding: Self::ACCUMULATION_IMAGE,
            data: BindingData::StorageImage(bindings.accumulation_image),
        });
        writes.push(BindingWrite {
            binding: Self::UNIFORM_BUFFER,
            data: BindingData::UniformBuffer(bindings.uniform_buffer),
        });
        writes.push(BindingWrite {
            binding: Self::SCENE_DESCRIPTORS,
            data: BindingData::StorageBuffer(bindings.scene_descriptors),
        });
        if !bindings.textures.is_empty() {
            writes.push(BindingWrite {
                binding: Self::TEXTURES,
                data: BindingData::SampledImages(bindings.textures),
            });
        }

        self.backend.update_binding_set(self.binding_set, &writes);
        self.is_bound = true;
        debug!(binding_count = writes.len(), "bound scene resources");
        Ok(())
    }

    /// Points the image slots at new images after a resize; every other slot is left alone.
    pub fn rebind_images(&self, output_image: B::Image, accumulation_image: B::Image) -> Result<()> {
        if !self.is_bound {
            return Err(Error::BuildOrderViolation(
                "images rebound before the scene was bound".to_owned(),
            ));
        }
        self.backend.update_binding_set(
            self.binding_set,
            &[
                BindingWrite {
                    binding: Self::OUTPUT_IMAGE,
                    data: BindingData::StorageImage(output_image),
                },
                BindingWrite {
                    binding: Self::ACCUMULATION_IMAGE,
                    data: BindingData::StorageImage(accumulation_image),
                },
            ],
        );
        Ok(())
    }
}

impl<B: Backend> Drop for DescriptorBinder<B> {
    fn drop(&mut self) {
        self.backend.destroy_binding_set(self.binding_set);
    }
}
