use crate::backend::*;
use crate::buffer::DeviceBuffer;
use crate::error::{Error, Result};
use crate::maths::AlignUp;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingRegion {
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

impl ShaderBindingRegion {
    pub fn into_device_address_region(self, base_device_address: DeviceAddress) -> StridedRegion {
        StridedRegion {
            device_address: base_device_address + u64::from(self.offset),
            stride: u64::from(self.stride),
            size: u64::from(self.size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
}

impl ShaderGroupCounts {
    pub fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit
    }
}

impl Default for ShaderGroupCounts {
    fn default() -> Self {
        Self {
            raygen: 1,
            miss: 1,
            hit: 1,
        }
    }
}

/// Placement of the raygen, miss and hit records within one table buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBindingTableLayout {
    pub raygen: ShaderBindingRegion,
    pub miss: ShaderBindingRegion,
    pub hit: ShaderBindingRegion,
    pub counts: ShaderGroupCounts,
    pub handle_size: u32,
    pub size: u32,
}

impl ShaderBindingTableLayout {
    /// Fails for device properties that cannot describe a table.
    pub fn new(counts: ShaderGroupCounts, rtpp: &RayTracingProperties) -> Result<Self> {
        if rtpp.shader_group_handle_size == 0
            || !rtpp.shader_group_handle_alignment.is_power_of_two()
            || !rtpp.shader_group_base_alignment.is_power_of_two()
        {
            return Err(Error::backend(
                "ray_tracing_properties",
                format!(
                    "unusable shader group handle size {} with alignments {} and {}",
                    rtpp.shader_group_handle_size,
                    rtpp.shader_group_handle_alignment,
                    rtpp.shader_group_base_alignment
                ),
            ));
        }

        let mut next_offset = 0;
        let mut region = |count: u32| {
            let stride = rtpp
                .shader_group_handle_size
                .align_up(rtpp.shader_group_handle_alignment);
            let region = ShaderBindingRegion {
                offset: next_offset,
                stride,
                size: count * stride,
            };
            next_offset += region.size.align_up(rtpp.shader_group_base_alignment);
            region
        };

        let raygen = region(counts.raygen);
        let miss = region(counts.miss);
        let hit = region(counts.hit);

        Ok(Self {
            raygen,
            miss,
            hit,
            counts,
            handle_size: rtpp.shader_group_handle_size,
            size: next_offset,
        })
    }

    /// Scatters tightly packed group handles, in raygen, miss, hit order, into table memory.
    pub fn fill(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = (self.counts.total() as usize) * handle_size;
        if handle_size == 0 {
            return Err(Error::backend(
                "get_ray_tracing_shader_group_handles",
                "shader group handle size is zero",
            ));
        }
        if handles.len() < expected {
            return Err(Error::backend(
                "get_ray_tracing_shader_group_handles",
                format!("returned {} bytes, expected {}", handles.len(), expected),
            ));
        }

        let mut data = vec![0u8; self.size as usize];
        let mut src = handles.chunks_exact(handle_size);
        for (region, count) in [
            (self.raygen, self.counts.raygen),
            (self.miss, self.counts.miss),
            (self.hit, self.counts.hit),
        ] {
            for (index, handle) in src.by_ref().take(count as usize).enumerate() {
                let offset = (region.offset + (index as u32) * region.stride) as usize;
                data[offset..offset + handle_size].copy_from_slice(handle);
            }
        }
        Ok(data)
    }
}

pub struct ShaderBindingTable<B: Backend> {
    buffer: DeviceBuffer<B>,
    layout: ShaderBindingTableLayout,
}

impl<B: Backend> ShaderBindingTable<B> {
    pub fn new(backend: &Arc<B>, pipeline: B::Pipeline, counts: ShaderGroupCounts) -> Result<Self> {
        let layout = ShaderBindingTableLayout::new(counts, &backend.ray_tracing_properties())?;
        let handles = backend.shader_group_handles(pipeline, counts.total())?;
        let data = layout.fill(&handles)?;
        let buffer = DeviceBuffer::with_data(
            backend,
            &data,
            BufferUsage::SHADER_BINDING_TABLE | BufferUsage::DEVICE_ADDRESS,
        )?;
        debug!(size = layout.size, "created shader binding table");
        Ok(Self { buffer, layout })
    }

    pub fn layout(&self) -> &ShaderBindingTableLayout {
        &self.layout
    }

    pub fn trace_regions(&self) -> TraceRegions {
        let base = self.buffer.device_address().unwrap_or_default();
        TraceRegions {
            raygen: self.layout.raygen.into_device_address_region(base),
            miss: self.layout.miss.into_device_address_region(base),
            hit: self.layout.hit.into_device_address_region(base),
            callable: StridedRegion::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: 16,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
        }
    }

    #[test]
    fn regions_use_aligned_stride() {
        let layout = ShaderBindingTableLayout::new(ShaderGroupCounts::default(), &properties()).unwrap();
        assert_eq!(layout.raygen, ShaderBindingRegion { offset: 0, stride: 32, size: 32 });
        assert_eq!(layout.miss, ShaderBindingRegion { offset: 64, stride: 32, size: 32 });
        assert_eq!(layout.hit, ShaderBindingRegion { offset: 128, stride: 32, size: 32 });
        assert_eq!(layout.size, 192);
    }

    #[test]
    fn hit_region_grows_with_group_count() {
        let counts = ShaderGroupCounts { hit: 3, ..Default::default() };
        let layout = ShaderBindingTableLayout::new(counts, &properties()).unwrap();
        assert_eq!(layout.hit.size, 96);
        assert_eq!(layout.size, 128 + 128);
    }

    #[test]
    fn handles_land_at_record_offsets() {
        let layout = ShaderBindingTableLayout::new(ShaderGroupCounts::default(), &properties()).unwrap();
        let handles: Vec<u8> = (0..3u8).flat_map(|i| std::iter::repeat(i + 1).take(16)).collect();
        let data = layout.fill(&handles).unwrap();
        assert!(data[0..16].iter().all(|&b| b == 1));
        assert!(data[16..64].iter().all(|&b| b == 0));
        assert!(data[64..80].iter().all(|&b| b == 2));
        assert!(data[128..144].iter().all(|&b| b == 3));
    }

    #[test]
    fn zero_handle_size_is_rejected() {
        let rtpp = RayTracingProperties {
            shader_group_handle_size: 0,
            ..properties()
        };
        assert!(matches!(
            ShaderBindingTableLayout::new(ShaderGroupCounts::default(), &rtpp),
            Err(Error::Backend { .. })
        ));
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        let rtpp = RayTracingProperties {
            shader_group_base_alignment: 48,
            ..properties()
        };
        assert!(ShaderBindingTableLayout::new(ShaderGroupCounts::default(), &rtpp).is_err());
    }

    #[test]
    fn short_handle_data_is_an_error() {
        let layout = ShaderBindingTableLayout::new(ShaderGroupCounts::default(), &properties()).unwrap();
        assert!(layout.fill(&[0u8; 20]).is_err());
    }
}
