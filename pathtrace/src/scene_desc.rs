use crate::accel::Mesh;
use crate::backend::*;
use crate::buffer::DeviceBuffer;
use crate::error::{Error, Result};
use crate::material::{MaterialRange, MaterialRecord};
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Per-mesh device pointers, indexed in shaders by instance custom index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroable, Pod)]
pub struct SceneDescriptorRecord {
    pub vertex_address: DeviceAddress,
    pub index_address: DeviceAddress,
    pub material_address: DeviceAddress,
}

/// Builds one record per mesh, in mesh order.
///
/// Each mesh must own the next contiguous range of the material table, so that
/// the material pointer of mesh `i` is the table base offset by the material
/// count of all earlier meshes.
pub fn scene_descriptor_records(
    meshes: &[Mesh],
    material_ranges: &[MaterialRange],
    material_base: DeviceAddress,
) -> Result<Vec<SceneDescriptorRecord>> {
    if meshes.len() != material_ranges.len() {
        return Err(Error::MaterialRangeMismatch(format!(
            "{} meshes but {} material ranges",
            meshes.len(),
            material_ranges.len()
        )));
    }

    let mut next_material = 0;
    meshes
        .iter()
        .zip(material_ranges.iter())
        .enumerate()
        .map(|(index, (mesh, range))| {
            if range.first != next_material {
                return Err(Error::MaterialRangeMismatch(format!(
                    "mesh {} materials start at {}, expected {}",
                    index, range.first, next_material
                )));
            }
            next_material = range.end();
            Ok(SceneDescriptorRecord {
                vertex_address: mesh.vertex_buffer,
                index_address: mesh.index_buffer,
                material_address: material_base + u64::from(range.first) * MaterialRecord::SIZE,
            })
        })
        .collect()
}

/// Immutable device buffer of scene descriptor records.
pub struct SceneDescriptorTable<B: Backend> {
    buffer: DeviceBuffer<B>,
    records: Vec<SceneDescriptorRecord>,
}

impl<B: Backend> SceneDescriptorTable<B> {
    #[instrument(skip_all, fields(mesh_count = meshes.len()))]
    pub fn assemble(
        backend: &Arc<B>,
        meshes: &[Mesh],
        material_ranges: &[MaterialRange],
        material_base: DeviceAddress,
    ) -> Result<Self> {
        let records = scene_descriptor_records(meshes, material_ranges, material_base)?;
        let buffer = DeviceBuffer::upload(
            backend,
            bytemuck::cast_slice(&records),
            BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
        )?;
        debug!(material_base, "assembled scene descriptors");
        Ok(Self { buffer, records })
    }

    pub fn buffer(&self) -> B::Buffer {
        self.buffer.buffer()
    }

    pub fn records(&self) -> &[SceneDescriptorRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maths::Transform3x4;

    fn mesh(n: u64) -> Mesh {
        Mesh {
            vertex_buffer: 0x1_0000 * n,
            vertex_stride: 32,
            vertex_count: 4,
            index_buffer: 0x1_0000 * n + 0x8000,
            index_count: 6,
            transform: Transform3x4::identity(),
        }
    }

    #[test]
    fn material_pointers_follow_cumulative_counts() {
        let meshes = [mesh(1), mesh(2), mesh(3)];
        let ranges = [
            MaterialRange { first: 0, count: 2 },
            MaterialRange { first: 2, count: 3 },
            MaterialRange { first: 5, count: 1 },
        ];
        let base = 0x40_0000;
        let records = scene_descriptor_records(&meshes, &ranges, base).unwrap();

        let offsets: Vec<_> = records.iter().map(|r| r.material_address - base).collect();
        assert_eq!(offsets, vec![0, 2 * MaterialRecord::SIZE, 5 * MaterialRecord::SIZE]);
        assert_eq!(records[1].vertex_address, 0x2_0000);
        assert_eq!(records[1].index_address, 0x2_8000);
    }

    #[test]
    fn gaps_between_ranges_are_rejected() {
        let meshes = [mesh(1), mesh(2)];
        let ranges = [MaterialRange { first: 0, count: 2 }, MaterialRange { first: 3, count: 1 }];
        assert!(matches!(
            scene_descriptor_records(&meshes, &ranges, 0),
            Err(Error::MaterialRangeMismatch(_))
        ));
    }

    #[test]
    fn range_count_must_match_meshes() {
        let meshes = [mesh(1)];
        assert!(matches!(
            scene_descriptor_records(&meshes, &[], 0),
            Err(Error::MaterialRangeMismatch(_))
        ));
    }
}
