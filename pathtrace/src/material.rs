use crate::maths::Vec4;
use bytemuck::{Pod, Zeroable};
use std::mem;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    Lambertian = 0,
    Light = 1,
}

impl MaterialKind {
    /// Emitters are tagged by name in the source content.
    pub const LIGHT_NAME: &'static str = "Light";

    pub fn from_name(name: &str) -> Self {
        if name == Self::LIGHT_NAME {
            MaterialKind::Light
        } else {
            MaterialKind::Lambertian
        }
    }
}

/// Material as described by the asset loader.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDesc {
    pub name: String,
    pub base_color_factor: Vec4,
    pub base_color_texture: Option<u32>,
    pub normal_texture: Option<u32>,
}

impl MaterialDesc {
    pub fn new(name: impl Into<String>, base_color_factor: Vec4) -> Self {
        Self {
            name: name.into(),
            base_color_factor,
            base_color_texture: None,
            normal_texture: None,
        }
    }
}

/// Shader-side material, std430 layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct MaterialRecord {
    pub base_color: Vec4,
    pub base_color_texture_index: i32,
    pub normal_texture_index: i32,
    pub kind: u32,
    _pad: u32,
}

impl MaterialRecord {
    pub const SIZE: u64 = mem::size_of::<MaterialRecord>() as u64;

    pub fn new(desc: &MaterialDesc) -> Self {
        let texture_index = |index: Option<u32>| index.map_or(-1, |i| i as i32);
        Self {
            base_color: desc.base_color_factor,
            base_color_texture_index: texture_index(desc.base_color_texture),
            normal_texture_index: texture_index(desc.normal_texture),
            kind: MaterialKind::from_name(&desc.name) as u32,
            _pad: 0,
        }
    }

    pub fn kind(&self) -> MaterialKind {
        if self.kind == MaterialKind::Light as u32 {
            MaterialKind::Light
        } else {
            MaterialKind::Lambertian
        }
    }
}

/// The slice of the flat material table that belongs to one mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialRange {
    pub first: u32,
    pub count: u32,
}

impl MaterialRange {
    pub fn end(&self) -> u32 {
        self.first + self.count
    }
}

/// Flat material table for the whole scene plus the range owned by each mesh.
#[derive(Debug, Clone, Default)]
pub struct MaterialTable {
    records: Vec<MaterialRecord>,
    ranges: Vec<MaterialRange>,
}

impl MaterialTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the materials of the next mesh, returning its range.
    pub fn push_mesh<'a>(&mut self, materials: impl IntoIterator<Item = &'a MaterialDesc>) -> MaterialRange {
        let first = self.records.len() as u32;
        self.records.extend(materials.into_iter().map(MaterialRecord::new));
        let range = MaterialRange {
            first,
            count: self.records.len() as u32 - first,
        };
        self.ranges.push(range);
        range
    }

    pub fn records(&self) -> &[MaterialRecord] {
        &self.records
    }

    pub fn ranges(&self) -> &[MaterialRange] {
        &self.ranges
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_is_stable() {
        assert_eq!(MaterialRecord::SIZE, 32);
    }

    #[test]
    fn kind_follows_name() {
        let light = MaterialRecord::new(&MaterialDesc::new("Light", Vec4::one()));
        let wall = MaterialRecord::new(&MaterialDesc::new("Wall", Vec4::one()));
        let lowercase = MaterialRecord::new(&MaterialDesc::new("light", Vec4::one()));
        assert_eq!(light.kind(), MaterialKind::Light);
        assert_eq!(wall.kind(), MaterialKind::Lambertian);
        assert_eq!(lowercase.kind(), MaterialKind::Lambertian);
    }

    #[test]
    fn absent_textures_are_negative() {
        let mut desc = MaterialDesc::new("Wall", Vec4::new(0.5, 0.5, 0.5, 1.0));
        desc.normal_texture = Some(3);
        let record = MaterialRecord::new(&desc);
        assert_eq!(record.base_color_texture_index, -1);
        assert_eq!(record.normal_texture_index, 3);
        assert_eq!(record.base_color, Vec4::new(0.5, 0.5, 0.5, 1.0));
    }

    #[test]
    fn ranges_are_contiguous() {
        let desc = MaterialDesc::new("Wall", Vec4::one());
        let mut table = MaterialTable::new();
        let a = table.push_mesh(vec![&desc, &desc]);
        let b = table.push_mesh(vec![&desc; 3]);
        let c = table.push_mesh(Vec::new());
        assert_eq!(a, MaterialRange { first: 0, count: 2 });
        assert_eq!(b, MaterialRange { first: 2, count: 3 });
        assert_eq!(c, MaterialRange { first: 5, count: 0 });
        assert_eq!(table.records().len(), 5);
        assert_eq!(table.as_bytes().len(), 5 * 32);
    }
}
