//! Descriptor structures nested inside commands.

use serde::Serialize;

use crate::codec::{
    self, DeserializeAllocator, Decode, IdProvider, Layout, MapObjects, Role, Transfer,
};
use crate::cursor::{ByteCursor, WireWriter};
use crate::error::WireResult;
use crate::handle::{ObjectHandle, ObjectKind};
use crate::types::{BindingType, TextureFormat};

/// Header bytes of an optional string: `has` flag plus length.
const OPT_STR: usize = 1 + 8;

/// Payload size of an optional string.
fn opt_str_len(s: Option<&String>) -> usize {
    s.map_or(0, String::len)
}

/// Describes a buffer to create.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BufferDescriptor {
    /// Debug label.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// [`BufferUsage`](crate::BufferUsage) flags.
    pub usage: u32,
    /// Whether the buffer starts mapped for writing.
    pub mapped_at_creation: bool,
}

impl Layout for BufferDescriptor {
    const HEADER_SIZE: usize = 8 + 4 + 1 + OPT_STR;
}

impl<O> Transfer<O> for BufferDescriptor {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(opt_str_len(self.label.as_ref()))
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_u64(self.size)?;
        header.put_u32(self.usage)?;
        header.put_bool(self.mapped_at_creation)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        if let Some(label) = &self.label {
            payload.put_bytes(label.as_bytes())?;
        }
        Ok(())
    }
}

impl Decode for BufferDescriptor {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let size = header.read_u64()?;
        let usage = header.read_u32()?;
        let mapped_at_creation = header.read_bool()?;
        let label_len = codec::read_optional_str_header(header)?;
        let label = codec::read_optional_string(payload, label_len, alloc)?;
        Ok(Self {
            label,
            size,
            usage,
            mapped_at_creation,
        })
    }
}

/// Describes a texture to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextureDescriptor {
    /// Debug label.
    pub label: Option<String>,
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth or number of array layers.
    pub depth_or_array_layers: u32,
    /// Number of mip levels.
    pub mip_level_count: u32,
    /// Texel format.
    pub format: TextureFormat,
    /// [`TextureUsage`](crate::TextureUsage) flags.
    pub usage: u32,
}

impl Layout for TextureDescriptor {
    const HEADER_SIZE: usize = 6 * 4 + OPT_STR;
}

impl<O> Transfer<O> for TextureDescriptor {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(opt_str_len(self.label.as_ref()))
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_u32(self.width)?;
        header.put_u32(self.height)?;
        header.put_u32(self.depth_or_array_layers)?;
        header.put_u32(self.mip_level_count)?;
        header.put_u32(self.format.to_u32())?;
        header.put_u32(self.usage)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        if let Some(label) = &self.label {
            payload.put_bytes(label.as_bytes())?;
        }
        Ok(())
    }
}

impl Decode for TextureDescriptor {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let width = header.read_u32()?;
        let height = header.read_u32()?;
        let depth_or_array_layers = header.read_u32()?;
        let mip_level_count = header.read_u32()?;
        let format = TextureFormat::from_u32(header.read_u32()?)?;
        let usage = header.read_u32()?;
        let label_len = codec::read_optional_str_header(header)?;
        Ok(Self {
            label: codec::read_optional_string(payload, label_len, alloc)?,
            width,
            height,
            depth_or_array_layers,
            mip_level_count,
            format,
            usage,
        })
    }
}

/// Describes a view onto a texture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextureViewDescriptor {
    /// Debug label.
    pub label: Option<String>,
    /// Format of the view.
    pub format: TextureFormat,
    /// First visible mip level.
    pub base_mip_level: u32,
    /// Number of visible mip levels.
    pub mip_level_count: u32,
}

impl Layout for TextureViewDescriptor {
    const HEADER_SIZE: usize = 3 * 4 + OPT_STR;
}

impl<O> Transfer<O> for TextureViewDescriptor {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(opt_str_len(self.label.as_ref()))
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_u32(self.format.to_u32())?;
        header.put_u32(self.base_mip_level)?;
        header.put_u32(self.mip_level_count)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        if let Some(label) = &self.label {
            payload.put_bytes(label.as_bytes())?;
        }
        Ok(())
    }
}

impl Decode for TextureViewDescriptor {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let format = TextureFormat::from_u32(header.read_u32()?)?;
        let base_mip_level = header.read_u32()?;
        let mip_level_count = header.read_u32()?;
        let label_len = codec::read_optional_str_header(header)?;
        Ok(Self {
            label: codec::read_optional_string(payload, label_len, alloc)?,
            format,
            base_mip_level,
            mip_level_count,
        })
    }
}

/// One slot of a bind group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindGroupLayoutEntry {
    /// Binding number.
    pub binding: u32,
    /// [`ShaderStage`](crate::ShaderStage) flags.
    pub visibility: u32,
    /// Kind of resource bound here.
    pub binding_type: BindingType,
}

impl Layout for BindGroupLayoutEntry {
    const HEADER_SIZE: usize = 3 * 4;
}

impl<O> Transfer<O> for BindGroupLayoutEntry {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_u32(self.binding)?;
        header.put_u32(self.visibility)?;
        header.put_u32(self.binding_type.to_u32())
    }
}

impl Decode for BindGroupLayoutEntry {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            binding: header.read_u32()?,
            visibility: header.read_u32()?,
            binding_type: BindingType::from_u32(header.read_u32()?)?,
        })
    }
}

/// One resource bound in a bind group. Exactly one of `buffer` and
/// `texture_view` is expected; the backend validates that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindGroupEntry<O = ObjectHandle> {
    /// Binding number.
    pub binding: u32,
    /// Bound buffer.
    pub buffer: Option<O>,
    /// Offset into `buffer`.
    pub offset: u64,
    /// Bound size of `buffer`.
    pub size: u64,
    /// Bound texture view.
    pub texture_view: Option<O>,
}

impl<O> Layout for BindGroupEntry<O> {
    const HEADER_SIZE: usize = 4 + ObjectHandle::SIZE + 8 + 8 + ObjectHandle::SIZE;
}

impl<O> Transfer<O> for BindGroupEntry<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_u32(self.binding)?;
        codec::put_optional_object(header, ObjectKind::Buffer, self.buffer.as_ref(), ids)?;
        header.put_u64(self.offset)?;
        header.put_u64(self.size)?;
        codec::put_optional_object(
            header,
            ObjectKind::TextureView,
            self.texture_view.as_ref(),
            ids,
        )
    }
}

impl Decode for BindGroupEntry {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            binding: header.read_u32()?,
            buffer: codec::read_optional_object(header)?,
            offset: header.read_u64()?,
            size: header.read_u64()?,
            texture_view: codec::read_optional_object(header)?,
        })
    }
}

impl MapObjects for BindGroupEntry {
    type Mapped<T> = BindGroupEntry<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<BindGroupEntry<T>, E> {
        Ok(BindGroupEntry {
            binding: self.binding,
            buffer: codec::map_optional(ObjectKind::Buffer, self.buffer, f)?,
            offset: self.offset,
            size: self.size,
            texture_view: codec::map_optional(ObjectKind::TextureView, self.texture_view, f)?,
        })
    }
}

/// A pipeline-overridable constant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstantEntry {
    /// Name of the override.
    pub key: String,
    /// Value of the override.
    pub value: f64,
}

impl Layout for ConstantEntry {
    const HEADER_SIZE: usize = 8 + 8;
}

impl<O> Transfer<O> for ConstantEntry {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.key.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_f64(self.value)?;
        header.put_len(self.key.len())?;
        payload.put_bytes(self.key.as_bytes())
    }
}

impl Decode for ConstantEntry {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let value = header.read_f64()?;
        let key_len = header.read_len()?;
        Ok(Self {
            key: codec::read_string(payload, key_len, alloc)?,
            value,
        })
    }
}

/// Shader entry point of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgrammableStage<O = ObjectHandle> {
    /// Module holding the entry point.
    pub module: O,
    /// Name of the entry point.
    pub entry_point: String,
    /// Overridable constants.
    pub constants: Vec<ConstantEntry>,
}

impl<O> Layout for ProgrammableStage<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 8 + 8;
}

impl<O> Transfer<O> for ProgrammableStage<O> {
    fn extra_size(&self) -> WireResult<usize> {
        let constants = codec::records_extra_size::<O, _>(&self.constants)?;
        codec::sum_sizes([Ok(self.entry_point.len()), Ok(constants)])
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::ShaderModule, &self.module, ids)?;
        header.put_len(self.entry_point.len())?;
        header.put_len(self.constants.len())?;
        payload.put_bytes(self.entry_point.as_bytes())?;
        codec::put_records(payload, &self.constants, ids)
    }
}

impl Decode for ProgrammableStage {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let module = codec::read_object(header, ObjectKind::ShaderModule)?;
        let entry_point_len = header.read_len()?;
        let constant_count = header.read_len()?;
        let entry_point = codec::read_string(payload, entry_point_len, alloc)?;
        let constants = codec::read_records(payload, constant_count, alloc)?;
        Ok(Self {
            module,
            entry_point,
            constants,
        })
    }
}

impl MapObjects for ProgrammableStage {
    type Mapped<T> = ProgrammableStage<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<ProgrammableStage<T>, E> {
        Ok(ProgrammableStage {
            module: f(ObjectKind::ShaderModule, self.module, Role::Argument)?,
            entry_point: self.entry_point,
            constants: self.constants,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HandleIds;

    fn encode_nested<T: Transfer<ObjectHandle>>(record: &T) -> Vec<u8> {
        let size = T::HEADER_SIZE + record.extra_size().unwrap();
        let mut buf = vec![0u8; size];
        let mut w = WireWriter::new(&mut buf);
        let mut header = w.split(T::HEADER_SIZE).unwrap();
        record.serialize(&mut header, &mut w, &HandleIds).unwrap();
        assert!(header.is_full() && w.is_full());
        buf
    }

    fn decode_nested<T: Decode>(bytes: &[u8]) -> WireResult<T> {
        let mut c = ByteCursor::new(bytes);
        let mut header = c.split(T::HEADER_SIZE)?;
        let mut alloc = DeserializeAllocator::new(1 << 20);
        T::deserialize(&mut header, &mut c, &mut alloc)
    }

    #[test]
    fn label_size_is_header_plus_bytes() {
        let desc = BufferDescriptor {
            label: Some("hello".into()),
            size: 4,
            ..Default::default()
        };
        assert_eq!(
            Transfer::<ObjectHandle>::extra_size(&desc).unwrap(),
            5
        );
        assert_eq!(encode_nested(&desc).len(), BufferDescriptor::HEADER_SIZE + 5);
    }

    #[test]
    fn stage_with_nested_constants() {
        let stage = ProgrammableStage {
            module: ObjectHandle::new(2, 1),
            entry_point: "main".into(),
            constants: vec![
                ConstantEntry {
                    key: "a".into(),
                    value: 1.5,
                },
                ConstantEntry {
                    key: "width".into(),
                    value: -2.0,
                },
            ],
        };
        let bytes = encode_nested(&stage);
        assert_eq!(
            bytes.len(),
            ProgrammableStage::<ObjectHandle>::HEADER_SIZE + 4 + 2 * ConstantEntry::HEADER_SIZE + 1 + 5
        );
        assert_eq!(decode_nested::<ProgrammableStage>(&bytes).unwrap(), stage);
    }

    #[test]
    fn constant_count_past_payload_is_truncation() {
        let stage = ProgrammableStage {
            module: ObjectHandle::new(2, 1),
            entry_point: String::new(),
            constants: vec![],
        };
        let mut bytes = encode_nested(&stage);
        // Claim a billion constants with an empty payload.
        bytes[16..24].copy_from_slice(&1_000_000_000u64.to_le_bytes());
        assert!(matches!(
            decode_nested::<ProgrammableStage>(&bytes),
            Err(crate::WireError::Truncated { .. })
        ));
    }

    #[test]
    fn texture_descriptors_roundtrip() {
        let texture = TextureDescriptor {
            label: None,
            width: 16,
            height: 8,
            depth_or_array_layers: 6,
            mip_level_count: 1,
            format: TextureFormat::Depth32Float,
            usage: crate::TextureUsage::COPY_SRC,
        };
        let bytes = encode_nested(&texture);
        assert_eq!(bytes.len(), TextureDescriptor::HEADER_SIZE);
        assert_eq!(decode_nested::<TextureDescriptor>(&bytes).unwrap(), texture);

        let view = TextureViewDescriptor {
            label: Some("mip1".into()),
            format: TextureFormat::Depth32Float,
            base_mip_level: 1,
            mip_level_count: 1,
        };
        let bytes = encode_nested(&view);
        assert_eq!(bytes.len(), TextureViewDescriptor::HEADER_SIZE + 4);
        assert_eq!(decode_nested::<TextureViewDescriptor>(&bytes).unwrap(), view);
    }

    #[test]
    fn layout_entry_roundtrips_and_rejects_unknown_binding_type() {
        let entry = BindGroupLayoutEntry {
            binding: 2,
            visibility: crate::ShaderStage::COMPUTE,
            binding_type: BindingType::ReadOnlyStorageBuffer,
        };
        let mut bytes = encode_nested(&entry);
        assert_eq!(decode_nested::<BindGroupLayoutEntry>(&bytes).unwrap(), entry);

        bytes[8..12].copy_from_slice(&77u32.to_le_bytes());
        assert!(matches!(
            decode_nested::<BindGroupLayoutEntry>(&bytes),
            Err(crate::WireError::InvalidValue(_))
        ));
    }

    #[test]
    fn optional_objects_use_null_id() {
        let entry = BindGroupEntry {
            binding: 0,
            buffer: Some(ObjectHandle::new(4, 2)),
            offset: 0,
            size: 16,
            texture_view: None,
        };
        let bytes = encode_nested(&entry);
        assert_eq!(&bytes[28..36], &[0; 8]);
        assert_eq!(decode_nested::<BindGroupEntry>(&bytes).unwrap(), entry);
    }
}
