//! Forward commands: client to server.
//!
//! Every command is generic over the in-memory object representation `O`.
//! Decoding always produces `O = ObjectHandle`; [`resolve`](crate::resolve)
//! turns that into the server's own object type.

use serde::Serialize;

use crate::codec::{
    self, Command, Decode, DeserializeAllocator, IdProvider, Layout, MapObjects, Role, Transfer,
};
use crate::cursor::{ByteCursor, WireWriter};
use crate::error::{WireError, WireResult};
use crate::handle::{ObjectHandle, ObjectKind};
use crate::structs::{
    BindGroupEntry, BindGroupLayoutEntry, BufferDescriptor, ProgrammableStage,
    TextureDescriptor, TextureViewDescriptor,
};
use crate::types::{ErrorFilter, ErrorType};

/// Header bytes of an optional string: `has` flag plus length.
const OPT_STR: usize = 1 + 8;

/// Header bytes of a `self` handle plus a `result` handle.
const SELF_AND_RESULT: usize = 2 * ObjectHandle::SIZE;

/// Payload size of an optional string.
fn opt_str_len(s: Option<&String>) -> usize {
    s.map_or(0, String::len)
}

/// Writes the payload bytes of an optional string.
fn put_opt_str(payload: &mut WireWriter<'_>, s: Option<&String>) -> WireResult<()> {
    s.map_or(Ok(()), |s| payload.put_bytes(s.as_bytes()))
}

command_set! {
    /// Tag of a forward command. `0` is never used.
    tag CommandTag;
    /// Any decoded forward command, objects still expressed as handles.
    union ForwardCommand;

    DeviceGetQueue = 1,
    DeviceCreateBuffer = 2,
    DeviceCreateTexture = 3,
    TextureCreateView = 4,
    DeviceCreateShaderModule = 5,
    DeviceCreateBindGroupLayout = 6,
    DeviceCreatePipelineLayout = 7,
    DeviceCreateBindGroup = 8,
    DeviceCreateComputePipeline = 9,
    DeviceCreateCommandEncoder = 10,
    CommandEncoderCopyBufferToBuffer = 11,
    CommandEncoderFinish = 12,
    QueueSubmit = 13,
    QueueWriteBuffer = 14,
    BufferMapAsync = 15,
    BufferUpdateMappedData = 16,
    BufferUnmap = 17,
    DestroyObject = 18,
    DevicePushErrorScope = 19,
    DevicePopErrorScope = 20,
    DeviceInjectError = 21,
}

/// Returns the device's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceGetQueue<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the queue.
    pub result: ObjectHandle,
}

impl<O> Layout for DeviceGetQueue<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT;
}

impl<O> Command for DeviceGetQueue<O> {
    const TAG: u32 = CommandTag::DeviceGetQueue as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::Queue, self.result))
    }
}

impl<O> Transfer<O> for DeviceGetQueue<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)
    }
}

impl Decode for DeviceGetQueue {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            device: codec::read_object(header, ObjectKind::Device)?,
            result: codec::read_result(header, ObjectKind::Queue)?,
        })
    }
}

impl MapObjects for DeviceGetQueue {
    type Mapped<T> = DeviceGetQueue<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceGetQueue<T>, E> {
        Ok(DeviceGetQueue {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
        })
    }
}

/// Creates a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCreateBuffer<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the buffer.
    pub result: ObjectHandle,
    /// What to create.
    pub descriptor: BufferDescriptor,
}

impl<O> Layout for DeviceCreateBuffer<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + BufferDescriptor::HEADER_SIZE;
}

impl<O> Command for DeviceCreateBuffer<O> {
    const TAG: u32 = CommandTag::DeviceCreateBuffer as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::Buffer, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreateBuffer<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Transfer::<O>::extra_size(&self.descriptor)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        Transfer::<O>::serialize(&self.descriptor, header, payload, ids)
    }
}

impl Decode for DeviceCreateBuffer {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            device: codec::read_object(header, ObjectKind::Device)?,
            result: codec::read_result(header, ObjectKind::Buffer)?,
            descriptor: BufferDescriptor::deserialize(header, payload, alloc)?,
        })
    }
}

impl MapObjects for DeviceCreateBuffer {
    type Mapped<T> = DeviceCreateBuffer<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreateBuffer<T>, E> {
        Ok(DeviceCreateBuffer {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
            descriptor: self.descriptor,
        })
    }
}

/// Creates a texture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCreateTexture<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the texture.
    pub result: ObjectHandle,
    /// What to create.
    pub descriptor: TextureDescriptor,
}

impl<O> Layout for DeviceCreateTexture<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + TextureDescriptor::HEADER_SIZE;
}

impl<O> Command for DeviceCreateTexture<O> {
    const TAG: u32 = CommandTag::DeviceCreateTexture as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::Texture, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreateTexture<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Transfer::<O>::extra_size(&self.descriptor)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        Transfer::<O>::serialize(&self.descriptor, header, payload, ids)
    }
}

impl Decode for DeviceCreateTexture {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            device: codec::read_object(header, ObjectKind::Device)?,
            result: codec::read_result(header, ObjectKind::Texture)?,
            descriptor: TextureDescriptor::deserialize(header, payload, alloc)?,
        })
    }
}

impl MapObjects for DeviceCreateTexture {
    type Mapped<T> = DeviceCreateTexture<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreateTexture<T>, E> {
        Ok(DeviceCreateTexture {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
            descriptor: self.descriptor,
        })
    }
}

/// Creates a view onto a texture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextureCreateView<O = ObjectHandle> {
    /// Texture the call is made on.
    pub texture: O,
    /// Handle chosen for the view.
    pub result: ObjectHandle,
    /// What to create.
    pub descriptor: TextureViewDescriptor,
}

impl<O> Layout for TextureCreateView<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + TextureViewDescriptor::HEADER_SIZE;
}

impl<O> Command for TextureCreateView<O> {
    const TAG: u32 = CommandTag::TextureCreateView as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::TextureView, self.result))
    }
}

impl<O> Transfer<O> for TextureCreateView<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Transfer::<O>::extra_size(&self.descriptor)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Texture, &self.texture, ids)?;
        header.put_handle(self.result)?;
        Transfer::<O>::serialize(&self.descriptor, header, payload, ids)
    }
}

impl Decode for TextureCreateView {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            texture: codec::read_object(header, ObjectKind::Texture)?,
            result: codec::read_result(header, ObjectKind::TextureView)?,
            descriptor: TextureViewDescriptor::deserialize(header, payload, alloc)?,
        })
    }
}

impl MapObjects for TextureCreateView {
    type Mapped<T> = TextureCreateView<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<TextureCreateView<T>, E> {
        Ok(TextureCreateView {
            texture: f(ObjectKind::Texture, self.texture, Role::Target)?,
            result: self.result,
            descriptor: self.descriptor,
        })
    }
}

/// Compiles a shader module from source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCreateShaderModule<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the module.
    pub result: ObjectHandle,
    /// Debug label.
    pub label: Option<String>,
    /// Shader source.
    pub code: String,
}

impl<O> Layout for DeviceCreateShaderModule<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + OPT_STR + 8;
}

impl<O> Command for DeviceCreateShaderModule<O> {
    const TAG: u32 = CommandTag::DeviceCreateShaderModule as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::ShaderModule, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreateShaderModule<O> {
    fn extra_size(&self) -> WireResult<usize> {
        codec::sum_sizes([Ok(opt_str_len(self.label.as_ref())), Ok(self.code.len())])
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        header.put_len(self.code.len())?;
        put_opt_str(payload, self.label.as_ref())?;
        payload.put_bytes(self.code.as_bytes())
    }
}

impl Decode for DeviceCreateShaderModule {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let result = codec::read_result(header, ObjectKind::ShaderModule)?;
        let label_len = codec::read_optional_str_header(header)?;
        let code_len = header.read_len()?;
        Ok(Self {
            device,
            result,
            label: codec::read_optional_string(payload, label_len, alloc)?,
            code: codec::read_string(payload, code_len, alloc)?,
        })
    }
}

impl MapObjects for DeviceCreateShaderModule {
    type Mapped<T> = DeviceCreateShaderModule<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreateShaderModule<T>, E> {
        Ok(DeviceCreateShaderModule {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
            label: self.label,
            code: self.code,
        })
    }
}

/// Creates a bind group layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCreateBindGroupLayout<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the layout.
    pub result: ObjectHandle,
    /// Debug label.
    pub label: Option<String>,
    /// Binding slots.
    pub entries: Vec<BindGroupLayoutEntry>,
}

impl<O> Layout for DeviceCreateBindGroupLayout<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + OPT_STR + 8;
}

impl<O> Command for DeviceCreateBindGroupLayout<O> {
    const TAG: u32 = CommandTag::DeviceCreateBindGroupLayout as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::BindGroupLayout, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreateBindGroupLayout<O> {
    fn extra_size(&self) -> WireResult<usize> {
        codec::sum_sizes([
            Ok(opt_str_len(self.label.as_ref())),
            codec::records_extra_size::<O, _>(&self.entries),
        ])
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        header.put_len(self.entries.len())?;
        put_opt_str(payload, self.label.as_ref())?;
        codec::put_records(payload, &self.entries, ids)
    }
}

impl Decode for DeviceCreateBindGroupLayout {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let result = codec::read_result(header, ObjectKind::BindGroupLayout)?;
        let label_len = codec::read_optional_str_header(header)?;
        let entry_count = header.read_len()?;
        Ok(Self {
            device,
            result,
            label: codec::read_optional_string(payload, label_len, alloc)?,
            entries: codec::read_records(payload, entry_count, alloc)?,
        })
    }
}

impl MapObjects for DeviceCreateBindGroupLayout {
    type Mapped<T> = DeviceCreateBindGroupLayout<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreateBindGroupLayout<T>, E> {
        Ok(DeviceCreateBindGroupLayout {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
            label: self.label,
            entries: self.entries,
        })
    }
}

/// Creates a pipeline layout from bind group layouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCreatePipelineLayout<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the layout.
    pub result: ObjectHandle,
    /// Debug label.
    pub label: Option<String>,
    /// One layout per bind group index.
    pub bind_group_layouts: Vec<O>,
}

impl<O> Layout for DeviceCreatePipelineLayout<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + OPT_STR + 8;
}

impl<O> Command for DeviceCreatePipelineLayout<O> {
    const TAG: u32 = CommandTag::DeviceCreatePipelineLayout as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::PipelineLayout, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreatePipelineLayout<O> {
    fn extra_size(&self) -> WireResult<usize> {
        codec::sum_sizes([
            Ok(opt_str_len(self.label.as_ref())),
            codec::array_size(self.bind_group_layouts.len(), ObjectHandle::SIZE),
        ])
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        header.put_len(self.bind_group_layouts.len())?;
        put_opt_str(payload, self.label.as_ref())?;
        codec::put_object_array(
            payload,
            ObjectKind::BindGroupLayout,
            &self.bind_group_layouts,
            ids,
        )
    }
}

impl Decode for DeviceCreatePipelineLayout {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let result = codec::read_result(header, ObjectKind::PipelineLayout)?;
        let label_len = codec::read_optional_str_header(header)?;
        let layout_count = header.read_len()?;
        Ok(Self {
            device,
            result,
            label: codec::read_optional_string(payload, label_len, alloc)?,
            bind_group_layouts: codec::read_object_array(
                payload,
                ObjectKind::BindGroupLayout,
                layout_count,
                alloc,
            )?,
        })
    }
}

impl MapObjects for DeviceCreatePipelineLayout {
    type Mapped<T> = DeviceCreatePipelineLayout<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreatePipelineLayout<T>, E> {
        Ok(DeviceCreatePipelineLayout {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
            label: self.label,
            bind_group_layouts: codec::map_object_array(
                ObjectKind::BindGroupLayout,
                self.bind_group_layouts,
                f,
            )?,
        })
    }
}

/// Creates a bind group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCreateBindGroup<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the bind group.
    pub result: ObjectHandle,
    /// Layout the group conforms to.
    pub layout: O,
    /// Debug label.
    pub label: Option<String>,
    /// Bound resources.
    pub entries: Vec<BindGroupEntry<O>>,
}

impl<O> Layout for DeviceCreateBindGroup<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + ObjectHandle::SIZE + OPT_STR + 8;
}

impl<O> Command for DeviceCreateBindGroup<O> {
    const TAG: u32 = CommandTag::DeviceCreateBindGroup as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::BindGroup, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreateBindGroup<O> {
    fn extra_size(&self) -> WireResult<usize> {
        codec::sum_sizes([
            Ok(opt_str_len(self.label.as_ref())),
            codec::records_extra_size::<O, _>(&self.entries),
        ])
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        codec::put_object(header, ObjectKind::BindGroupLayout, &self.layout, ids)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        header.put_len(self.entries.len())?;
        put_opt_str(payload, self.label.as_ref())?;
        codec::put_records(payload, &self.entries, ids)
    }
}

impl Decode for DeviceCreateBindGroup {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let result = codec::read_result(header, ObjectKind::BindGroup)?;
        let layout = codec::read_object(header, ObjectKind::BindGroupLayout)?;
        let label_len = codec::read_optional_str_header(header)?;
        let entry_count = header.read_len()?;
        Ok(Self {
            device,
            result,
            layout,
            label: codec::read_optional_string(payload, label_len, alloc)?,
            entries: codec::read_records(payload, entry_count, alloc)?,
        })
    }
}

impl MapObjects for DeviceCreateBindGroup {
    type Mapped<T> = DeviceCreateBindGroup<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreateBindGroup<T>, E> {
        let device = f(ObjectKind::Device, self.device, Role::Target)?;
        let layout = f(ObjectKind::BindGroupLayout, self.layout, Role::Argument)?;
        let entries = self
            .entries
            .into_iter()
            .map(|e| e.map_objects(&mut *f))
            .collect::<Result<_, E>>()?;
        Ok(DeviceCreateBindGroup {
            device,
            result: self.result,
            layout,
            label: self.label,
            entries,
        })
    }
}

/// Creates a compute pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCreateComputePipeline<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the pipeline.
    pub result: ObjectHandle,
    /// Explicit layout; derived from the shader when absent.
    pub layout: Option<O>,
    /// Debug label.
    pub label: Option<String>,
    /// Compute stage.
    pub compute: ProgrammableStage<O>,
}

impl<O> Layout for DeviceCreateComputePipeline<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT
        + ObjectHandle::SIZE
        + OPT_STR
        + ProgrammableStage::<ObjectHandle>::HEADER_SIZE;
}

impl<O> Command for DeviceCreateComputePipeline<O> {
    const TAG: u32 = CommandTag::DeviceCreateComputePipeline as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::ComputePipeline, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreateComputePipeline<O> {
    fn extra_size(&self) -> WireResult<usize> {
        codec::sum_sizes([
            Ok(opt_str_len(self.label.as_ref())),
            self.compute.extra_size(),
        ])
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        codec::put_optional_object(header, ObjectKind::PipelineLayout, self.layout.as_ref(), ids)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        put_opt_str(payload, self.label.as_ref())?;
        self.compute.serialize(header, payload, ids)
    }
}

impl Decode for DeviceCreateComputePipeline {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let result = codec::read_result(header, ObjectKind::ComputePipeline)?;
        let layout = codec::read_optional_object(header)?;
        let label_len = codec::read_optional_str_header(header)?;
        let label = codec::read_optional_string(payload, label_len, alloc)?;
        Ok(Self {
            device,
            result,
            layout,
            label,
            compute: ProgrammableStage::deserialize(header, payload, alloc)?,
        })
    }
}

impl MapObjects for DeviceCreateComputePipeline {
    type Mapped<T> = DeviceCreateComputePipeline<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreateComputePipeline<T>, E> {
        Ok(DeviceCreateComputePipeline {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
            layout: codec::map_optional(ObjectKind::PipelineLayout, self.layout, f)?,
            label: self.label,
            compute: self.compute.map_objects(f)?,
        })
    }
}

/// Creates a command encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCreateCommandEncoder<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Handle chosen for the encoder.
    pub result: ObjectHandle,
    /// Debug label.
    pub label: Option<String>,
}

impl<O> Layout for DeviceCreateCommandEncoder<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + OPT_STR;
}

impl<O> Command for DeviceCreateCommandEncoder<O> {
    const TAG: u32 = CommandTag::DeviceCreateCommandEncoder as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::CommandEncoder, self.result))
    }
}

impl<O> Transfer<O> for DeviceCreateCommandEncoder<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(opt_str_len(self.label.as_ref()))
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_handle(self.result)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        put_opt_str(payload, self.label.as_ref())
    }
}

impl Decode for DeviceCreateCommandEncoder {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let result = codec::read_result(header, ObjectKind::CommandEncoder)?;
        let label_len = codec::read_optional_str_header(header)?;
        Ok(Self {
            device,
            result,
            label: codec::read_optional_string(payload, label_len, alloc)?,
        })
    }
}

impl MapObjects for DeviceCreateCommandEncoder {
    type Mapped<T> = DeviceCreateCommandEncoder<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceCreateCommandEncoder<T>, E> {
        Ok(DeviceCreateCommandEncoder {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            result: self.result,
            label: self.label,
        })
    }
}

/// Records a buffer-to-buffer copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEncoderCopyBufferToBuffer<O = ObjectHandle> {
    /// Encoder the call is made on.
    pub encoder: O,
    /// Buffer read from.
    pub source: O,
    /// Byte offset into `source`.
    pub source_offset: u64,
    /// Buffer written to.
    pub destination: O,
    /// Byte offset into `destination`.
    pub destination_offset: u64,
    /// Bytes to copy.
    pub size: u64,
}

impl<O> Layout for CommandEncoderCopyBufferToBuffer<O> {
    const HEADER_SIZE: usize = 3 * ObjectHandle::SIZE + 3 * 8;
}

impl<O> Command for CommandEncoderCopyBufferToBuffer<O> {
    const TAG: u32 = CommandTag::CommandEncoderCopyBufferToBuffer as u32;
}

impl<O> Transfer<O> for CommandEncoderCopyBufferToBuffer<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::CommandEncoder, &self.encoder, ids)?;
        codec::put_object(header, ObjectKind::Buffer, &self.source, ids)?;
        header.put_u64(self.source_offset)?;
        codec::put_object(header, ObjectKind::Buffer, &self.destination, ids)?;
        header.put_u64(self.destination_offset)?;
        header.put_u64(self.size)
    }
}

impl Decode for CommandEncoderCopyBufferToBuffer {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            encoder: codec::read_object(header, ObjectKind::CommandEncoder)?,
            source: codec::read_object(header, ObjectKind::Buffer)?,
            source_offset: header.read_u64()?,
            destination: codec::read_object(header, ObjectKind::Buffer)?,
            destination_offset: header.read_u64()?,
            size: header.read_u64()?,
        })
    }
}

impl MapObjects for CommandEncoderCopyBufferToBuffer {
    type Mapped<T> = CommandEncoderCopyBufferToBuffer<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<CommandEncoderCopyBufferToBuffer<T>, E> {
        Ok(CommandEncoderCopyBufferToBuffer {
            encoder: f(ObjectKind::CommandEncoder, self.encoder, Role::Target)?,
            source: f(ObjectKind::Buffer, self.source, Role::Argument)?,
            source_offset: self.source_offset,
            destination: f(ObjectKind::Buffer, self.destination, Role::Argument)?,
            destination_offset: self.destination_offset,
            size: self.size,
        })
    }
}

/// Finishes an encoder into a command buffer.
///
/// This is an error-propagating builder: when it cannot run, the server
/// reports the failure through an `ObjectErrorCallback` for the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEncoderFinish<O = ObjectHandle> {
    /// Encoder the call is made on.
    pub encoder: O,
    /// Handle chosen for the command buffer.
    pub result: ObjectHandle,
    /// Debug label.
    pub label: Option<String>,
}

impl<O> Layout for CommandEncoderFinish<O> {
    const HEADER_SIZE: usize = SELF_AND_RESULT + OPT_STR;
}

impl<O> Command for CommandEncoderFinish<O> {
    const TAG: u32 = CommandTag::CommandEncoderFinish as u32;

    fn result(&self) -> Option<(ObjectKind, ObjectHandle)> {
        Some((ObjectKind::CommandBuffer, self.result))
    }
}

impl<O> Transfer<O> for CommandEncoderFinish<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(opt_str_len(self.label.as_ref()))
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::CommandEncoder, &self.encoder, ids)?;
        header.put_handle(self.result)?;
        codec::put_optional_str_header(header, self.label.as_deref())?;
        put_opt_str(payload, self.label.as_ref())
    }
}

impl Decode for CommandEncoderFinish {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let encoder = codec::read_object(header, ObjectKind::CommandEncoder)?;
        let result = codec::read_result(header, ObjectKind::CommandBuffer)?;
        let label_len = codec::read_optional_str_header(header)?;
        Ok(Self {
            encoder,
            result,
            label: codec::read_optional_string(payload, label_len, alloc)?,
        })
    }
}

impl MapObjects for CommandEncoderFinish {
    type Mapped<T> = CommandEncoderFinish<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<CommandEncoderFinish<T>, E> {
        Ok(CommandEncoderFinish {
            encoder: f(ObjectKind::CommandEncoder, self.encoder, Role::Target)?,
            result: self.result,
            label: self.label,
        })
    }
}

/// Submits command buffers for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSubmit<O = ObjectHandle> {
    /// Queue the call is made on.
    pub queue: O,
    /// Buffers to execute, in order.
    pub command_buffers: Vec<O>,
}

impl<O> Layout for QueueSubmit<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 8;
}

impl<O> Command for QueueSubmit<O> {
    const TAG: u32 = CommandTag::QueueSubmit as u32;
}

impl<O> Transfer<O> for QueueSubmit<O> {
    fn extra_size(&self) -> WireResult<usize> {
        codec::array_size(self.command_buffers.len(), ObjectHandle::SIZE)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Queue, &self.queue, ids)?;
        header.put_len(self.command_buffers.len())?;
        codec::put_object_array(
            payload,
            ObjectKind::CommandBuffer,
            &self.command_buffers,
            ids,
        )
    }
}

impl Decode for QueueSubmit {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let queue = codec::read_object(header, ObjectKind::Queue)?;
        let count = header.read_len()?;
        Ok(Self {
            queue,
            command_buffers: codec::read_object_array(
                payload,
                ObjectKind::CommandBuffer,
                count,
                alloc,
            )?,
        })
    }
}

impl MapObjects for QueueSubmit {
    type Mapped<T> = QueueSubmit<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<QueueSubmit<T>, E> {
        Ok(QueueSubmit {
            queue: f(ObjectKind::Queue, self.queue, Role::Target)?,
            command_buffers: codec::map_object_array(
                ObjectKind::CommandBuffer,
                self.command_buffers,
                f,
            )?,
        })
    }
}

/// Writes bytes into a buffer through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueWriteBuffer<O = ObjectHandle> {
    /// Queue the call is made on.
    pub queue: O,
    /// Buffer written to.
    pub buffer: O,
    /// Byte offset into `buffer`.
    pub buffer_offset: u64,
    /// Bytes to write.
    pub data: Vec<u8>,
}

impl<O> Layout for QueueWriteBuffer<O> {
    const HEADER_SIZE: usize = 2 * ObjectHandle::SIZE + 8 + 8;
}

impl<O> Command for QueueWriteBuffer<O> {
    const TAG: u32 = CommandTag::QueueWriteBuffer as u32;
}

impl<O> Transfer<O> for QueueWriteBuffer<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.data.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Queue, &self.queue, ids)?;
        codec::put_object(header, ObjectKind::Buffer, &self.buffer, ids)?;
        header.put_u64(self.buffer_offset)?;
        header.put_len(self.data.len())?;
        payload.put_bytes(&self.data)
    }
}

impl Decode for QueueWriteBuffer {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let queue = codec::read_object(header, ObjectKind::Queue)?;
        let buffer = codec::read_object(header, ObjectKind::Buffer)?;
        let buffer_offset = header.read_u64()?;
        let len = header.read_len()?;
        Ok(Self {
            queue,
            buffer,
            buffer_offset,
            data: codec::read_byte_array(payload, len, alloc)?,
        })
    }
}

impl MapObjects for QueueWriteBuffer {
    type Mapped<T> = QueueWriteBuffer<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<QueueWriteBuffer<T>, E> {
        Ok(QueueWriteBuffer {
            queue: f(ObjectKind::Queue, self.queue, Role::Target)?,
            buffer: f(ObjectKind::Buffer, self.buffer, Role::Argument)?,
            buffer_offset: self.buffer_offset,
            data: self.data,
        })
    }
}

/// Requests a mapping of a buffer range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferMapAsync<O = ObjectHandle> {
    /// Buffer the call is made on.
    pub buffer: O,
    /// Client-chosen serial echoed by the callback.
    pub request_serial: u64,
    /// [`MapMode`](crate::MapMode) bit.
    pub mode: u32,
    /// Start of the range.
    pub offset: u64,
    /// Length of the range.
    pub size: u64,
}

impl<O> Layout for BufferMapAsync<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 8 + 4 + 8 + 8;
}

impl<O> Command for BufferMapAsync<O> {
    const TAG: u32 = CommandTag::BufferMapAsync as u32;
}

impl<O> Transfer<O> for BufferMapAsync<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Buffer, &self.buffer, ids)?;
        header.put_u64(self.request_serial)?;
        header.put_u32(self.mode)?;
        header.put_u64(self.offset)?;
        header.put_u64(self.size)
    }
}

impl Decode for BufferMapAsync {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            buffer: codec::read_object(header, ObjectKind::Buffer)?,
            request_serial: header.read_u64()?,
            mode: header.read_u32()?,
            offset: header.read_u64()?,
            size: header.read_u64()?,
        })
    }
}

impl MapObjects for BufferMapAsync {
    type Mapped<T> = BufferMapAsync<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<BufferMapAsync<T>, E> {
        Ok(BufferMapAsync {
            buffer: f(ObjectKind::Buffer, self.buffer, Role::Target)?,
            request_serial: self.request_serial,
            mode: self.mode,
            offset: self.offset,
            size: self.size,
        })
    }
}

/// Sends the bytes a client wrote into a write-mapped range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferUpdateMappedData<O = ObjectHandle> {
    /// Buffer the call is made on.
    pub buffer: O,
    /// Start of the written range.
    pub offset: u64,
    /// Written bytes.
    pub data: Vec<u8>,
}

impl<O> Layout for BufferUpdateMappedData<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 8 + 8;
}

impl<O> Command for BufferUpdateMappedData<O> {
    const TAG: u32 = CommandTag::BufferUpdateMappedData as u32;
}

impl<O> Transfer<O> for BufferUpdateMappedData<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.data.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Buffer, &self.buffer, ids)?;
        header.put_u64(self.offset)?;
        header.put_len(self.data.len())?;
        payload.put_bytes(&self.data)
    }
}

impl Decode for BufferUpdateMappedData {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let buffer = codec::read_object(header, ObjectKind::Buffer)?;
        let offset = header.read_u64()?;
        let len = header.read_len()?;
        Ok(Self {
            buffer,
            offset,
            data: codec::read_byte_array(payload, len, alloc)?,
        })
    }
}

impl MapObjects for BufferUpdateMappedData {
    type Mapped<T> = BufferUpdateMappedData<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<BufferUpdateMappedData<T>, E> {
        Ok(BufferUpdateMappedData {
            buffer: f(ObjectKind::Buffer, self.buffer, Role::Target)?,
            offset: self.offset,
            data: self.data,
        })
    }
}

/// Unmaps a buffer, cancelling pending map requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferUnmap<O = ObjectHandle> {
    /// Buffer the call is made on.
    pub buffer: O,
}

impl<O> Layout for BufferUnmap<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE;
}

impl<O> Command for BufferUnmap<O> {
    const TAG: u32 = CommandTag::BufferUnmap as u32;
}

impl<O> Transfer<O> for BufferUnmap<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Buffer, &self.buffer, ids)
    }
}

impl Decode for BufferUnmap {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            buffer: codec::read_object(header, ObjectKind::Buffer)?,
        })
    }
}

impl MapObjects for BufferUnmap {
    type Mapped<T> = BufferUnmap<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<BufferUnmap<T>, E> {
        Ok(BufferUnmap {
            buffer: f(ObjectKind::Buffer, self.buffer, Role::Target)?,
        })
    }
}

/// Drops the client's last reference to an object.
///
/// Addressed by raw id rather than by handle: the slot is freed whatever its
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DestroyObject {
    /// Table the object lives in.
    pub kind: ObjectKind,
    /// Slot to free.
    pub id: u32,
}

impl Layout for DestroyObject {
    const HEADER_SIZE: usize = 4 + 4;
}

impl Command for DestroyObject {
    const TAG: u32 = CommandTag::DestroyObject as u32;
}

impl<O> Transfer<O> for DestroyObject {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_u32(self.kind as u32)?;
        header.put_u32(self.id)
    }
}

impl Decode for DestroyObject {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let kind = ObjectKind::from_u32(header.read_u32()?)
            .ok_or(WireError::InvalidValue("object kind"))?;
        Ok(Self {
            kind,
            id: header.read_u32()?,
        })
    }
}

/// Opens an error scope on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePushErrorScope<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Errors the scope captures.
    pub filter: ErrorFilter,
}

impl<O> Layout for DevicePushErrorScope<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 4;
}

impl<O> Command for DevicePushErrorScope<O> {
    const TAG: u32 = CommandTag::DevicePushErrorScope as u32;
}

impl<O> Transfer<O> for DevicePushErrorScope<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_u32(self.filter.to_u32())
    }
}

impl Decode for DevicePushErrorScope {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            device: codec::read_object(header, ObjectKind::Device)?,
            filter: ErrorFilter::from_u32(header.read_u32()?)?,
        })
    }
}

impl MapObjects for DevicePushErrorScope {
    type Mapped<T> = DevicePushErrorScope<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DevicePushErrorScope<T>, E> {
        Ok(DevicePushErrorScope {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            filter: self.filter,
        })
    }
}

/// Closes the innermost error scope; answered by a
/// [`DevicePopErrorScopeCallback`](crate::DevicePopErrorScopeCallback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePopErrorScope<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Client-chosen serial echoed by the callback.
    pub request_serial: u64,
}

impl<O> Layout for DevicePopErrorScope<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 8;
}

impl<O> Command for DevicePopErrorScope<O> {
    const TAG: u32 = CommandTag::DevicePopErrorScope as u32;
}

impl<O> Transfer<O> for DevicePopErrorScope<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(0)
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        _payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_u64(self.request_serial)
    }
}

impl Decode for DevicePopErrorScope {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        _payload: &mut ByteCursor<'_>,
        _alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        Ok(Self {
            device: codec::read_object(header, ObjectKind::Device)?,
            request_serial: header.read_u64()?,
        })
    }
}

impl MapObjects for DevicePopErrorScope {
    type Mapped<T> = DevicePopErrorScope<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DevicePopErrorScope<T>, E> {
        Ok(DevicePopErrorScope {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            request_serial: self.request_serial,
        })
    }
}

/// Raises an error on the device as if a call had failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInjectError<O = ObjectHandle> {
    /// Device the call is made on.
    pub device: O,
    /// Category of the error.
    pub error_type: ErrorType,
    /// Human-readable description.
    pub message: String,
}

impl<O> Layout for DeviceInjectError<O> {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 4 + 8;
}

impl<O> Command for DeviceInjectError<O> {
    const TAG: u32 = CommandTag::DeviceInjectError as u32;
}

impl<O> Transfer<O> for DeviceInjectError<O> {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.message.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        codec::put_object(header, ObjectKind::Device, &self.device, ids)?;
        header.put_u32(self.error_type.to_u32())?;
        header.put_len(self.message.len())?;
        payload.put_bytes(self.message.as_bytes())
    }
}

impl Decode for DeviceInjectError {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let error_type = ErrorType::from_u32(header.read_u32()?)?;
        let len = header.read_len()?;
        Ok(Self {
            device,
            error_type,
            message: codec::read_string(payload, len, alloc)?,
        })
    }
}

impl MapObjects for DeviceInjectError {
    type Mapped<T> = DeviceInjectError<T>;

    fn map_objects<T, E>(
        self,
        f: &mut dyn FnMut(ObjectKind, ObjectHandle, Role) -> Result<T, E>,
    ) -> Result<DeviceInjectError<T>, E> {
        Ok(DeviceInjectError {
            device: f(ObjectKind::Device, self.device, Role::Target)?,
            error_type: self.error_type,
            message: self.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, HandleIds, LookupOutcome, Resolved};
    use crate::types::{BindingType, BufferUsage, ShaderStage, TextureFormat, TextureUsage};

    const DEVICE: ObjectHandle = ObjectHandle::new(1, 1);

    fn roundtrip(cmd: &ForwardCommand) -> ForwardCommand {
        let bytes = cmd.encode().unwrap();
        assert_eq!(bytes.len(), codec::peek_envelope(&bytes).unwrap().0);
        let mut alloc = DeserializeAllocator::new(1 << 20);
        ForwardCommand::decode(&bytes, &mut alloc).unwrap()
    }

    /// One instance of every forward command, mixing present, absent and
    /// empty strings and payloads.
    fn every_command() -> Vec<ForwardCommand> {
        let texture = TextureDescriptor {
            label: Some("albedo".into()),
            width: 64,
            height: 32,
            depth_or_array_layers: 1,
            mip_level_count: 3,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::COPY_DST,
        };
        vec![
            ForwardCommand::DeviceGetQueue(DeviceGetQueue {
                device: DEVICE,
                result: ObjectHandle::new(1, 1),
            }),
            ForwardCommand::DeviceCreateBuffer(DeviceCreateBuffer {
                device: DEVICE,
                result: ObjectHandle::new(2, 1),
                descriptor: BufferDescriptor {
                    label: None,
                    size: 256,
                    usage: BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
                    mapped_at_creation: true,
                },
            }),
            ForwardCommand::DeviceCreateTexture(DeviceCreateTexture {
                device: DEVICE,
                result: ObjectHandle::new(1, 1),
                descriptor: texture,
            }),
            ForwardCommand::TextureCreateView(TextureCreateView {
                texture: ObjectHandle::new(1, 1),
                result: ObjectHandle::new(1, 2),
                descriptor: TextureViewDescriptor {
                    label: Some(String::new()),
                    format: TextureFormat::Rgba8Unorm,
                    base_mip_level: 1,
                    mip_level_count: 2,
                },
            }),
            ForwardCommand::DeviceCreateShaderModule(DeviceCreateShaderModule {
                device: DEVICE,
                result: ObjectHandle::new(1, 1),
                label: Some("blur".into()),
                code: String::new(),
            }),
            ForwardCommand::DeviceCreateBindGroupLayout(DeviceCreateBindGroupLayout {
                device: DEVICE,
                result: ObjectHandle::new(1, 1),
                label: None,
                entries: vec![
                    BindGroupLayoutEntry {
                        binding: 0,
                        visibility: ShaderStage::COMPUTE,
                        binding_type: BindingType::UniformBuffer,
                    },
                    BindGroupLayoutEntry {
                        binding: 3,
                        visibility: ShaderStage::COMPUTE,
                        binding_type: BindingType::StorageTexture,
                    },
                ],
            }),
            ForwardCommand::DeviceCreatePipelineLayout(DeviceCreatePipelineLayout {
                device: DEVICE,
                result: ObjectHandle::new(1, 1),
                label: Some("layout".into()),
                bind_group_layouts: vec![],
            }),
            ForwardCommand::DeviceCreateCommandEncoder(DeviceCreateCommandEncoder {
                device: DEVICE,
                result: ObjectHandle::new(4, 2),
                label: None,
            }),
            ForwardCommand::CommandEncoderCopyBufferToBuffer(CommandEncoderCopyBufferToBuffer {
                encoder: ObjectHandle::new(4, 2),
                source: ObjectHandle::new(1, 1),
                source_offset: 8,
                destination: ObjectHandle::new(2, 1),
                destination_offset: u64::MAX,
                size: 0,
            }),
            ForwardCommand::CommandEncoderFinish(CommandEncoderFinish {
                encoder: ObjectHandle::new(4, 2),
                result: ObjectHandle::new(1, 1),
                label: Some("frame".into()),
            }),
            ForwardCommand::QueueWriteBuffer(QueueWriteBuffer {
                queue: ObjectHandle::new(1, 1),
                buffer: ObjectHandle::new(2, 1),
                buffer_offset: 4,
                data: vec![],
            }),
            ForwardCommand::BufferMapAsync(BufferMapAsync {
                buffer: ObjectHandle::new(2, 1),
                request_serial: 41,
                mode: crate::types::MapMode::WRITE,
                offset: 0,
                size: 256,
            }),
            ForwardCommand::BufferUpdateMappedData(BufferUpdateMappedData {
                buffer: ObjectHandle::new(2, 1),
                offset: 16,
                data: vec![0xaa; 7],
            }),
            ForwardCommand::BufferUnmap(BufferUnmap {
                buffer: ObjectHandle::new(2, 1),
            }),
            ForwardCommand::DevicePushErrorScope(DevicePushErrorScope {
                device: DEVICE,
                filter: ErrorFilter::OutOfMemory,
            }),
            ForwardCommand::DevicePopErrorScope(DevicePopErrorScope {
                device: DEVICE,
                request_serial: 3,
            }),
            ForwardCommand::DeviceInjectError(DeviceInjectError {
                device: DEVICE,
                error_type: ErrorType::Internal,
                message: "injected".into(),
            }),
        ]
    }

    #[test]
    fn every_command_roundtrips() {
        let cases = every_command();
        for cmd in &cases {
            assert_eq!(&roundtrip(cmd), cmd, "{}", cmd.tag());
        }
        let seen: Vec<_> = cases.iter().map(ForwardCommand::tag).collect();
        // Nested records are covered by `nested_records_roundtrip`.
        let nested = [
            CommandTag::DeviceCreateBindGroup,
            CommandTag::DeviceCreateComputePipeline,
            CommandTag::QueueSubmit,
            CommandTag::DestroyObject,
        ];
        for tag in 1..=21 {
            let tag = CommandTag::from_u32(tag).unwrap();
            assert!(seen.contains(&tag) || nested.contains(&tag), "{tag} not covered");
        }
    }

    #[test]
    fn hello_label_adds_five_bytes() {
        let cmd = DeviceCreateBuffer {
            device: DEVICE,
            result: ObjectHandle::new(2, 1),
            descriptor: BufferDescriptor {
                label: Some("hello".into()),
                size: 16,
                usage: BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
        };
        let header = codec::ENVELOPE_SIZE + DeviceCreateBuffer::<ObjectHandle>::HEADER_SIZE;
        assert_eq!(codec::required_size(&cmd), Ok(header + 5));

        let bytes = codec::encode_command(&cmd, &HandleIds).unwrap();
        assert_eq!(&bytes[0..4], &u32::try_from(header + 5).unwrap().to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
    }

    #[test]
    fn nested_records_roundtrip() {
        let cases = [
            ForwardCommand::DeviceCreateComputePipeline(DeviceCreateComputePipeline {
                device: DEVICE,
                result: ObjectHandle::new(1, 1),
                layout: None,
                label: Some("blur".into()),
                compute: ProgrammableStage {
                    module: ObjectHandle::new(3, 2),
                    entry_point: "main".into(),
                    constants: vec![crate::structs::ConstantEntry {
                        key: "radius".into(),
                        value: 4.0,
                    }],
                },
            }),
            ForwardCommand::DeviceCreateBindGroup(DeviceCreateBindGroup {
                device: DEVICE,
                result: ObjectHandle::new(1, 1),
                layout: ObjectHandle::new(2, 1),
                label: None,
                entries: vec![BindGroupEntry {
                    binding: 0,
                    buffer: Some(ObjectHandle::new(7, 1)),
                    offset: 0,
                    size: 64,
                    texture_view: None,
                }],
            }),
            ForwardCommand::QueueSubmit(QueueSubmit {
                queue: ObjectHandle::new(1, 1),
                command_buffers: vec![ObjectHandle::new(1, 1), ObjectHandle::new(2, 3)],
            }),
            ForwardCommand::DestroyObject(DestroyObject {
                kind: ObjectKind::Buffer,
                id: 9,
            }),
        ];
        for cmd in cases {
            assert_eq!(roundtrip(&cmd), cmd);
        }
    }

    #[test]
    fn every_truncation_is_an_error() {
        let cmd = DeviceCreateShaderModule {
            device: DEVICE,
            result: ObjectHandle::new(1, 1),
            label: None,
            code: "fn main() {}".into(),
        };
        let bytes = codec::encode_command(&cmd, &HandleIds).unwrap();
        let mut alloc = DeserializeAllocator::new(1 << 20);
        for len in 0..bytes.len() {
            assert!(ForwardCommand::decode(&bytes[..len], &mut alloc).is_err());
            alloc.reset();
        }
        assert!(ForwardCommand::decode(&bytes, &mut alloc).is_ok());
    }

    #[test]
    fn payload_length_past_end_is_fatal() {
        let cmd = QueueWriteBuffer {
            queue: ObjectHandle::new(1, 1),
            buffer: ObjectHandle::new(2, 1),
            buffer_offset: 0,
            data: vec![1, 2, 3, 4],
        };
        let mut bytes = codec::encode_command(&cmd, &HandleIds).unwrap();
        // Data length lives right after queue, buffer and offset.
        let at = codec::ENVELOPE_SIZE + 24;
        bytes[at..at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        let mut alloc = DeserializeAllocator::new(1 << 20);
        assert!(ForwardCommand::decode(&bytes, &mut alloc).is_err());
    }

    #[test]
    fn null_required_object_is_fatal() {
        let cmd = BufferUnmap {
            buffer: ObjectHandle::new(4, 1),
        };
        let mut bytes = codec::encode_command(&cmd, &HandleIds).unwrap();
        bytes[8..16].fill(0);
        let mut alloc = DeserializeAllocator::new(64);
        assert_eq!(
            ForwardCommand::decode(&bytes, &mut alloc),
            Err(WireError::NullObject(ObjectKind::Buffer))
        );
    }

    #[test]
    fn unknown_tag_and_bad_size() {
        let mut alloc = DeserializeAllocator::new(64);
        let mut bytes = vec![8, 0, 0, 0, 0xee, 0, 0, 0];
        assert_eq!(
            ForwardCommand::decode(&bytes, &mut alloc),
            Err(WireError::UnknownCommand(0xee))
        );
        let cmd = BufferUnmap {
            buffer: ObjectHandle::new(4, 1),
        };
        bytes = codec::encode_command(&cmd, &HandleIds).unwrap();
        bytes.push(0);
        assert!(matches!(
            ForwardCommand::decode(&bytes, &mut alloc),
            Err(WireError::BadCommandSize { .. })
        ));
    }

    struct Table(Vec<ObjectHandle>);

    impl codec::IdResolver<u32> for Table {
        fn resolve(&self, _kind: ObjectKind, handle: ObjectHandle) -> LookupOutcome<u32> {
            if self.0.contains(&handle) {
                LookupOutcome::Found(handle.id * 100)
            } else {
                LookupOutcome::NotFound
            }
        }
    }

    #[test]
    fn unknown_argument_is_error_object_but_unknown_self_is_fatal() {
        let table = Table(vec![ObjectHandle::new(1, 1), ObjectHandle::new(2, 1)]);
        let copy = CommandEncoderCopyBufferToBuffer {
            encoder: ObjectHandle::new(1, 1),
            source: ObjectHandle::new(2, 1),
            source_offset: 0,
            destination: ObjectHandle::new(2, 1),
            destination_offset: 8,
            size: 4,
        };
        match codec::resolve(copy.clone(), &table).unwrap() {
            Resolved::Ready(c) => assert_eq!((c.encoder, c.source), (100, 200)),
            Resolved::ErrorObject => panic!("expected ready"),
        }

        let stale = CommandEncoderCopyBufferToBuffer {
            source: ObjectHandle::new(2, 2),
            ..copy.clone()
        };
        assert_eq!(
            codec::resolve(stale, &table).unwrap(),
            Resolved::ErrorObject
        );

        let missing_self = CommandEncoderCopyBufferToBuffer {
            encoder: ObjectHandle::new(9, 1),
            ..copy
        };
        assert!(matches!(
            codec::resolve(missing_self, &table),
            Err(WireError::MissingSelf { .. })
        ));
    }

    /// Objects addressed by name, to exercise a non-handle representation.
    struct Names;

    impl IdProvider<&'static str> for Names {
        fn get_id(&self, kind: ObjectKind, object: &&'static str) -> WireResult<ObjectHandle> {
            match *object {
                "queue" => Ok(ObjectHandle::new(1, 1)),
                "staging" => Ok(ObjectHandle::new(3, 1)),
                _ => Err(WireError::UnknownObject {
                    kind,
                    handle: ObjectHandle::NULL,
                }),
            }
        }
    }

    #[test]
    fn provider_translates_custom_objects() {
        let cmd = QueueWriteBuffer {
            queue: "queue",
            buffer: "staging",
            buffer_offset: 4,
            data: vec![9; 3],
        };
        let bytes = codec::encode_command(&cmd, &Names).unwrap();
        let mut alloc = DeserializeAllocator::new(64);
        let decoded: QueueWriteBuffer = codec::deserialize_command(&bytes, &mut alloc).unwrap();
        assert_eq!(decoded.buffer, ObjectHandle::new(3, 1));
        assert_eq!(decoded.data, vec![9; 3]);

        let bad = QueueWriteBuffer {
            buffer: "gone",
            ..cmd
        };
        assert!(codec::encode_command(&bad, &Names).is_err());
    }
}
