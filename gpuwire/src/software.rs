//! In-memory reference backend.
//!
//! [`SoftwareBackend`] keeps buffers as byte vectors and enforces the usage
//! rules a real device would, so wire behavior can be exercised without a
//! GPU. Encoders record their commands into a [`CommandAllocator`]; the
//! finished blocks are replayed on submit.

use std::collections::{HashMap, VecDeque};

use gpuwire_proto::{
    BindGroupEntry, BindGroupLayoutEntry, BindingType, BufferDescriptor, BufferUsage, ByteCursor,
    DeviceLostReason, ErrorFilter, ErrorType, MapAsyncStatus, MapMode, ObjectKind,
    PopErrorScopeStatus, ProgrammableStage, TextureDescriptor, TextureFormat,
    TextureViewDescriptor, WireResult, WireWriter,
};
use tracing::{debug, trace, warn};

use crate::arena::{CommandAllocator, CommandBlocks, CommandIterator};
use crate::backend::{Backend, BackendEvent};

/// Largest buffer the backend agrees to allocate.
pub const MAX_BUFFER_SIZE: u64 = 256 * 1024 * 1024;

/// Encoder record tag of a buffer-to-buffer copy.
const COPY: u32 = 1;

/// Payload of a [`COPY`] record: two ids and three `u64`s.
const COPY_SIZE: usize = 4 + 4 + 3 * 8;

/// Reference to a [`SoftwareBackend`] object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftHandle(u32);

impl SoftHandle {
    /// Backend-internal id.
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Mapping state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    /// Not mapped.
    Unmapped,
    /// A request is waiting for the next tick.
    Pending {
        /// Token of the request.
        token: u64,
        /// Requested mode.
        mode: u32,
        /// Start of the range.
        offset: u64,
        /// Length of the range.
        size: u64,
    },
    /// Mapped for the client.
    Mapped {
        /// Mapped mode.
        mode: u32,
        /// Start of the range.
        offset: u64,
        /// Length of the range.
        size: u64,
    },
}

/// An open error scope.
#[derive(Debug)]
struct ErrorScope {
    /// Errors the scope captures.
    filter: ErrorFilter,
    /// First captured error.
    error: Option<(ErrorType, String)>,
}

/// Buffer storage.
#[derive(Debug)]
struct SoftBuffer {
    /// Contents.
    data: Vec<u8>,
    /// Usage flags given at creation.
    usage: u32,
    /// Mapping state.
    map: MapState,
}

impl SoftBuffer {
    /// Byte range `offset..offset + size`, if it lies inside the buffer.
    fn range(&self, offset: u64, size: u64) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

/// A backend object.
#[derive(Debug)]
enum Object {
    /// The root device.
    Device,
    /// The device queue.
    Queue,
    /// A buffer.
    Buffer(SoftBuffer),
    /// A texture; only its description is kept.
    Texture(TextureDescriptor),
    /// A texture view.
    TextureView,
    /// A shader module.
    ShaderModule {
        /// Source text.
        code: String,
    },
    /// A bind group layout.
    BindGroupLayout {
        /// Declared bindings.
        entries: Vec<BindGroupLayoutEntry>,
    },
    /// A pipeline layout.
    PipelineLayout,
    /// A bind group.
    BindGroup,
    /// A compute pipeline.
    ComputePipeline,
    /// A command encoder.
    Encoder {
        /// Recorded commands.
        commands: CommandAllocator,
        /// First validation error, which makes `finish` fail.
        error: Option<String>,
        /// Set once `finish` was called.
        finished: bool,
    },
    /// Finished commands; `None` once submitted.
    CommandBuffer(Option<CommandBlocks>),
}

/// A decoded [`COPY`] record.
#[derive(Debug, Clone, Copy)]
struct CopyRecord {
    /// Source buffer id.
    source: u32,
    /// Destination buffer id.
    destination: u32,
    /// Source offset.
    source_offset: u64,
    /// Destination offset.
    destination_offset: u64,
    /// Bytes to copy.
    size: u64,
}

impl CopyRecord {
    /// Writes the record into an arena payload.
    fn write(self, out: &mut [u8]) -> WireResult<()> {
        let mut w = WireWriter::new(out);
        w.put_u32(self.source)?;
        w.put_u32(self.destination)?;
        w.put_u64(self.source_offset)?;
        w.put_u64(self.destination_offset)?;
        w.put_u64(self.size)
    }

    /// Reads a record from an arena payload.
    fn read(bytes: &[u8]) -> WireResult<Self> {
        let mut c = ByteCursor::new(bytes);
        Ok(Self {
            source: c.read_u32()?,
            destination: c.read_u32()?,
            source_offset: c.read_u64()?,
            destination_offset: c.read_u64()?,
            size: c.read_u64()?,
        })
    }
}

/// Reference [`Backend`] holding everything in memory.
#[derive(Debug)]
pub struct SoftwareBackend {
    /// Live objects by id.
    objects: HashMap<u32, Object>,
    /// Next id to hand out.
    next_id: u32,
    /// The device, created with the backend.
    device: SoftHandle,
    /// The queue, created on first request.
    queue: Option<SoftHandle>,
    /// Buffers with a pending map, in request order.
    pending_maps: Vec<u32>,
    /// Events waiting for the next tick.
    events: VecDeque<BackendEvent>,
    /// Open error scopes, innermost last.
    error_scopes: Vec<ErrorScope>,
    /// Set once the device is lost.
    lost: bool,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    /// Creates a backend with a fresh device.
    pub fn new() -> Self {
        let mut backend = Self {
            objects: HashMap::new(),
            next_id: 1,
            device: SoftHandle(0),
            queue: None,
            pending_maps: Vec::new(),
            events: VecDeque::new(),
            error_scopes: Vec::new(),
            lost: false,
        };
        backend.device = backend.insert(Object::Device);
        backend
    }

    /// Number of live objects, the device included.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Returns `true` once the device is lost.
    pub const fn is_lost(&self) -> bool {
        self.lost
    }

    /// Contents of a buffer.
    pub fn buffer_contents(&self, buffer: SoftHandle) -> Option<&[u8]> {
        match self.objects.get(&buffer.0)? {
            Object::Buffer(b) => Some(&b.data),
            _ => None,
        }
    }

    /// Loses the device: pending maps fail and every later call is a no-op.
    pub fn lose_device(&mut self, reason: DeviceLostReason, message: &str) {
        if self.lost {
            return;
        }
        warn!(?reason, detail = message, "device lost");
        self.lost = true;
        self.error_scopes.clear();
        for id in std::mem::take(&mut self.pending_maps) {
            if let Some(token) = self.take_pending(id) {
                self.complete(token, MapAsyncStatus::DeviceLost, Vec::new());
            }
        }
        self.events.push_back(BackendEvent::DeviceLost {
            reason,
            message: message.to_owned(),
        });
    }

    /// Registers a new object.
    fn insert(&mut self, object: Object) -> SoftHandle {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.objects.insert(id, object);
        SoftHandle(id)
    }

    /// Queues a validation error and fails the call.
    fn reject<T>(&mut self, message: String) -> Option<T> {
        self.fail(ErrorType::Validation, message);
        None
    }

    /// Hands an error to the innermost matching scope, or queues it as a
    /// device error.
    fn fail(&mut self, error_type: ErrorType, message: String) {
        debug!(?error_type, detail = %message, "backend error");
        if let Some(scope) = self
            .error_scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.filter.captures(error_type))
        {
            scope.error.get_or_insert((error_type, message));
            return;
        }
        self.events
            .push_back(BackendEvent::DeviceError { error_type, message });
    }

    /// Queues a map completion.
    fn complete(&mut self, token: u64, status: MapAsyncStatus, data: Vec<u8>) {
        self.events
            .push_back(BackendEvent::MapCompleted { token, status, data });
    }

    /// Buffer behind `handle`.
    fn buffer(&self, handle: SoftHandle) -> Option<&SoftBuffer> {
        match self.objects.get(&handle.0)? {
            Object::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// Mutable buffer behind `handle`.
    fn buffer_mut(&mut self, handle: SoftHandle) -> Option<&mut SoftBuffer> {
        match self.objects.get_mut(&handle.0)? {
            Object::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// Clears a pending map on buffer `id`, returning its token.
    fn take_pending(&mut self, id: u32) -> Option<u64> {
        let Some(Object::Buffer(buffer)) = self.objects.get_mut(&id) else {
            return None;
        };
        let MapState::Pending { token, .. } = buffer.map else {
            return None;
        };
        buffer.map = MapState::Unmapped;
        Some(token)
    }

    /// Aborts a pending map on buffer `id`, if any.
    fn abort_pending(&mut self, id: u32) {
        if let Some(token) = self.take_pending(id) {
            self.pending_maps.retain(|&p| p != id);
            self.complete(token, MapAsyncStatus::Aborted, Vec::new());
        }
    }

    /// Checks buffer creation rules.
    fn check_buffer(descriptor: &BufferDescriptor) -> Result<(), (ErrorType, String)> {
        let usage = descriptor.usage;
        let invalid = |m: String| Err((ErrorType::Validation, m));
        if descriptor.size == 0 {
            return invalid("buffer size must be non-zero".into());
        }
        if usage == 0 || usage & !BufferUsage::ALL != 0 {
            return invalid(format!("invalid buffer usage {usage:#x}"));
        }
        if usage & BufferUsage::MAP_READ != 0 && usage & !(BufferUsage::MAP_READ | BufferUsage::COPY_DST) != 0 {
            return invalid("MAP_READ may only be combined with COPY_DST".into());
        }
        if usage & BufferUsage::MAP_WRITE != 0 && usage & !(BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC) != 0 {
            return invalid("MAP_WRITE may only be combined with COPY_SRC".into());
        }
        if descriptor.mapped_at_creation && descriptor.size % 4 != 0 {
            return invalid("buffers mapped at creation need a size multiple of 4".into());
        }
        if descriptor.size > MAX_BUFFER_SIZE {
            return Err((
                ErrorType::OutOfMemory,
                format!("buffer of {} bytes exceeds the device limit", descriptor.size),
            ));
        }
        Ok(())
    }

    /// Checks a copy against the current buffers.
    fn check_copy(&self, copy: CopyRecord) -> Result<(), String> {
        if copy.source == copy.destination {
            return Err("copy source and destination are the same buffer".into());
        }
        let (Some(src), Some(dst)) = (
            self.buffer(SoftHandle(copy.source)),
            self.buffer(SoftHandle(copy.destination)),
        ) else {
            return Err("copy references a destroyed buffer".into());
        };
        if src.usage & BufferUsage::COPY_SRC == 0 {
            return Err("copy source lacks COPY_SRC usage".into());
        }
        if dst.usage & BufferUsage::COPY_DST == 0 {
            return Err("copy destination lacks COPY_DST usage".into());
        }
        if copy.size % 4 != 0 || copy.source_offset % 4 != 0 || copy.destination_offset % 4 != 0 {
            return Err("copy offsets and size must be multiples of 4".into());
        }
        if src.range(copy.source_offset, copy.size).is_none()
            || dst.range(copy.destination_offset, copy.size).is_none()
        {
            return Err("copy range out of bounds".into());
        }
        Ok(())
    }

    /// Executes one recorded copy at submit time.
    fn run_copy(&mut self, copy: CopyRecord) -> Result<(), String> {
        self.check_copy(copy)?;
        let mapped = |b: &SoftBuffer| b.map != MapState::Unmapped;
        let bytes = match self.buffer(SoftHandle(copy.source)) {
            Some(src) if !mapped(src) => src
                .range(copy.source_offset, copy.size)
                .map(|r| src.data[r].to_vec()),
            _ => None,
        };
        let Some(bytes) = bytes else {
            return Err("copy source is mapped".into());
        };
        let dst = self
            .buffer_mut(SoftHandle(copy.destination))
            .filter(|d| !mapped(d))
            .ok_or_else(|| "copy destination is mapped".to_owned())?;
        let range = dst
            .range(copy.destination_offset, copy.size)
            .ok_or_else(|| "copy range out of bounds".to_owned())?;
        dst.data[range].copy_from_slice(&bytes);
        Ok(())
    }

    /// Replays a finished command buffer.
    fn replay(&mut self, blocks: CommandBlocks) {
        let mut it = CommandIterator::new(blocks);
        while let Some(tag) = it.next_command_id() {
            if tag != COPY {
                self.fail(ErrorType::Internal, format!("unknown recorded command {tag}"));
                return;
            }
            let record = it.next_command(COPY_SIZE, 8).map(CopyRecord::read);
            let Some(Ok(copy)) = record else {
                self.fail(ErrorType::Internal, "truncated recorded command".into());
                return;
            };
            if let Err(message) = self.run_copy(copy) {
                self.fail(ErrorType::Validation, message);
            }
        }
    }
}

impl Backend for SoftwareBackend {
    type Handle = SoftHandle;

    fn device(&self) -> SoftHandle {
        self.device
    }

    fn get_queue(&mut self, device: &SoftHandle) -> Option<SoftHandle> {
        if self.lost || *device != self.device {
            return None;
        }
        if self.queue.is_none() {
            self.queue = Some(self.insert(Object::Queue));
        }
        self.queue
    }

    fn create_buffer(
        &mut self,
        _device: &SoftHandle,
        descriptor: &BufferDescriptor,
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        if let Err((error_type, message)) = Self::check_buffer(descriptor) {
            self.fail(error_type, message);
            return None;
        }
        let len = usize::try_from(descriptor.size).ok()?;
        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            self.fail(ErrorType::OutOfMemory, format!("cannot allocate {len} bytes"));
            return None;
        }
        data.resize(len, 0);
        let map = if descriptor.mapped_at_creation {
            MapState::Mapped {
                mode: MapMode::WRITE,
                offset: 0,
                size: descriptor.size,
            }
        } else {
            MapState::Unmapped
        };
        Some(self.insert(Object::Buffer(SoftBuffer {
            data,
            usage: descriptor.usage,
            map,
        })))
    }

    fn create_texture(
        &mut self,
        _device: &SoftHandle,
        descriptor: &TextureDescriptor,
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        let d = descriptor;
        if d.width == 0 || d.height == 0 || d.depth_or_array_layers == 0 || d.mip_level_count == 0 {
            return self.reject("texture dimensions and mip count must be non-zero".into());
        }
        if d.usage == 0 {
            return self.reject("texture usage must be non-zero".into());
        }
        let max_mips = u32::BITS - d.width.max(d.height).leading_zeros();
        if d.mip_level_count > max_mips {
            return self.reject(format!(
                "{} mip levels requested, at most {max_mips} possible",
                d.mip_level_count
            ));
        }
        Some(self.insert(Object::Texture(descriptor.clone())))
    }

    fn create_texture_view(
        &mut self,
        texture: &SoftHandle,
        descriptor: &TextureViewDescriptor,
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        let Some(Object::Texture(t)) = self.objects.get(&texture.0) else {
            return self.reject("texture view of a non-texture".into());
        };
        let format: TextureFormat = t.format;
        let mips = t.mip_level_count;
        if descriptor.format != format {
            return self.reject(format!(
                "view format {:?} differs from texture format {format:?}",
                descriptor.format
            ));
        }
        let end = descriptor
            .base_mip_level
            .checked_add(descriptor.mip_level_count);
        if descriptor.mip_level_count == 0 || end.is_none_or(|e| e > mips) {
            return self.reject("texture view mip range out of bounds".into());
        }
        Some(self.insert(Object::TextureView))
    }

    fn create_shader_module(
        &mut self,
        _device: &SoftHandle,
        _label: Option<&str>,
        code: &str,
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        if code.trim().is_empty() {
            return self.reject("empty shader source".into());
        }
        Some(self.insert(Object::ShaderModule {
            code: code.to_owned(),
        }))
    }

    fn create_bind_group_layout(
        &mut self,
        _device: &SoftHandle,
        _label: Option<&str>,
        entries: &[BindGroupLayoutEntry],
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.binding == entry.binding) {
                return self.reject(format!("duplicate binding {}", entry.binding));
            }
            if entry.visibility == 0 {
                return self.reject(format!("binding {} is visible to no stage", entry.binding));
            }
        }
        Some(self.insert(Object::BindGroupLayout {
            entries: entries.to_vec(),
        }))
    }

    fn create_pipeline_layout(
        &mut self,
        _device: &SoftHandle,
        _label: Option<&str>,
        bind_group_layouts: &[SoftHandle],
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        let all_layouts = bind_group_layouts.iter().all(|h| {
            matches!(self.objects.get(&h.0), Some(Object::BindGroupLayout { .. }))
        });
        if !all_layouts {
            return self.reject("pipeline layout member is not a bind group layout".into());
        }
        Some(self.insert(Object::PipelineLayout))
    }

    fn create_bind_group(
        &mut self,
        _device: &SoftHandle,
        _label: Option<&str>,
        layout: &SoftHandle,
        entries: &[BindGroupEntry<SoftHandle>],
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        let Some(Object::BindGroupLayout { entries: declared }) = self.objects.get(&layout.0) else {
            return self.reject("bind group layout is not a bind group layout".into());
        };
        if declared.len() != entries.len() {
            let message = format!(
                "layout declares {} bindings, {} given",
                declared.len(),
                entries.len()
            );
            return self.reject(message);
        }
        let mut problem = None;
        for entry in entries {
            let Some(slot) = declared.iter().find(|d| d.binding == entry.binding) else {
                problem = Some(format!("binding {} is not in the layout", entry.binding));
                break;
            };
            let needed_usage = match slot.binding_type {
                BindingType::UniformBuffer => Some(BufferUsage::UNIFORM),
                BindingType::StorageBuffer | BindingType::ReadOnlyStorageBuffer => {
                    Some(BufferUsage::STORAGE)
                }
                _ => None,
            };
            let ok = match (needed_usage, entry.buffer, entry.texture_view) {
                (Some(usage), Some(buffer), None) => self.buffer(buffer).is_some_and(|b| {
                    b.usage & usage != 0 && b.range(entry.offset, entry.size).is_some()
                }),
                (None, None, Some(view)) => {
                    matches!(self.objects.get(&view.0), Some(Object::TextureView))
                }
                _ => false,
            };
            if !ok {
                problem = Some(format!("binding {} does not match its layout", entry.binding));
                break;
            }
        }
        if let Some(message) = problem {
            return self.reject(message);
        }
        Some(self.insert(Object::BindGroup))
    }

    fn create_compute_pipeline(
        &mut self,
        _device: &SoftHandle,
        _label: Option<&str>,
        layout: Option<&SoftHandle>,
        compute: &ProgrammableStage<SoftHandle>,
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        if layout.is_some_and(|l| !matches!(self.objects.get(&l.0), Some(Object::PipelineLayout))) {
            return self.reject("compute pipeline layout is not a pipeline layout".into());
        }
        let Some(Object::ShaderModule { code }) = self.objects.get(&compute.module.0) else {
            return self.reject("compute stage module is not a shader module".into());
        };
        let signature = format!("fn {}(", compute.entry_point);
        if !code.contains(&signature) {
            return self.reject(format!("entry point {} not found", compute.entry_point));
        }
        Some(self.insert(Object::ComputePipeline))
    }

    fn create_command_encoder(
        &mut self,
        _device: &SoftHandle,
        _label: Option<&str>,
    ) -> Option<SoftHandle> {
        if self.lost {
            return None;
        }
        Some(self.insert(Object::Encoder {
            commands: CommandAllocator::new(),
            error: None,
            finished: false,
        }))
    }

    fn copy_buffer_to_buffer(
        &mut self,
        encoder: &SoftHandle,
        source: &SoftHandle,
        source_offset: u64,
        destination: &SoftHandle,
        destination_offset: u64,
        size: u64,
    ) {
        if self.lost {
            return;
        }
        let copy = CopyRecord {
            source: source.0,
            destination: destination.0,
            source_offset,
            destination_offset,
            size,
        };
        let check = self.check_copy(copy);
        let Some(Object::Encoder {
            commands,
            error,
            finished,
        }) = self.objects.get_mut(&encoder.0)
        else {
            return;
        };
        if *finished {
            error.get_or_insert_with(|| "command encoder already finished".into());
            return;
        }
        if error.is_some() {
            return;
        }
        if let Err(message) = check {
            *error = Some(message);
            return;
        }
        let written = commands
            .allocate(COPY, COPY_SIZE, 8)
            .map(|out| copy.write(out));
        if !matches!(written, Some(Ok(()))) {
            *error = Some("out of memory while recording".into());
        }
        trace!(?copy, "recorded copy");
    }

    fn finish(&mut self, encoder: &SoftHandle, _label: Option<&str>) -> Result<SoftHandle, String> {
        if self.lost {
            return Err("device lost".into());
        }
        let Some(Object::Encoder {
            commands,
            error,
            finished,
        }) = self.objects.get_mut(&encoder.0)
        else {
            return Err("not a command encoder".into());
        };
        if *finished {
            return Err("command encoder already finished".into());
        }
        *finished = true;
        if let Some(message) = error.take() {
            return Err(format!("invalid command encoder: {message}"));
        }
        let blocks = commands.acquire_blocks();
        Ok(self.insert(Object::CommandBuffer(Some(blocks))))
    }

    fn submit(&mut self, _queue: &SoftHandle, command_buffers: &[SoftHandle]) {
        if self.lost {
            return;
        }
        for handle in command_buffers {
            let blocks = match self.objects.get_mut(&handle.0) {
                Some(Object::CommandBuffer(blocks)) => blocks.take(),
                _ => None,
            };
            match blocks {
                Some(blocks) => self.replay(blocks),
                None => self.fail(
                    ErrorType::Validation,
                    "command buffer submitted twice".into(),
                ),
            }
        }
    }

    fn write_buffer(&mut self, _queue: &SoftHandle, buffer: &SoftHandle, offset: u64, data: &[u8]) {
        if self.lost {
            return;
        }
        let len = data.len() as u64;
        let problem = match self.buffer(*buffer) {
            None => Some("write to a non-buffer"),
            Some(b) if b.usage & BufferUsage::COPY_DST == 0 => Some("buffer lacks COPY_DST usage"),
            Some(b) if b.map != MapState::Unmapped => Some("buffer is mapped"),
            Some(_) if offset % 4 != 0 || len % 4 != 0 => {
                Some("write offset and size must be multiples of 4")
            }
            Some(b) if b.range(offset, len).is_none() => Some("write out of bounds"),
            Some(_) => None,
        };
        if let Some(message) = problem {
            self.fail(ErrorType::Validation, message.into());
            return;
        }
        if let Some(b) = self.buffer_mut(*buffer)
            && let Some(range) = b.range(offset, len)
        {
            b.data[range].copy_from_slice(data);
        }
    }

    fn map_async(&mut self, buffer: &SoftHandle, mode: u32, offset: u64, size: u64, token: u64) {
        if self.lost {
            self.complete(token, MapAsyncStatus::DeviceLost, Vec::new());
            return;
        }
        let needed = match MapMode::validate(mode) {
            Ok(MapMode::READ) => BufferUsage::MAP_READ,
            Ok(_) => BufferUsage::MAP_WRITE,
            Err(_) => 0,
        };
        let problem = match self.buffer(*buffer) {
            None => Some("map of a non-buffer"),
            Some(_) if needed == 0 => Some("invalid map mode"),
            Some(b) if b.usage & needed == 0 => Some("buffer usage does not allow this map mode"),
            Some(b) if b.map != MapState::Unmapped => {
                Some("buffer is already mapped or has a pending map")
            }
            Some(_) if offset % 8 != 0 || size % 4 != 0 => {
                Some("map offset must be a multiple of 8 and size a multiple of 4")
            }
            Some(b) if b.range(offset, size).is_none() => Some("map range out of bounds"),
            Some(_) => None,
        };
        if let Some(message) = problem {
            self.fail(ErrorType::Validation, message.into());
            self.complete(token, MapAsyncStatus::Error, Vec::new());
            return;
        }
        if let Some(b) = self.buffer_mut(*buffer) {
            b.map = MapState::Pending {
                token,
                mode,
                offset,
                size,
            };
            self.pending_maps.push(buffer.0);
        }
    }

    fn write_mapped(&mut self, buffer: &SoftHandle, offset: u64, data: &[u8]) {
        if self.lost {
            return;
        }
        let written = self.buffer_mut(*buffer).is_some_and(|b| {
            let MapState::Mapped {
                mode: MapMode::WRITE,
                offset: start,
                size,
            } = b.map
            else {
                return false;
            };
            let len = data.len() as u64;
            let inside = offset >= start
                && offset
                    .checked_add(len)
                    .is_some_and(|end| start.checked_add(size).is_some_and(|m| end <= m));
            match b.range(offset, len) {
                Some(range) if inside => {
                    b.data[range].copy_from_slice(data);
                    true
                }
                _ => false,
            }
        });
        if !written {
            self.fail(
                ErrorType::Validation,
                "mapped write outside a write-mapped range".into(),
            );
        }
    }

    fn unmap(&mut self, buffer: &SoftHandle) {
        self.abort_pending(buffer.0);
        if let Some(b) = self.buffer_mut(*buffer) {
            b.map = MapState::Unmapped;
        }
    }

    fn push_error_scope(&mut self, _device: &SoftHandle, filter: ErrorFilter) {
        if !self.lost {
            self.error_scopes.push(ErrorScope {
                filter,
                error: None,
            });
        }
    }

    fn pop_error_scope(&mut self, _device: &SoftHandle, token: u64) {
        let (status, captured) = if self.lost {
            (PopErrorScopeStatus::DeviceLost, None)
        } else {
            match self.error_scopes.pop() {
                Some(scope) => (PopErrorScopeStatus::Success, scope.error),
                None => (PopErrorScopeStatus::EmptyStack, None),
            }
        };
        let (error_type, message) = captured.unwrap_or((ErrorType::NoError, String::new()));
        self.events.push_back(BackendEvent::ErrorScopePopped {
            token,
            status,
            error_type,
            message,
        });
    }

    fn inject_error(&mut self, _device: &SoftHandle, error_type: ErrorType, message: &str) {
        if self.lost {
            return;
        }
        match error_type {
            ErrorType::Validation | ErrorType::OutOfMemory | ErrorType::Internal => {
                self.fail(error_type, message.to_owned());
            }
            other => self.fail(
                ErrorType::Validation,
                format!("cannot inject an error of type {other:?}"),
            ),
        }
    }

    fn release(&mut self, kind: ObjectKind, handle: SoftHandle) {
        if matches!(kind, ObjectKind::Device | ObjectKind::Queue) {
            return;
        }
        self.abort_pending(handle.0);
        if self.objects.remove(&handle.0).is_some() {
            trace!(%kind, id = handle.0, "released");
        }
    }

    fn tick(&mut self) -> Vec<BackendEvent> {
        for id in std::mem::take(&mut self.pending_maps) {
            let Some(Object::Buffer(b)) = self.objects.get_mut(&id) else {
                continue;
            };
            let MapState::Pending {
                token,
                mode,
                offset,
                size,
            } = b.map
            else {
                continue;
            };
            b.map = MapState::Mapped { mode, offset, size };
            let data = match (mode, b.range(offset, size)) {
                (MapMode::READ, Some(range)) => b.data[range].to_vec(),
                _ => Vec::new(),
            };
            self.complete(token, MapAsyncStatus::Success, data);
        }
        self.events.drain(..).collect()
    }
}
