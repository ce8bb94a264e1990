//! The unprivileged endpoint: turns API calls into forward commands and
//! return commands into callbacks.
//!
//! Objects are named by typed handles ([`Buffer`], [`Queue`], ...) whose ids
//! the client picks itself, so a create call never waits for the server. The
//! server learns about a failed creation only through error callbacks; later
//! calls naming such an object are skipped on the server side.

use std::collections::BTreeMap;
use std::fmt;

use gpuwire_proto::{
    BindGroup, BindGroupEntry, BindGroupLayout, BindGroupLayoutEntry, Buffer,
    BufferDescriptor, BufferMapAsync, BufferMapAsyncCallback, BufferUnmap,
    BufferUpdateMappedData, Command, CommandBuffer, CommandEncoder,
    CommandEncoderCopyBufferToBuffer, CommandEncoderFinish, ComputePipeline, CreateStatus,
    DeserializeAllocator, DestroyObject, Device, DeviceCreateBindGroup,
    DeviceCreateBindGroupLayout, DeviceCreateBuffer, DeviceCreateCommandEncoder,
    DeviceCreateComputePipeline, DeviceCreatePipelineLayout, DeviceCreateShaderModule,
    DeviceCreateTexture, DeviceErrorCallback, DeviceGetQueue, DeviceInjectError,
    DeviceLostCallback, DeviceLostReason, DevicePopErrorScope, DevicePopErrorScopeCallback,
    DevicePushErrorScope, ErrorFilter, ErrorType, IdProvider, MapAsyncStatus, MapMode,
    ObjectErrorCallback, ObjectHandle, ObjectKind, PipelineLayout, PopErrorScopeStatus,
    ProgrammableStage, Queue, QueueSubmit, QueueWriteBuffer, ReturnCommand, ShaderModule,
    Texture, TextureCreateView, TextureDescriptor, TextureView, TextureViewDescriptor, Transfer,
    WireError, WireObject, WireResult,
};
use tracing::{debug, trace, warn};

use crate::config::WireConfig;
use crate::dispatch::{CommandHandler, Dispatcher, HandleOutcome};
use crate::error::{Error, Result};
use crate::objects::KnownObjects;
use crate::server::DEVICE_HANDLE;
use crate::staging::CommandStaging;
use crate::transport::Transport;

/// Allocates a zeroed mapping of `size` bytes without aborting on exhaustion.
fn zeroed(size: u64) -> WireResult<Vec<u8>> {
    let len = usize::try_from(size).map_err(|_| WireError::LengthOverflow)?;
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| WireError::AllocationFailed(len))?;
    data.resize(len, 0);
    Ok(data)
}

/// Receives errors no object callback claimed.
type DeviceErrorHandler = Box<dyn FnMut(ErrorType, &str)>;
/// Receives the device-lost notification.
type DeviceLostHandler = Box<dyn FnMut(DeviceLostReason, &str)>;
/// Receives creation errors of one object.
type ObjectErrorHandler = Box<dyn FnMut(CreateStatus, &str)>;
/// Completes one map request.
type MapCallback = Box<dyn FnOnce(MapAsyncStatus)>;
/// Receives the outcome of an error scope pop.
type PopErrorScopeHandler = Box<dyn FnOnce(PopErrorScopeStatus, ErrorType, &str)>;

/// A map request waiting for its callback.
struct MapRequest {
    /// Requested mode.
    mode: u32,
    /// Start of the range.
    offset: u64,
    /// Length of the range.
    size: u64,
    /// User callback.
    callback: MapCallback,
}

/// The currently mapped range of a buffer.
#[derive(Debug)]
struct Mapping {
    /// Mapped mode.
    mode: u32,
    /// Start of the range within the buffer.
    offset: u64,
    /// Local copy of the range.
    data: Vec<u8>,
}

/// Client-side state of a buffer.
#[derive(Default)]
struct BufferState {
    /// In-flight map requests by request serial.
    pending: BTreeMap<u64, MapRequest>,
    /// Range mapped right now, if any.
    mapping: Option<Mapping>,
}

impl BufferState {
    /// Fails every pending request with `status`, oldest first.
    fn fail_pending(&mut self, status: MapAsyncStatus) {
        for request in std::mem::take(&mut self.pending).into_values() {
            (request.callback)(status);
        }
    }
}

/// What the client keeps per object.
struct ClientObject {
    /// Outstanding references; the object is destroyed at zero.
    refcount: u32,
    /// Creation error callback.
    error_handler: Option<ObjectErrorHandler>,
    /// Mapping state, buffers only.
    buffer: Option<BufferState>,
}

impl ClientObject {
    /// A freshly created object with one reference.
    fn new(kind: ObjectKind) -> Self {
        Self {
            refcount: 1,
            error_handler: None,
            buffer: (kind == ObjectKind::Buffer).then(BufferState::default),
        }
    }
}

impl fmt::Debug for ClientObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientObject")
            .field("refcount", &self.refcount)
            .field("error_handler", &self.error_handler.is_some())
            .field(
                "pending_maps",
                &self.buffer.as_ref().map_or(0, |b| b.pending.len()),
            )
            .finish()
    }
}

/// Encodes object members, refusing objects the client already released.
struct LiveIds<'a>(&'a KnownObjects<ClientObject>);

impl IdProvider<ObjectHandle> for LiveIds<'_> {
    fn get_id(&self, kind: ObjectKind, object: &ObjectHandle) -> WireResult<ObjectHandle> {
        if object.is_null() {
            return Err(WireError::NullObject(kind));
        }
        if self.0.table(kind).resolve(*object).is_none() {
            return Err(WireError::UnknownObject {
                kind,
                handle: *object,
            });
        }
        Ok(*object)
    }
}

/// Everything return commands mutate.
struct ClientState {
    /// Objects the client created.
    objects: KnownObjects<ClientObject>,
    /// Scratch budget of the return command being decoded.
    alloc: DeserializeAllocator,
    /// Forward commands waiting for `flush`.
    staging: CommandStaging,
    /// Next request serial, shared by map requests and error scope pops.
    next_serial: u64,
    /// Error scope pops in flight, by request serial.
    error_scopes: BTreeMap<u64, PopErrorScopeHandler>,
    /// Fallback error callback.
    device_error: Option<DeviceErrorHandler>,
    /// Device-lost callback.
    device_lost: Option<DeviceLostHandler>,
    /// Set once the device is lost.
    lost: bool,
}

/// Serializes API calls for a [`Server`](crate::Server) and runs the
/// callbacks it sends back.
///
/// # Example
///
/// ```
/// use gpuwire::{BufferDescriptor, BufferUsage, Client, WireConfig};
///
/// let mut client = Client::new(&WireConfig::default());
/// let device = client.device();
/// let descriptor = BufferDescriptor {
///     size: 256,
///     usage: BufferUsage::COPY_DST,
///     ..BufferDescriptor::default()
/// };
/// let buffer = client.create_buffer(device, &descriptor).unwrap();
///
/// let mut sent: Vec<Vec<u8>> = Vec::new();
/// client.flush(&mut sent).unwrap();
/// assert_eq!(sent.len(), 1);
/// client.release(buffer).unwrap();
/// ```
pub struct Client {
    /// Receive loop state.
    dispatcher: Dispatcher,
    /// Callback and object state.
    state: ClientState,
    /// Largest transmission handed to the transport.
    max_chunk_size: usize,
    /// Set once the connection is gone.
    disconnected: bool,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("staged_bytes", &self.state.staging.staged_bytes())
            .field("lost", &self.state.lost)
            .field("disconnected", &self.disconnected)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client whose device is already known as
    /// [`DEVICE_HANDLE`].
    pub fn new(config: &WireConfig) -> Self {
        let mut objects = KnownObjects::new();
        if let Ok(device) = objects
            .table_mut(ObjectKind::Device)
            .allocate_handle(DEVICE_HANDLE)
        {
            device.handle = Some(ClientObject::new(ObjectKind::Device));
        }
        Self {
            dispatcher: Dispatcher::new(config.max_command_size),
            state: ClientState {
                objects,
                alloc: DeserializeAllocator::new(config.deserialize_budget),
                staging: CommandStaging::new(config),
                next_serial: 1,
                error_scopes: BTreeMap::new(),
                device_error: None,
                device_lost: None,
                lost: false,
            },
            max_chunk_size: config.max_chunk_size,
            disconnected: false,
        }
    }

    /// The device.
    pub fn device(&self) -> Device {
        Device::from_handle(DEVICE_HANDLE)
    }

    /// Returns `true` once the device is lost or the connection is gone.
    pub const fn is_lost(&self) -> bool {
        self.state.lost
    }

    /// Bytes staged and not yet flushed.
    pub const fn staged_bytes(&self) -> usize {
        self.state.staging.staged_bytes()
    }

    /// Sets the callback for errors no object callback claimed.
    pub fn on_device_error(&mut self, handler: impl FnMut(ErrorType, &str) + 'static) {
        self.state.device_error = Some(Box::new(handler));
    }

    /// Sets the callback run once when the device is lost.
    pub fn on_device_lost(&mut self, handler: impl FnMut(DeviceLostReason, &str) + 'static) {
        self.state.device_lost = Some(Box::new(handler));
    }

    /// Sets the creation error callback of `object`.
    pub fn on_object_error<W: WireObject>(
        &mut self,
        object: W,
        handler: impl FnMut(CreateStatus, &str) + 'static,
    ) -> Result<()> {
        self.state.object_mut(W::KIND, object.handle())?.error_handler = Some(Box::new(handler));
        Ok(())
    }

    /// Fails with [`Error::Disconnected`] once the connection is gone.
    const fn check_connected(&self) -> Result<()> {
        if self.disconnected {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    /// Stages a command without a result.
    fn send<C: Transfer<ObjectHandle> + Command>(&mut self, command: &C) -> Result<()> {
        self.check_connected()?;
        let state = &mut self.state;
        Ok(state.staging.stage(command, &LiveIds(&state.objects))?)
    }

    /// Reserves a handle of kind `W`, stages the command built around it and
    /// rolls the reservation back if staging fails.
    fn create<W, C>(&mut self, build: impl FnOnce(ObjectHandle) -> C) -> Result<W>
    where
        W: WireObject,
        C: Transfer<ObjectHandle> + Command,
    {
        self.check_connected()?;
        let state = &mut self.state;
        let result = state.objects.table_mut(W::KIND).reserve()?;
        let command = build(result);
        if let Err(e) = state.staging.stage(&command, &LiveIds(&state.objects)) {
            state.objects.table_mut(W::KIND).cancel_reservation(result);
            return Err(e.into());
        }
        if let Some(entry) = state.objects.table_mut(W::KIND).resolve_mut(result) {
            entry.handle = Some(ClientObject::new(W::KIND));
        }
        Ok(W::from_handle(result))
    }

    /// Returns the device's queue.
    pub fn get_queue(&mut self, device: Device) -> Result<Queue> {
        self.create(|result| DeviceGetQueue {
            device: device.handle(),
            result,
        })
    }

    /// Creates a buffer. With `mapped_at_creation` the whole buffer starts
    /// write-mapped and zeroed.
    pub fn create_buffer(&mut self, device: Device, descriptor: &BufferDescriptor) -> Result<Buffer> {
        let mapping = if descriptor.mapped_at_creation {
            Some(Mapping {
                mode: MapMode::WRITE,
                offset: 0,
                data: zeroed(descriptor.size)?,
            })
        } else {
            None
        };
        let buffer: Buffer = self.create(|result| DeviceCreateBuffer {
            device: device.handle(),
            result,
            descriptor: descriptor.clone(),
        })?;
        if let Some(state) = self.state.buffer_mut(buffer.handle()) {
            state.mapping = mapping;
        }
        Ok(buffer)
    }

    /// Creates a texture.
    pub fn create_texture(&mut self, device: Device, descriptor: &TextureDescriptor) -> Result<Texture> {
        self.create(|result| DeviceCreateTexture {
            device: device.handle(),
            result,
            descriptor: descriptor.clone(),
        })
    }

    /// Creates a view onto `texture`.
    pub fn create_texture_view(
        &mut self,
        texture: Texture,
        descriptor: &TextureViewDescriptor,
    ) -> Result<TextureView> {
        self.create(|result| TextureCreateView {
            texture: texture.handle(),
            result,
            descriptor: descriptor.clone(),
        })
    }

    /// Creates a shader module from source text.
    pub fn create_shader_module(
        &mut self,
        device: Device,
        label: Option<&str>,
        code: &str,
    ) -> Result<ShaderModule> {
        self.create(|result| DeviceCreateShaderModule {
            device: device.handle(),
            result,
            label: label.map(str::to_owned),
            code: code.to_owned(),
        })
    }

    /// Creates a bind group layout.
    pub fn create_bind_group_layout(
        &mut self,
        device: Device,
        label: Option<&str>,
        entries: &[BindGroupLayoutEntry],
    ) -> Result<BindGroupLayout> {
        self.create(|result| DeviceCreateBindGroupLayout {
            device: device.handle(),
            result,
            label: label.map(str::to_owned),
            entries: entries.to_vec(),
        })
    }

    /// Creates a pipeline layout.
    pub fn create_pipeline_layout(
        &mut self,
        device: Device,
        label: Option<&str>,
        bind_group_layouts: &[BindGroupLayout],
    ) -> Result<PipelineLayout> {
        self.create(|result| DeviceCreatePipelineLayout {
            device: device.handle(),
            result,
            label: label.map(str::to_owned),
            bind_group_layouts: bind_group_layouts.iter().copied().map(WireObject::handle).collect(),
        })
    }

    /// Creates a bind group. Entries name buffers and texture views by raw
    /// handle.
    pub fn create_bind_group(
        &mut self,
        device: Device,
        label: Option<&str>,
        layout: BindGroupLayout,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroup> {
        self.create(|result| DeviceCreateBindGroup {
            device: device.handle(),
            result,
            layout: layout.handle(),
            label: label.map(str::to_owned),
            entries: entries.to_vec(),
        })
    }

    /// Creates a compute pipeline; without `layout` the backend derives one.
    pub fn create_compute_pipeline(
        &mut self,
        device: Device,
        label: Option<&str>,
        layout: Option<PipelineLayout>,
        compute: &ProgrammableStage<ShaderModule>,
    ) -> Result<ComputePipeline> {
        self.create(|result| DeviceCreateComputePipeline {
            device: device.handle(),
            result,
            layout: layout.map(WireObject::handle),
            label: label.map(str::to_owned),
            compute: ProgrammableStage {
                module: compute.module.handle(),
                entry_point: compute.entry_point.clone(),
                constants: compute.constants.clone(),
            },
        })
    }

    /// Creates a command encoder.
    pub fn create_command_encoder(
        &mut self,
        device: Device,
        label: Option<&str>,
    ) -> Result<CommandEncoder> {
        self.create(|result| DeviceCreateCommandEncoder {
            device: device.handle(),
            result,
            label: label.map(str::to_owned),
        })
    }

    /// Records a buffer-to-buffer copy.
    pub fn copy_buffer_to_buffer(
        &mut self,
        encoder: CommandEncoder,
        source: Buffer,
        source_offset: u64,
        destination: Buffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.send(&CommandEncoderCopyBufferToBuffer {
            encoder: encoder.handle(),
            source: source.handle(),
            source_offset,
            destination: destination.handle(),
            destination_offset,
            size,
        })
    }

    /// Finishes `encoder`. A failure arrives as an object error on the
    /// returned command buffer.
    pub fn finish(&mut self, encoder: CommandEncoder, label: Option<&str>) -> Result<CommandBuffer> {
        self.create(|result| CommandEncoderFinish {
            encoder: encoder.handle(),
            result,
            label: label.map(str::to_owned),
        })
    }

    /// Submits command buffers for execution.
    pub fn submit(&mut self, queue: Queue, command_buffers: &[CommandBuffer]) -> Result<()> {
        self.send(&QueueSubmit {
            queue: queue.handle(),
            command_buffers: command_buffers.iter().copied().map(WireObject::handle).collect(),
        })
    }

    /// Writes `data` into `buffer` at `offset`.
    pub fn write_buffer(&mut self, queue: Queue, buffer: Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.send(&QueueWriteBuffer {
            queue: queue.handle(),
            buffer: buffer.handle(),
            buffer_offset: offset,
            data: data.to_vec(),
        })
    }

    /// Opens an error scope: until the matching pop, errors of the
    /// `filter` category go to the scope instead of the device callback.
    pub fn push_error_scope(&mut self, device: Device, filter: ErrorFilter) -> Result<()> {
        self.send(&DevicePushErrorScope {
            device: device.handle(),
            filter,
        })
    }

    /// Closes the innermost error scope and returns the request serial.
    /// `callback` receives the first error the scope captured, or
    /// [`ErrorType::NoError`].
    pub fn pop_error_scope(
        &mut self,
        device: Device,
        callback: impl FnOnce(PopErrorScopeStatus, ErrorType, &str) + 'static,
    ) -> Result<u64> {
        self.check_connected()?;
        let serial = self.state.next_serial;
        self.state.next_serial += 1;
        if self.state.lost {
            callback(PopErrorScopeStatus::DeviceLost, ErrorType::NoError, "");
            return Ok(serial);
        }
        self.state.error_scopes.insert(serial, Box::new(callback));
        let staged = self.send(&DevicePopErrorScope {
            device: device.handle(),
            request_serial: serial,
        });
        if staged.is_err() {
            self.state.error_scopes.remove(&serial);
        }
        staged.map(|()| serial)
    }

    /// Raises an error on the device as if a call had failed.
    pub fn inject_error(&mut self, device: Device, error_type: ErrorType, message: &str) -> Result<()> {
        self.send(&DeviceInjectError {
            device: device.handle(),
            error_type,
            message: message.to_owned(),
        })
    }

    /// Requests a mapping of `size` bytes at `offset` and returns the
    /// request serial. `callback` runs from [`handle_commands`] once the
    /// server answers, or right away if the device is already lost.
    ///
    /// [`handle_commands`]: Self::handle_commands
    pub fn map_async(
        &mut self,
        buffer: Buffer,
        mode: u32,
        offset: u64,
        size: u64,
        callback: impl FnOnce(MapAsyncStatus) + 'static,
    ) -> Result<u64> {
        self.check_connected()?;
        MapMode::validate(mode)?;
        let handle = buffer.handle();
        let serial = self.state.next_serial;
        self.state.next_serial += 1;
        if self.state.lost {
            callback(MapAsyncStatus::DeviceLost);
            return Ok(serial);
        }
        let request = MapRequest {
            mode,
            offset,
            size,
            callback: Box::new(callback),
        };
        self.state
            .buffer_mut(handle)
            .ok_or(WireError::UnknownObject {
                kind: ObjectKind::Buffer,
                handle,
            })?
            .pending
            .insert(serial, request);
        let staged = self.send(&BufferMapAsync {
            buffer: handle,
            request_serial: serial,
            mode,
            offset,
            size,
        });
        if staged.is_err()
            && let Some(state) = self.state.buffer_mut(handle)
        {
            state.pending.remove(&serial);
        }
        staged.map(|()| serial)
    }

    /// Contents of a mapped range.
    pub fn mapped_range(&self, buffer: Buffer) -> Option<&[u8]> {
        let state = self
            .state
            .objects
            .table(ObjectKind::Buffer)
            .resolve(buffer.handle())?
            .handle
            .as_ref()?
            .buffer
            .as_ref()?;
        state.mapping.as_ref().map(|m| m.data.as_slice())
    }

    /// Writable contents of a write-mapped range; sent to the server on
    /// [`unmap`](Self::unmap).
    pub fn mapped_range_mut(&mut self, buffer: Buffer) -> Option<&mut [u8]> {
        let mapping = self.state.buffer_mut(buffer.handle())?.mapping.as_mut()?;
        (mapping.mode == MapMode::WRITE).then_some(mapping.data.as_mut_slice())
    }

    /// Unmaps `buffer`: pending requests are aborted and the contents of a
    /// write mapping are sent back.
    pub fn unmap(&mut self, buffer: Buffer) -> Result<()> {
        self.check_connected()?;
        let handle = buffer.handle();
        let state = self
            .state
            .buffer_mut(handle)
            .ok_or(WireError::UnknownObject {
                kind: ObjectKind::Buffer,
                handle,
            })?;
        state.fail_pending(MapAsyncStatus::Aborted);
        if let Some(mapping) = state.mapping.take()
            && mapping.mode == MapMode::WRITE
        {
            self.send(&BufferUpdateMappedData {
                buffer: handle,
                offset: mapping.offset,
                data: mapping.data,
            })?;
        }
        self.send(&BufferUnmap { buffer: handle })
    }

    /// Adds a reference to `object`.
    pub fn reference<W: WireObject>(&mut self, object: W) -> Result<()> {
        let entry = self.state.object_mut(W::KIND, object.handle())?;
        entry.refcount = entry
            .refcount
            .checked_add(1)
            .ok_or(WireError::LengthOverflow)?;
        Ok(())
    }

    /// Drops a reference to `object`; the last one destroys it on both ends.
    ///
    /// The device cannot be released.
    pub fn release<W: WireObject>(&mut self, object: W) -> Result<()> {
        self.check_connected()?;
        let handle = object.handle();
        if W::KIND == ObjectKind::Device {
            return Err(WireError::BadDestroy {
                kind: W::KIND,
                id: handle.id,
            }
            .into());
        }
        let entry = self.state.object_mut(W::KIND, handle)?;
        if entry.refcount > 1 {
            entry.refcount -= 1;
            return Ok(());
        }
        self.send(&DestroyObject {
            kind: W::KIND,
            id: handle.id,
        })?;
        let freed = self.state.objects.table_mut(W::KIND).free(handle.id);
        if let Some(mut buffer) = freed.and_then(|o| o.handle).and_then(|o| o.buffer) {
            buffer.fail_pending(MapAsyncStatus::Aborted);
        }
        trace!(kind = %W::KIND, %handle, "released");
        Ok(())
    }

    /// Runs the callbacks of every return command completed by `bytes`.
    ///
    /// A malformed return stream loses the device with
    /// [`DeviceLostReason::ConnectionLost`] and disconnects.
    pub fn handle_commands(&mut self, bytes: &[u8]) -> Result<HandleOutcome> {
        self.check_connected()?;
        match self.dispatcher.handle_commands(&mut self.state, bytes) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "malformed return stream, disconnecting");
                self.disconnected = true;
                self.state
                    .lose(DeviceLostReason::ConnectionLost, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Sends every staged command.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        self.check_connected()?;
        Ok(self.state.staging.flush(transport, self.max_chunk_size)?)
    }

    /// Drops staged commands and reports the device lost; every later call
    /// fails with [`Error::Disconnected`].
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        debug!("client disconnected");
        self.disconnected = true;
        self.state.staging.clear();
        self.state
            .lose(DeviceLostReason::ConnectionLost, "connection closed");
    }
}

impl ClientState {
    /// Live object named by `handle`.
    fn object_mut(&mut self, kind: ObjectKind, handle: ObjectHandle) -> Result<&mut ClientObject> {
        self.objects
            .table_mut(kind)
            .resolve_mut(handle)
            .and_then(|o| o.handle.as_mut())
            .ok_or_else(|| WireError::UnknownObject { kind, handle }.into())
    }

    /// Mapping state of a live buffer.
    fn buffer_mut(&mut self, handle: ObjectHandle) -> Option<&mut BufferState> {
        self.objects
            .table_mut(ObjectKind::Buffer)
            .resolve_mut(handle)?
            .handle
            .as_mut()?
            .buffer
            .as_mut()
    }

    /// Marks the device lost, failing every pending map request. Runs the
    /// device-lost callback at most once.
    fn lose(&mut self, reason: DeviceLostReason, message: &str) {
        if self.lost {
            return;
        }
        self.lost = true;
        let buffers = self.objects.table_mut(ObjectKind::Buffer);
        let ids: Vec<u32> = buffers.iter().map(|o| o.id).collect();
        for id in ids {
            if let Some(state) = buffers
                .get_mut(id)
                .and_then(|o| o.handle.as_mut())
                .and_then(|o| o.buffer.as_mut())
            {
                state.fail_pending(MapAsyncStatus::DeviceLost);
            }
        }
        for callback in std::mem::take(&mut self.error_scopes).into_values() {
            callback(PopErrorScopeStatus::DeviceLost, ErrorType::NoError, "");
        }
        if let Some(handler) = self.device_lost.as_mut() {
            handler(reason, message);
        }
    }

    /// Runs the device error callback, or logs when none is set.
    fn report_device_error(&mut self, error_type: ErrorType, message: &str) {
        match self.device_error.as_mut() {
            Some(handler) => handler(error_type, message),
            None => warn!(?error_type, detail = message, "unhandled device error"),
        }
    }

    /// Completes a map request.
    fn map_completed(&mut self, callback: BufferMapAsyncCallback) -> WireResult<()> {
        let BufferMapAsyncCallback {
            buffer,
            request_serial,
            status,
            read_data,
        } = callback;
        let Some(state) = self.buffer_mut(buffer) else {
            trace!(%buffer, "map callback for a stale buffer");
            return Ok(());
        };
        let Some(request) = state.pending.remove(&request_serial) else {
            trace!(%buffer, request_serial, "map callback for a cancelled request");
            return Ok(());
        };
        let mut status = status;
        if status == MapAsyncStatus::Success {
            let data = if request.mode == MapMode::READ {
                if read_data.len() as u64 != request.size {
                    return Err(WireError::InvalidValue("map read data size"));
                }
                Some(read_data)
            } else {
                if !read_data.is_empty() {
                    return Err(WireError::InvalidValue("read data for a write mapping"));
                }
                zeroed(request.size)
                    .inspect_err(|e| warn!(%buffer, error = %e, "write mapping not allocated"))
                    .ok()
            };
            match data {
                Some(data) => {
                    state.mapping = Some(Mapping {
                        mode: request.mode,
                        offset: request.offset,
                        data,
                    });
                }
                None => status = MapAsyncStatus::Error,
            }
        }
        (request.callback)(status);
        Ok(())
    }

    /// Routes an object creation error to its callback or the device.
    fn object_error(&mut self, callback: ObjectErrorCallback) {
        let ObjectErrorCallback {
            kind,
            object,
            status,
            message,
        } = callback;
        let Some(entry) = self
            .objects
            .table_mut(kind)
            .resolve_mut(object)
            .and_then(|o| o.handle.as_mut())
        else {
            trace!(%kind, %object, "error callback for a stale object");
            return;
        };
        if let Some(handler) = entry.error_handler.as_mut() {
            handler(status, &message);
            return;
        }
        let fallback = format!("unhandled error for {kind} {object}: {message}");
        self.report_device_error(ErrorType::Validation, &fallback);
    }
}

impl CommandHandler for ClientState {
    fn handle_command(&mut self, command: &[u8]) -> WireResult<()> {
        let decoded = ReturnCommand::decode(command, &mut self.alloc);
        self.alloc.reset();
        let decoded = decoded?;
        debug!(command = %decoded.tag(), size = command.len(), "callback");
        match decoded {
            ReturnCommand::DeviceErrorCallback(DeviceErrorCallback {
                device,
                error_type,
                message,
            }) => {
                if device == DEVICE_HANDLE {
                    self.report_device_error(error_type, &message);
                }
            }
            ReturnCommand::DeviceLostCallback(DeviceLostCallback {
                device,
                reason,
                message,
            }) => {
                if device == DEVICE_HANDLE {
                    self.lose(reason, &message);
                }
            }
            ReturnCommand::BufferMapAsyncCallback(callback) => self.map_completed(callback)?,
            ReturnCommand::ObjectErrorCallback(callback) => self.object_error(callback),
            ReturnCommand::DevicePopErrorScopeCallback(DevicePopErrorScopeCallback {
                request_serial,
                status,
                error_type,
                message,
                ..
            }) => match self.error_scopes.remove(&request_serial) {
                Some(callback) => callback(status, error_type, &message),
                None => trace!(request_serial, "error scope callback for an unknown request"),
            },
            other => return Err(WireError::UnknownCommand(other.tag() as u32)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use gpuwire_proto::{BufferUsage, HandleIds, codec};

    use super::*;

    fn client() -> Client {
        Client::new(&WireConfig::default())
    }

    fn map_buffer(client: &mut Client) -> Buffer {
        let device = client.device();
        let descriptor = BufferDescriptor {
            size: 8,
            usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            ..BufferDescriptor::default()
        };
        client.create_buffer(device, &descriptor).unwrap()
    }

    fn encode<C: Transfer<ObjectHandle> + Command>(cmd: &C) -> Vec<u8> {
        codec::encode_command(cmd, &HandleIds).unwrap()
    }

    fn statuses() -> (Rc<RefCell<Vec<MapAsyncStatus>>>, impl Fn() -> MapCallback) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let seen = Rc::clone(&seen);
            move || -> MapCallback {
                let seen = Rc::clone(&seen);
                Box::new(move |status| seen.borrow_mut().push(status))
            }
        };
        (seen, make)
    }

    #[test]
    fn oversized_mapped_at_creation_is_an_error() {
        let mut client = client();
        let device = client.device();
        for size in [1 << 46, u64::MAX] {
            let descriptor = BufferDescriptor {
                size,
                usage: BufferUsage::MAP_WRITE,
                mapped_at_creation: true,
                ..BufferDescriptor::default()
            };
            let err = client.create_buffer(device, &descriptor).unwrap_err();
            assert!(
                matches!(
                    err,
                    Error::Wire(WireError::AllocationFailed(_) | WireError::LengthOverflow)
                ),
                "{err}"
            );
        }
        assert_eq!(client.staged_bytes(), 0);
        let buffer = map_buffer(&mut client);
        assert_eq!(buffer.handle(), ObjectHandle::new(1, 1));
    }

    #[test]
    fn ids_are_dense_and_reused_with_new_generation() {
        let mut client = client();
        let device = client.device();
        let first = client.create_command_encoder(device, None).unwrap();
        let second = client.create_command_encoder(device, None).unwrap();
        assert_eq!(first.handle(), ObjectHandle::new(1, 1));
        assert_eq!(second.handle(), ObjectHandle::new(2, 1));

        client.release(first).unwrap();
        let third = client.create_command_encoder(device, None).unwrap();
        assert_eq!(third.handle(), ObjectHandle::new(1, 2));
    }

    #[test]
    fn released_object_cannot_be_used() {
        let mut client = client();
        let buffer = map_buffer(&mut client);
        let queue = client.get_queue(client.device()).unwrap();
        client.release(buffer).unwrap();
        let staged = client.staged_bytes();
        let err = client.write_buffer(queue, buffer, 0, &[1]).unwrap_err();
        assert!(matches!(err, Error::Wire(WireError::UnknownObject { .. })));
        assert_eq!(client.staged_bytes(), staged);
    }

    #[test]
    fn reference_counting_delays_destroy() {
        let mut client = client();
        let buffer = map_buffer(&mut client);
        client.reference(buffer).unwrap();
        client.release(buffer).unwrap();
        let staged = client.staged_bytes();
        client.release(buffer).unwrap();
        assert!(client.staged_bytes() > staged);
        assert!(client.release(buffer).is_err());
    }

    #[test]
    fn device_cannot_be_released() {
        let mut client = client();
        let device = client.device();
        assert!(client.release(device).is_err());
    }

    #[test]
    fn failed_staging_rolls_back_the_reservation() {
        let config = WireConfig::default()
            .initial_block_size(128)
            .max_block_size(128)
            .staging_limit(Some(128));
        let mut client = Client::new(&config);
        let device = client.device();
        let code = "x".repeat(256);
        assert!(client.create_shader_module(device, None, &code).is_err());
        let module = client.create_shader_module(device, None, "").unwrap();
        assert_eq!(module.handle(), ObjectHandle::new(1, 1));
    }

    #[test]
    fn stale_map_callback_is_ignored() {
        let mut client = client();
        let buffer = map_buffer(&mut client);
        let (seen, make) = statuses();
        let serial = client
            .map_async(buffer, MapMode::READ, 0, 8, make())
            .unwrap();
        client.unmap(buffer).unwrap();
        assert_eq!(*seen.borrow(), [MapAsyncStatus::Aborted]);

        let late = encode(&BufferMapAsyncCallback {
            buffer: buffer.handle(),
            request_serial: serial,
            status: MapAsyncStatus::Success,
            read_data: vec![0; 8],
        });
        client.handle_commands(&late).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert!(client.mapped_range(buffer).is_none());
    }

    #[test]
    fn wrong_read_size_is_fatal() {
        let mut client = client();
        let buffer = map_buffer(&mut client);
        let (seen, make) = statuses();
        let serial = client
            .map_async(buffer, MapMode::READ, 0, 8, make())
            .unwrap();
        let bad = encode(&BufferMapAsyncCallback {
            buffer: buffer.handle(),
            request_serial: serial,
            status: MapAsyncStatus::Success,
            read_data: vec![0; 3],
        });
        assert!(client.handle_commands(&bad).is_err());
        assert!(client.is_lost());
        assert!(matches!(client.flush(&mut Vec::new()), Err(Error::Disconnected)));
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn device_lost_fails_pending_and_later_maps() {
        let mut client = client();
        let buffer = map_buffer(&mut client);
        let (seen, make) = statuses();
        let reasons = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&reasons);
        client.on_device_lost(move |reason, _| sink.borrow_mut().push(reason));

        client
            .map_async(buffer, MapMode::READ, 0, 8, make())
            .unwrap();
        let lost = encode(&DeviceLostCallback {
            device: DEVICE_HANDLE,
            reason: DeviceLostReason::Destroyed,
            message: "gone".into(),
        });
        client.handle_commands(&lost).unwrap();
        client.handle_commands(&lost).unwrap();
        client
            .map_async(buffer, MapMode::READ, 0, 8, make())
            .unwrap();

        assert_eq!(*reasons.borrow(), [DeviceLostReason::Destroyed]);
        assert_eq!(
            *seen.borrow(),
            [MapAsyncStatus::DeviceLost, MapAsyncStatus::DeviceLost]
        );
    }

    #[test]
    fn error_scope_callbacks_match_their_serial() {
        let mut client = client();
        let device = client.device();
        let popped = Rc::new(RefCell::new(Vec::new()));
        client.push_error_scope(device, ErrorFilter::Validation).unwrap();
        let mut serials = Vec::new();
        for _ in 0..2 {
            let sink = Rc::clone(&popped);
            serials.push(
                client
                    .pop_error_scope(device, move |status, error_type, message| {
                        sink.borrow_mut().push((status, error_type, message.to_owned()));
                    })
                    .unwrap(),
            );
        }

        let answer = |request_serial, status, error_type, message: &str| {
            encode(&DevicePopErrorScopeCallback {
                device: DEVICE_HANDLE,
                request_serial,
                status,
                error_type,
                message: message.into(),
            })
        };
        client
            .handle_commands(&answer(
                serials[0],
                PopErrorScopeStatus::Success,
                ErrorType::Validation,
                "bad copy",
            ))
            .unwrap();
        // Answered twice: the second copy is stale.
        client
            .handle_commands(&answer(
                serials[0],
                PopErrorScopeStatus::Success,
                ErrorType::NoError,
                "",
            ))
            .unwrap();
        assert_eq!(
            *popped.borrow(),
            [(
                PopErrorScopeStatus::Success,
                ErrorType::Validation,
                "bad copy".to_owned()
            )]
        );

        client.disconnect();
        assert_eq!(popped.borrow().len(), 2);
        assert_eq!(popped.borrow()[1].0, PopErrorScopeStatus::DeviceLost);
        assert!(matches!(
            client.pop_error_scope(device, |_, _, _| {}),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn object_error_falls_back_to_device_error() {
        let mut client = client();
        let device = client.device();
        let encoder = client.create_command_encoder(device, None).unwrap();
        let claimed = client.finish(encoder, None).unwrap();
        let unclaimed = client.finish(encoder, None).unwrap();

        let object_errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&object_errors);
        client
            .on_object_error(claimed, move |status, _| sink.borrow_mut().push(status))
            .unwrap();
        let device_errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&device_errors);
        client.on_device_error(move |_, message| sink.borrow_mut().push(message.to_owned()));

        for object in [claimed.handle(), unclaimed.handle()] {
            let error = encode(&ObjectErrorCallback {
                kind: ObjectKind::CommandBuffer,
                object,
                status: CreateStatus::Error,
                message: "already finished".into(),
            });
            client.handle_commands(&error).unwrap();
        }

        assert_eq!(*object_errors.borrow(), [CreateStatus::Error]);
        assert_eq!(
            *device_errors.borrow(),
            ["unhandled error for command buffer #2@1: already finished"]
        );
    }

    #[test]
    fn disconnect_reports_connection_lost() {
        let mut client = client();
        let reasons = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&reasons);
        client.on_device_lost(move |reason, _| sink.borrow_mut().push(reason));
        client.disconnect();
        client.disconnect();
        assert_eq!(*reasons.borrow(), [DeviceLostReason::ConnectionLost]);
        assert!(matches!(
            client.get_queue(client.device()),
            Err(Error::Disconnected)
        ));
    }
}
