//! The privileged endpoint: replays forward commands against a [`Backend`].

use std::collections::HashMap;

use gpuwire_proto::{
    BufferMapAsyncCallback, Command, CommandEncoderFinish, CreateStatus, DeserializeAllocator,
    DestroyObject, DeviceErrorCallback, DeviceLostCallback, DevicePopErrorScope,
    DevicePopErrorScopeCallback, ErrorType, ForwardCommand, HandleIds, MapAsyncStatus, MapMode,
    MapObjects, ObjectErrorCallback, ObjectHandle, ObjectKind, PopErrorScopeStatus, Transfer,
    WireError, WireResult, codec,
};
use tracing::{debug, trace, warn};

use crate::backend::{Backend, BackendEvent};
use crate::config::WireConfig;
use crate::dispatch::{CommandHandler, Dispatcher, HandleOutcome};
use crate::error::{Error, Result};
use crate::objects::KnownObjects;
use crate::staging::CommandStaging;
use crate::transport::Transport;

/// Handle both endpoints use for the device before any command is exchanged.
pub const DEVICE_HANDLE: ObjectHandle = ObjectHandle::new(1, 1);

/// A map request forwarded to the backend.
#[derive(Debug, Clone, Copy)]
struct PendingMap {
    /// Buffer as named by the client.
    buffer: ObjectHandle,
    /// Client request serial.
    request_serial: u64,
    /// Requested mode.
    mode: u32,
    /// Start of the range.
    offset: u64,
    /// Length of the range.
    size: u64,
}

/// A range currently mapped for the client.
#[derive(Debug, Clone, Copy)]
struct MappedRange {
    /// Buffer as named by the client.
    buffer: ObjectHandle,
    /// Mapped mode.
    mode: u32,
    /// Start of the range.
    offset: u64,
    /// Length of the range.
    size: u64,
}

impl MappedRange {
    /// Returns `true` if `len` bytes at `offset` lie inside a write mapping.
    fn accepts_write(&self, offset: u64, len: u64) -> bool {
        let Some(end) = offset.checked_add(len) else {
            return false;
        };
        self.mode == MapMode::WRITE
            && offset >= self.offset
            && self.offset.checked_add(self.size).is_some_and(|m| end <= m)
    }
}

/// Everything the server mutates while executing a command.
#[derive(Debug)]
struct ServerState<B: Backend> {
    /// Backend the commands are replayed against.
    backend: B,
    /// Client-named objects and their backend handles.
    objects: KnownObjects<B::Handle>,
    /// Scratch budget of the command being decoded.
    alloc: DeserializeAllocator,
    /// Return commands waiting for `flush`.
    returns: CommandStaging,
    /// Map requests in flight, by backend token.
    pending_maps: HashMap<u64, PendingMap>,
    /// Mapped ranges, by buffer id.
    mapped: HashMap<u32, MappedRange>,
    /// Client serials of error scope pops in flight, by backend token.
    pending_pops: HashMap<u64, u64>,
    /// Next backend request token.
    next_token: u64,
    /// Commands executed so far.
    commands: u64,
}

/// Decodes forward commands and sends callbacks back.
///
/// # Example
///
/// ```
/// use gpuwire::{Server, SoftwareBackend, WireConfig};
///
/// let mut server = Server::new(SoftwareBackend::new(), &WireConfig::default());
/// server.handle_commands(&[]).unwrap();
/// assert_eq!(server.commands_handled(), 0);
/// ```
#[derive(Debug)]
pub struct Server<B: Backend> {
    /// Receive loop state.
    dispatcher: Dispatcher,
    /// Execution state.
    state: ServerState<B>,
    /// Largest transmission handed to the transport.
    max_chunk_size: usize,
    /// Set after a fatal protocol error.
    dead: bool,
}

impl<B: Backend> Server<B> {
    /// Creates a server around `backend`; the backend's device is registered
    /// as [`DEVICE_HANDLE`].
    pub fn new(backend: B, config: &WireConfig) -> Self {
        let mut objects = KnownObjects::new();
        let device = backend.device();
        if let Ok(entry) = objects
            .table_mut(ObjectKind::Device)
            .allocate_handle(DEVICE_HANDLE)
        {
            entry.handle = Some(device);
        }
        Self {
            dispatcher: Dispatcher::new(config.max_command_size),
            state: ServerState {
                backend,
                objects,
                alloc: DeserializeAllocator::new(config.deserialize_budget),
                returns: CommandStaging::new(config),
                pending_maps: HashMap::new(),
                mapped: HashMap::new(),
                pending_pops: HashMap::new(),
                next_token: 1,
                commands: 0,
            },
            max_chunk_size: config.max_chunk_size,
            dead: false,
        }
    }

    /// The backend.
    pub const fn backend(&self) -> &B {
        &self.state.backend
    }

    /// Mutable access to the backend.
    pub const fn backend_mut(&mut self) -> &mut B {
        &mut self.state.backend
    }

    /// Commands executed so far.
    pub const fn commands_handled(&self) -> u64 {
        self.state.commands
    }

    /// Returns `true` after a fatal protocol error.
    pub const fn is_dead(&self) -> bool {
        self.dead
    }

    /// Backend handle of a live object; `Some(None)` if its creation failed.
    pub fn object(&self, kind: ObjectKind, handle: ObjectHandle) -> Option<Option<&B::Handle>> {
        let object = self.state.objects.table(kind).resolve(handle)?;
        Some(object.handle.as_ref().filter(|_| object.valid))
    }

    /// Number of live objects of `kind`.
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state.objects.table(kind).live_count()
    }

    /// Executes every command completed by `bytes`. Backend events are
    /// collected into return commands after each command, so errors reach
    /// the client in stream order.
    ///
    /// A fatal error kills the connection; every later call fails with
    /// [`Error::Disconnected`].
    pub fn handle_commands(&mut self, bytes: &[u8]) -> Result<HandleOutcome> {
        if self.dead {
            return Err(Error::Disconnected);
        }
        let result = self.dispatcher.handle_commands(&mut self.state, bytes);
        result.map_err(|e| {
            warn!(error = %e, "fatal protocol error, closing connection");
            self.dead = true;
            e.into()
        })
    }

    /// Polls the backend for asynchronous completions.
    pub fn tick(&mut self) -> Result<()> {
        if self.dead {
            return Err(Error::Disconnected);
        }
        Ok(self.state.pump_events()?)
    }

    /// Sends every staged return command.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        Ok(self.state.returns.flush(transport, self.max_chunk_size)?)
    }
}

impl<B: Backend> ServerState<B> {
    /// Stages a return command.
    fn send<C: Transfer<ObjectHandle> + Command>(&mut self, command: &C) -> WireResult<()> {
        self.returns.stage(command, &HandleIds)
    }

    /// Reports an error to the client's device.
    fn device_error(&mut self, error_type: ErrorType, message: String) -> WireResult<()> {
        self.send(&DeviceErrorCallback {
            device: DEVICE_HANDLE,
            error_type,
            message,
        })
    }

    /// Raises a validation error through the backend so open error scopes
    /// see it.
    fn validation_error(&mut self, message: &str) {
        let device = self.backend.device();
        self.backend
            .inject_error(&device, ErrorType::Validation, message);
    }

    /// Hands out the next backend request token.
    const fn token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Turns backend events into return commands.
    fn pump_events(&mut self) -> WireResult<()> {
        for event in self.backend.tick() {
            match event {
                BackendEvent::MapCompleted {
                    token,
                    status,
                    data,
                } => {
                    let Some(request) = self.pending_maps.remove(&token) else {
                        warn!(token, "completion for an unknown map request");
                        continue;
                    };
                    if status == MapAsyncStatus::Success {
                        self.mapped.insert(
                            request.buffer.id,
                            MappedRange {
                                buffer: request.buffer,
                                mode: request.mode,
                                offset: request.offset,
                                size: request.size,
                            },
                        );
                    }
                    self.send(&BufferMapAsyncCallback {
                        buffer: request.buffer,
                        request_serial: request.request_serial,
                        status,
                        read_data: data,
                    })?;
                }
                BackendEvent::ErrorScopePopped {
                    token,
                    status,
                    error_type,
                    message,
                } => {
                    let Some(request_serial) = self.pending_pops.remove(&token) else {
                        warn!(token, "completion for an unknown error scope pop");
                        continue;
                    };
                    self.send(&DevicePopErrorScopeCallback {
                        device: DEVICE_HANDLE,
                        request_serial,
                        status,
                        error_type,
                        message,
                    })?;
                }
                BackendEvent::DeviceError {
                    error_type,
                    message,
                } => self.device_error(error_type, message)?,
                BackendEvent::DeviceLost { reason, message } => {
                    warn!(?reason, detail = %message, "backend device lost");
                    self.send(&DeviceLostCallback {
                        device: DEVICE_HANDLE,
                        reason,
                        message,
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolves a create command, pre-allocates its result under the
    /// client's handle and runs `make` unless an argument is an error object.
    ///
    /// Returns `true` if the backend created the object.
    fn create<C, F>(
        &mut self,
        kind: ObjectKind,
        result: ObjectHandle,
        command: C,
        make: F,
    ) -> WireResult<bool>
    where
        C: MapObjects,
        F: FnOnce(&mut B, C::Mapped<B::Handle>) -> Option<B::Handle>,
    {
        let resolved = codec::resolve::<_, B::Handle, _>(command, &self.objects)?;
        let entry = self.objects.table_mut(kind).allocate_handle(result)?;
        let Some(args) = resolved.into_ready() else {
            debug!(%kind, %result, "argument is an error object, result created invalid");
            entry.valid = false;
            return Ok(false);
        };
        let handle = make(&mut self.backend, args);
        entry.valid = handle.is_some();
        entry.handle = handle;
        Ok(entry.valid)
    }

    /// Resolves a command without a result; `None` for an error object.
    fn ready<C: MapObjects>(&self, command: C) -> WireResult<Option<C::Mapped<B::Handle>>> {
        Ok(codec::resolve::<_, B::Handle, _>(command, &self.objects)?.into_ready())
    }

    /// Executes one decoded command.
    fn execute(&mut self, command: ForwardCommand) -> WireResult<()> {
        match command {
            ForwardCommand::DeviceGetQueue(cmd) => {
                self.create(ObjectKind::Queue, cmd.result, cmd, |b, c| b.get_queue(&c.device))?;
            }
            ForwardCommand::DeviceCreateBuffer(cmd) => {
                let result = cmd.result;
                let mapped_size = cmd
                    .descriptor
                    .mapped_at_creation
                    .then_some(cmd.descriptor.size);
                let created = self.create(ObjectKind::Buffer, result, cmd, |b, c| {
                    b.create_buffer(&c.device, &c.descriptor)
                })?;
                if let (true, Some(size)) = (created, mapped_size) {
                    self.mapped.insert(
                        result.id,
                        MappedRange {
                            buffer: result,
                            mode: MapMode::WRITE,
                            offset: 0,
                            size,
                        },
                    );
                }
            }
            ForwardCommand::DeviceCreateTexture(cmd) => {
                self.create(ObjectKind::Texture, cmd.result, cmd, |b, c| {
                    b.create_texture(&c.device, &c.descriptor)
                })?;
            }
            ForwardCommand::TextureCreateView(cmd) => {
                self.create(ObjectKind::TextureView, cmd.result, cmd, |b, c| {
                    b.create_texture_view(&c.texture, &c.descriptor)
                })?;
            }
            ForwardCommand::DeviceCreateShaderModule(cmd) => {
                self.create(ObjectKind::ShaderModule, cmd.result, cmd, |b, c| {
                    b.create_shader_module(&c.device, c.label.as_deref(), &c.code)
                })?;
            }
            ForwardCommand::DeviceCreateBindGroupLayout(cmd) => {
                self.create(ObjectKind::BindGroupLayout, cmd.result, cmd, |b, c| {
                    b.create_bind_group_layout(&c.device, c.label.as_deref(), &c.entries)
                })?;
            }
            ForwardCommand::DeviceCreatePipelineLayout(cmd) => {
                self.create(ObjectKind::PipelineLayout, cmd.result, cmd, |b, c| {
                    b.create_pipeline_layout(&c.device, c.label.as_deref(), &c.bind_group_layouts)
                })?;
            }
            ForwardCommand::DeviceCreateBindGroup(cmd) => {
                self.create(ObjectKind::BindGroup, cmd.result, cmd, |b, c| {
                    b.create_bind_group(&c.device, c.label.as_deref(), &c.layout, &c.entries)
                })?;
            }
            ForwardCommand::DeviceCreateComputePipeline(cmd) => {
                self.create(ObjectKind::ComputePipeline, cmd.result, cmd, |b, c| {
                    b.create_compute_pipeline(
                        &c.device,
                        c.label.as_deref(),
                        c.layout.as_ref(),
                        &c.compute,
                    )
                })?;
            }
            ForwardCommand::DeviceCreateCommandEncoder(cmd) => {
                self.create(ObjectKind::CommandEncoder, cmd.result, cmd, |b, c| {
                    b.create_command_encoder(&c.device, c.label.as_deref())
                })?;
            }
            ForwardCommand::CommandEncoderCopyBufferToBuffer(cmd) => {
                let encoder = cmd.encoder;
                match self.ready(cmd)? {
                    Some(c) => self.backend.copy_buffer_to_buffer(
                        &c.encoder,
                        &c.source,
                        c.source_offset,
                        &c.destination,
                        c.destination_offset,
                        c.size,
                    ),
                    None => {
                        debug!(%encoder, "copy with an error object, encoder invalidated");
                        if let Some(entry) = self
                            .objects
                            .table_mut(ObjectKind::CommandEncoder)
                            .resolve_mut(encoder)
                        {
                            entry.valid = false;
                        }
                    }
                }
            }
            ForwardCommand::CommandEncoderFinish(cmd) => self.finish(cmd)?,
            ForwardCommand::QueueSubmit(cmd) => match self.ready(cmd)? {
                Some(c) => self.backend.submit(&c.queue, &c.command_buffers),
                None => self.validation_error("submit references an invalid command buffer"),
            },
            ForwardCommand::QueueWriteBuffer(cmd) => match self.ready(cmd)? {
                Some(c) => self
                    .backend
                    .write_buffer(&c.queue, &c.buffer, c.buffer_offset, &c.data),
                None => self.validation_error("write to an invalid buffer"),
            },
            ForwardCommand::BufferMapAsync(cmd) => {
                let request = PendingMap {
                    buffer: cmd.buffer,
                    request_serial: cmd.request_serial,
                    mode: cmd.mode,
                    offset: cmd.offset,
                    size: cmd.size,
                };
                match self.ready(cmd)? {
                    Some(c) => {
                        let token = self.token();
                        self.pending_maps.insert(token, request);
                        self.backend
                            .map_async(&c.buffer, c.mode, c.offset, c.size, token);
                    }
                    None => self.send(&BufferMapAsyncCallback {
                        buffer: request.buffer,
                        request_serial: request.request_serial,
                        status: MapAsyncStatus::Error,
                        read_data: Vec::new(),
                    })?,
                }
            }
            ForwardCommand::BufferUpdateMappedData(cmd) => {
                let buffer = cmd.buffer;
                let Some(c) = self.ready(cmd)? else {
                    debug!(%buffer, "mapped data for an invalid buffer dropped");
                    return Ok(());
                };
                let accepted = self.mapped.get(&buffer.id).is_some_and(|m| {
                    m.buffer == buffer && m.accepts_write(c.offset, c.data.len() as u64)
                });
                if !accepted {
                    return Err(WireError::InvalidValue("mapped data range"));
                }
                self.backend.write_mapped(&c.buffer, c.offset, &c.data);
            }
            ForwardCommand::BufferUnmap(cmd) => {
                let buffer = cmd.buffer;
                if let Some(c) = self.ready(cmd)? {
                    self.backend.unmap(&c.buffer);
                }
                self.mapped.remove(&buffer.id);
            }
            ForwardCommand::DestroyObject(cmd) => self.destroy(cmd)?,
            ForwardCommand::DevicePushErrorScope(cmd) => {
                if let Some(c) = self.ready(cmd)? {
                    self.backend.push_error_scope(&c.device, c.filter);
                }
            }
            ForwardCommand::DevicePopErrorScope(cmd) => self.pop_error_scope(cmd)?,
            ForwardCommand::DeviceInjectError(cmd) => {
                if let Some(c) = self.ready(cmd)? {
                    self.backend
                        .inject_error(&c.device, c.error_type, &c.message);
                }
            }
            other => return Err(WireError::UnknownCommand(other.tag() as u32)),
        }
        Ok(())
    }

    /// Finishes an encoder; failures are reported on the command buffer.
    fn finish(&mut self, cmd: CommandEncoderFinish) -> WireResult<()> {
        let result = cmd.result;
        let resolved = codec::resolve::<_, B::Handle, _>(cmd, &self.objects)?;
        let outcome = match resolved.into_ready() {
            Some(c) => self
                .backend
                .finish(&c.encoder, c.label.as_deref())
                .map_err(|message| (CreateStatus::Error, message)),
            None => Err((
                CreateStatus::InvalidInput,
                "command encoder is invalid".to_owned(),
            )),
        };
        let entry = self
            .objects
            .table_mut(ObjectKind::CommandBuffer)
            .allocate_handle(result)?;
        match outcome {
            Ok(handle) => {
                entry.handle = Some(handle);
                Ok(())
            }
            Err((status, message)) => {
                entry.valid = false;
                debug!(%result, detail = %message, "finish failed");
                self.send(&ObjectErrorCallback {
                    kind: ObjectKind::CommandBuffer,
                    object: result,
                    status,
                    message,
                })
            }
        }
    }

    /// Forwards an error scope pop; the answer arrives as a backend event.
    fn pop_error_scope(&mut self, cmd: DevicePopErrorScope) -> WireResult<()> {
        let request_serial = cmd.request_serial;
        let Some(c) = self.ready(cmd)? else {
            return self.send(&DevicePopErrorScopeCallback {
                device: DEVICE_HANDLE,
                request_serial,
                status: PopErrorScopeStatus::EmptyStack,
                error_type: ErrorType::NoError,
                message: String::new(),
            });
        };
        let token = self.token();
        self.pending_pops.insert(token, request_serial);
        self.backend.pop_error_scope(&c.device, token);
        Ok(())
    }

    /// Frees a client object and releases its backend handle.
    fn destroy(&mut self, cmd: DestroyObject) -> WireResult<()> {
        let DestroyObject { kind, id } = cmd;
        if kind == ObjectKind::Device {
            return Err(WireError::BadDestroy { kind, id });
        }
        let object = self
            .objects
            .table_mut(kind)
            .free(id)
            .ok_or(WireError::BadDestroy { kind, id })?;
        if kind == ObjectKind::Buffer {
            self.mapped.remove(&id);
        }
        if let Some(handle) = object.handle {
            self.backend.release(kind, handle);
        }
        trace!(%kind, id, "destroyed");
        Ok(())
    }
}

impl<B: Backend> CommandHandler for ServerState<B> {
    fn handle_command(&mut self, command: &[u8]) -> WireResult<()> {
        let decoded = ForwardCommand::decode(command, &mut self.alloc);
        self.alloc.reset();
        let decoded = decoded?;
        debug!(command = %decoded.tag(), size = command.len(), "executing");
        self.commands += 1;
        self.execute(decoded)?;
        self.pump_events()
    }
}

impl<B: Backend> Drop for ServerState<B> {
    fn drop(&mut self) {
        for kind in ObjectKind::ALL.into_iter().rev() {
            for object in self.objects.table_mut(kind).take_all() {
                if let Some(handle) = object.handle {
                    self.backend.release(kind, handle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use gpuwire_proto::{
        BufferDescriptor, BufferUsage, DeviceCreateBuffer, DeviceGetQueue, DevicePushErrorScope,
        ErrorFilter, QueueWriteBuffer, ReturnCommand, codec::encode_command,
    };

    use super::*;
    use crate::software::SoftwareBackend;

    fn server() -> Server<SoftwareBackend> {
        Server::new(SoftwareBackend::new(), &WireConfig::default())
    }

    fn encode<C: Transfer<ObjectHandle> + Command>(cmd: &C) -> Vec<u8> {
        encode_command(cmd, &HandleIds).unwrap()
    }

    fn create_buffer(id: u32, generation: u32, size: u64) -> Vec<u8> {
        encode(&DeviceCreateBuffer {
            device: DEVICE_HANDLE,
            result: ObjectHandle::new(id, generation),
            descriptor: BufferDescriptor {
                size,
                usage: BufferUsage::COPY_DST,
                ..BufferDescriptor::default()
            },
        })
    }

    fn returns(server: &mut Server<SoftwareBackend>) -> Vec<ReturnCommand> {
        let mut sent: Vec<Vec<u8>> = Vec::new();
        server.flush(&mut sent).unwrap();
        let stream = sent.concat();
        let mut alloc = DeserializeAllocator::new(1 << 20);
        let mut out = Vec::new();
        let mut rest = &stream[..];
        while !rest.is_empty() {
            let (size, _) = codec::peek_envelope(rest).unwrap();
            out.push(ReturnCommand::decode(&rest[..size], &mut alloc).unwrap());
            rest = &rest[size..];
        }
        out
    }

    #[test]
    fn device_is_bootstrapped() {
        let server = server();
        assert!(matches!(
            server.object(ObjectKind::Device, DEVICE_HANDLE),
            Some(Some(_))
        ));
    }

    #[test]
    fn create_then_destroy() {
        let mut server = server();
        server.handle_commands(&create_buffer(1, 1, 16)).unwrap();
        assert_eq!(server.live_count(ObjectKind::Buffer), 1);
        assert_eq!(server.backend().object_count(), 2);

        let destroy = encode(&DestroyObject {
            kind: ObjectKind::Buffer,
            id: 1,
        });
        server.handle_commands(&destroy).unwrap();
        assert_eq!(server.live_count(ObjectKind::Buffer), 0);
        assert_eq!(server.backend().object_count(), 1);
    }

    #[test]
    fn backend_failure_creates_invalid_object_and_reports() {
        let mut server = server();
        server.handle_commands(&create_buffer(1, 1, 0)).unwrap();
        assert!(matches!(
            server.object(ObjectKind::Buffer, ObjectHandle::new(1, 1)),
            Some(None)
        ));
        let returned = returns(&mut server);
        assert!(matches!(
            returned.as_slice(),
            [ReturnCommand::DeviceErrorCallback(DeviceErrorCallback {
                error_type: ErrorType::Validation,
                ..
            })]
        ));
    }

    #[test]
    fn error_object_argument_skips_the_call() {
        let mut server = server();
        let queue = ObjectHandle::new(1, 1);
        server
            .handle_commands(&encode(&DeviceGetQueue {
                device: DEVICE_HANDLE,
                result: queue,
            }))
            .unwrap();
        let write = encode(&QueueWriteBuffer {
            queue,
            buffer: ObjectHandle::new(7, 1),
            buffer_offset: 0,
            data: vec![0; 4],
        });
        server.handle_commands(&write).unwrap();
        assert!(!server.is_dead());
        assert_eq!(returns(&mut server).len(), 1);
    }

    #[test]
    fn error_scope_captures_error_object_failures() {
        let mut server = server();
        let queue = ObjectHandle::new(1, 1);
        let stream = [
            encode(&DeviceGetQueue {
                device: DEVICE_HANDLE,
                result: queue,
            }),
            encode(&DevicePushErrorScope {
                device: DEVICE_HANDLE,
                filter: ErrorFilter::Validation,
            }),
            encode(&QueueWriteBuffer {
                queue,
                buffer: ObjectHandle::new(7, 1),
                buffer_offset: 0,
                data: vec![0; 4],
            }),
            encode(&DevicePopErrorScope {
                device: DEVICE_HANDLE,
                request_serial: 12,
            }),
            encode(&DevicePopErrorScope {
                device: DEVICE_HANDLE,
                request_serial: 13,
            }),
        ]
        .concat();
        server.handle_commands(&stream).unwrap();

        let returned = returns(&mut server);
        let [
            ReturnCommand::DevicePopErrorScopeCallback(first),
            ReturnCommand::DevicePopErrorScopeCallback(second),
        ] = returned.as_slice()
        else {
            panic!("unexpected returns {returned:?}");
        };
        assert_eq!(first.request_serial, 12);
        assert_eq!(first.status, PopErrorScopeStatus::Success);
        assert_eq!(first.error_type, ErrorType::Validation);
        assert_eq!(first.message, "write to an invalid buffer");
        assert_eq!(second.request_serial, 13);
        assert_eq!(second.status, PopErrorScopeStatus::EmptyStack);
    }

    #[test]
    fn destroying_the_device_is_fatal() {
        let mut server = server();
        let destroy = encode(&DestroyObject {
            kind: ObjectKind::Device,
            id: 1,
        });
        let err = server.handle_commands(&destroy).unwrap_err();
        assert!(matches!(err, Error::Wire(WireError::BadDestroy { .. })));
        assert!(matches!(
            server.handle_commands(&[]),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn destroying_unknown_or_null_id_is_fatal() {
        for id in [0, 3] {
            let mut server = server();
            let destroy = encode(&DestroyObject {
                kind: ObjectKind::Buffer,
                id,
            });
            assert!(server.handle_commands(&destroy).is_err());
        }
    }

    #[test]
    fn result_handle_must_follow_the_table() {
        let mut server = server();
        let err = server.handle_commands(&create_buffer(2, 1, 4)).unwrap_err();
        assert!(matches!(err, Error::Wire(WireError::BadAllocation { .. })));
    }

    #[test]
    fn live_objects_hold_backend_handles() {
        let mut server = server();
        server.handle_commands(&create_buffer(1, 1, 4)).unwrap();
        server.handle_commands(&create_buffer(2, 1, 4)).unwrap();
        assert_eq!(server.backend().object_count(), 3);
        let state = &mut server.state;
        let released: Vec<_> = ObjectKind::ALL
            .into_iter()
            .flat_map(|kind| state.objects.table_mut(kind).take_all())
            .filter_map(|object| object.handle)
            .collect();
        assert_eq!(released.len(), 3);
    }
}
