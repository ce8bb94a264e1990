//! The GPU implementation a server replays commands against.
//!
//! Every create method returns `None` when the backend rejected the call; the
//! backend reports why through a [`BackendEvent::DeviceError`] on the next
//! [`tick`](Backend::tick). Builders return the reason directly so the server
//! can attribute it to the object.

use std::fmt;

use gpuwire_proto::{
    BindGroupEntry, BindGroupLayoutEntry, BufferDescriptor, DeviceLostReason, ErrorFilter,
    ErrorType, MapAsyncStatus, ObjectKind, PopErrorScopeStatus, ProgrammableStage,
    TextureDescriptor, TextureViewDescriptor,
};

/// An asynchronous result surfaced by [`Backend::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendEvent {
    /// A [`Backend::map_async`] request finished.
    MapCompleted {
        /// Token passed to `map_async`.
        token: u64,
        /// Outcome.
        status: MapAsyncStatus,
        /// Contents of the mapped range for a successful read mapping.
        data: Vec<u8>,
    },
    /// A [`Backend::pop_error_scope`] request finished.
    ErrorScopePopped {
        /// Token passed to `pop_error_scope`.
        token: u64,
        /// Outcome.
        status: PopErrorScopeStatus,
        /// First error the scope captured, `NoError` if none.
        error_type: ErrorType,
        /// Description of the captured error.
        message: String,
    },
    /// A call failed validation or ran out of memory and no error scope
    /// captured it.
    DeviceError {
        /// Error category.
        error_type: ErrorType,
        /// Human-readable reason.
        message: String,
    },
    /// The device is gone; every later call is a no-op.
    DeviceLost {
        /// Why the device was lost.
        reason: DeviceLostReason,
        /// Human-readable reason.
        message: String,
    },
}

/// A GPU device, one method per forward command.
pub trait Backend {
    /// Backend object reference stored in the server's object tables.
    type Handle: Clone + fmt::Debug;

    /// The root device; registered by the server under the bootstrap id.
    fn device(&self) -> Self::Handle;

    /// Returns the device's queue.
    fn get_queue(&mut self, device: &Self::Handle) -> Option<Self::Handle>;

    /// Creates a buffer.
    fn create_buffer(
        &mut self,
        device: &Self::Handle,
        descriptor: &BufferDescriptor,
    ) -> Option<Self::Handle>;

    /// Creates a texture.
    fn create_texture(
        &mut self,
        device: &Self::Handle,
        descriptor: &TextureDescriptor,
    ) -> Option<Self::Handle>;

    /// Creates a view onto `texture`.
    fn create_texture_view(
        &mut self,
        texture: &Self::Handle,
        descriptor: &TextureViewDescriptor,
    ) -> Option<Self::Handle>;

    /// Compiles a shader module.
    fn create_shader_module(
        &mut self,
        device: &Self::Handle,
        label: Option<&str>,
        code: &str,
    ) -> Option<Self::Handle>;

    /// Creates a bind group layout.
    fn create_bind_group_layout(
        &mut self,
        device: &Self::Handle,
        label: Option<&str>,
        entries: &[BindGroupLayoutEntry],
    ) -> Option<Self::Handle>;

    /// Creates a pipeline layout.
    fn create_pipeline_layout(
        &mut self,
        device: &Self::Handle,
        label: Option<&str>,
        bind_group_layouts: &[Self::Handle],
    ) -> Option<Self::Handle>;

    /// Creates a bind group.
    fn create_bind_group(
        &mut self,
        device: &Self::Handle,
        label: Option<&str>,
        layout: &Self::Handle,
        entries: &[BindGroupEntry<Self::Handle>],
    ) -> Option<Self::Handle>;

    /// Creates a compute pipeline.
    fn create_compute_pipeline(
        &mut self,
        device: &Self::Handle,
        label: Option<&str>,
        layout: Option<&Self::Handle>,
        compute: &ProgrammableStage<Self::Handle>,
    ) -> Option<Self::Handle>;

    /// Creates a command encoder.
    fn create_command_encoder(
        &mut self,
        device: &Self::Handle,
        label: Option<&str>,
    ) -> Option<Self::Handle>;

    /// Records a buffer-to-buffer copy.
    fn copy_buffer_to_buffer(
        &mut self,
        encoder: &Self::Handle,
        source: &Self::Handle,
        source_offset: u64,
        destination: &Self::Handle,
        destination_offset: u64,
        size: u64,
    );

    /// Finishes an encoder into a command buffer, or returns why it cannot.
    fn finish(&mut self, encoder: &Self::Handle, label: Option<&str>)
    -> Result<Self::Handle, String>;

    /// Executes command buffers in order.
    fn submit(&mut self, queue: &Self::Handle, command_buffers: &[Self::Handle]);

    /// Writes `data` into `buffer` at `offset`.
    fn write_buffer(&mut self, queue: &Self::Handle, buffer: &Self::Handle, offset: u64, data: &[u8]);

    /// Starts mapping a range; completes as [`BackendEvent::MapCompleted`]
    /// carrying `token`.
    fn map_async(&mut self, buffer: &Self::Handle, mode: u32, offset: u64, size: u64, token: u64);

    /// Stores client-written bytes into a write-mapped range.
    fn write_mapped(&mut self, buffer: &Self::Handle, offset: u64, data: &[u8]);

    /// Unmaps a buffer, aborting pending map requests.
    fn unmap(&mut self, buffer: &Self::Handle);

    /// Opens an error scope capturing errors that match `filter`.
    fn push_error_scope(&mut self, device: &Self::Handle, filter: ErrorFilter);

    /// Closes the innermost error scope; completes as
    /// [`BackendEvent::ErrorScopePopped`] carrying `token`.
    fn pop_error_scope(&mut self, device: &Self::Handle, token: u64);

    /// Raises an error as if a call had failed. Open error scopes see it
    /// first.
    fn inject_error(&mut self, device: &Self::Handle, error_type: ErrorType, message: &str);

    /// Drops the backend's reference to an object.
    fn release(&mut self, kind: ObjectKind, handle: Self::Handle);

    /// Drains asynchronous completions and errors.
    fn tick(&mut self) -> Vec<BackendEvent>;
}
