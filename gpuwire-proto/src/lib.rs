//! Wire format for gpuwire client-server GPU command streams.
//!
//! A client serializes every API call into a packed little-endian record;
//! a server decodes the records, replays them against a GPU backend and
//! sends callback results back as *return* records. This crate holds the
//! shared vocabulary: object handles, the checked byte cursors, the
//! transfer codec contract, every forward and return record, chunked
//! reassembly and the trace file format.

#[macro_use]
mod macros;

mod chunked;
mod commands;
mod cursor;
mod error;
mod handle;
mod returns;
mod structs;
mod types;

pub mod codec;
pub mod trace;

pub use chunked::{ChunkOutcome, ChunkedReassembler, chunks};
pub use codec::{
    Command, Decode, DeserializeAllocator, ENVELOPE_SIZE, HandleIds, IdProvider, IdResolver,
    Layout, LookupOutcome, MapObjects, Resolved, Role, Transfer, resolve,
};
pub use commands::{
    BufferMapAsync, BufferUnmap, BufferUpdateMappedData, CommandEncoderCopyBufferToBuffer,
    CommandEncoderFinish, CommandTag, DestroyObject, DeviceCreateBindGroup,
    DeviceCreateBindGroupLayout, DeviceCreateBuffer, DeviceCreateCommandEncoder,
    DeviceCreateComputePipeline, DeviceCreatePipelineLayout, DeviceCreateShaderModule,
    DeviceCreateTexture, DeviceGetQueue, DeviceInjectError, DevicePopErrorScope,
    DevicePushErrorScope, ForwardCommand, QueueSubmit, QueueWriteBuffer, TextureCreateView,
};
pub use cursor::{ByteCursor, WireWriter};
pub use error::{WireError, WireResult};
pub use handle::{
    BindGroup, BindGroupLayout, Buffer, CommandBuffer, CommandEncoder, ComputePipeline, Device,
    ObjectHandle, ObjectKind, PipelineLayout, Queue, ShaderModule, Texture, TextureView,
    WireObject,
};
pub use returns::{
    BufferMapAsyncCallback, DeviceErrorCallback, DeviceLostCallback,
    DevicePopErrorScopeCallback, ObjectErrorCallback, ReturnCommand, ReturnTag,
};
pub use structs::{
    BindGroupEntry, BindGroupLayoutEntry, BufferDescriptor, ConstantEntry, ProgrammableStage,
    TextureDescriptor, TextureViewDescriptor,
};
pub use types::{
    BindingType, BufferUsage, CreateStatus, DeviceLostReason, ErrorFilter, ErrorType,
    MapAsyncStatus, MapMode, PopErrorScopeStatus, ShaderStage, TextureFormat, TextureUsage,
};
