//! Cross-process command wire for a GPU API.
//!
//! A [`Client`] turns API calls into packed forward commands staged in a
//! command arena; a [`Server`] decodes them, replays them against a
//! [`Backend`] and stages return commands that run the client's callbacks.
//! Both ends pick nothing on their own: object ids are chosen by the client
//! and mirrored by the server, so creating an object never round-trips.
//!
//! # Quick start
//!
//! ```
//! use gpuwire::{BufferDescriptor, BufferUsage, Client, Server, SoftwareBackend, WireConfig};
//!
//! let config = WireConfig::default();
//! let mut client = Client::new(&config);
//! let mut server = Server::new(SoftwareBackend::new(), &config);
//!
//! let device = client.device();
//! let queue = client.get_queue(device).unwrap();
//! let descriptor = BufferDescriptor {
//!     size: 4,
//!     usage: BufferUsage::COPY_DST,
//!     ..BufferDescriptor::default()
//! };
//! let buffer = client.create_buffer(device, &descriptor).unwrap();
//! client.write_buffer(queue, buffer, 0, &[1, 2, 3, 4]).unwrap();
//!
//! let mut wire: Vec<Vec<u8>> = Vec::new();
//! client.flush(&mut wire).unwrap();
//! for transmission in &wire {
//!     server.handle_commands(transmission).unwrap();
//! }
//! assert_eq!(server.commands_handled(), 3);
//! ```

mod arena;
mod backend;
mod client;
mod config;
mod dispatch;
mod error;
mod objects;
mod server;
mod software;
mod staging;
mod transport;

pub use arena::{Checkpoint, CommandAllocator, CommandBlocks, CommandIterator};
pub use backend::{Backend, BackendEvent};
pub use client::Client;
pub use config::WireConfig;
pub use dispatch::{CommandHandler, Dispatcher, HandleOutcome, dispatch_complete};
pub use error::{Error, Result};
pub use gpuwire_proto::{
    BindGroup, BindGroupEntry, BindGroupLayout, BindGroupLayoutEntry, BindingType, Buffer,
    BufferDescriptor, BufferUsage, CommandBuffer, CommandEncoder, ComputePipeline,
    ConstantEntry, CreateStatus, Device, DeviceLostReason, ErrorFilter, ErrorType,
    MapAsyncStatus, MapMode, ObjectHandle, ObjectKind, PipelineLayout, PopErrorScopeStatus,
    ProgrammableStage, Queue, ShaderModule, ShaderStage, Texture, TextureDescriptor,
    TextureFormat, TextureUsage, TextureView, TextureViewDescriptor, WireError, WireObject,
};
pub use objects::{KnownObjects, ObjectTable, TrackedObject};
pub use server::{DEVICE_HANDLE, Server};
pub use software::{SoftHandle, SoftwareBackend};
pub use staging::CommandStaging;
pub use transport::{TraceRecorder, Transport};

/// The wire format crate.
pub use gpuwire_proto as proto;
