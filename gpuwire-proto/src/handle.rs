//! Object identity on the wire.
//!
//! Objects never cross the wire as addresses. Each endpoint refers to them
//! through an [`ObjectHandle`]: a per-kind id plus a generation that is bumped
//! every time the id is reused, so a handle captured before destruction can
//! never alias a newer object.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a wire-visible object.
///
/// `id == 0` is reserved for the null object and never names a real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ObjectHandle {
    /// Slot index in the per-kind object table.
    pub id: u32,
    /// Reuse counter of the slot.
    pub generation: u32,
}

impl ObjectHandle {
    /// The null handle, used for absent optional objects.
    pub const NULL: Self = Self::new(0, 0);

    /// Encoded size of a handle on the wire.
    pub const SIZE: usize = 8;

    /// Creates a handle from its raw parts.
    pub const fn new(id: u32, generation: u32) -> Self {
        Self { id, generation }
    }

    /// Returns `true` for the reserved null id.
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.id, self.generation)
    }
}

/// Kind of a wire-visible object. Every kind has its own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u32)]
pub enum ObjectKind {
    /// The root object; bootstrapped by both endpoints, never destroyed over the wire.
    Device = 0,
    /// Submission queue of a device.
    Queue = 1,
    /// Linear GPU memory.
    Buffer = 2,
    /// Image memory.
    Texture = 3,
    /// View onto a texture.
    TextureView = 4,
    /// Compiled shader source.
    ShaderModule = 5,
    /// Layout of a bind group.
    BindGroupLayout = 6,
    /// Set of bind group layouts used by a pipeline.
    PipelineLayout = 7,
    /// Resources bound together.
    BindGroup = 8,
    /// Compute pipeline state.
    ComputePipeline = 9,
    /// Records commands into a command buffer.
    CommandEncoder = 10,
    /// Finished, submittable commands.
    CommandBuffer = 11,
}

impl ObjectKind {
    /// Number of object kinds.
    pub const COUNT: usize = 12;

    /// Every kind, in discriminant order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Device,
        Self::Queue,
        Self::Buffer,
        Self::Texture,
        Self::TextureView,
        Self::ShaderModule,
        Self::BindGroupLayout,
        Self::PipelineLayout,
        Self::BindGroup,
        Self::ComputePipeline,
        Self::CommandEncoder,
        Self::CommandBuffer,
    ];

    /// Index of this kind into per-kind tables.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes a kind from its wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(usize::try_from(value).ok()?).copied()
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Queue => "queue",
            Self::Buffer => "buffer",
            Self::Texture => "texture",
            Self::TextureView => "texture view",
            Self::ShaderModule => "shader module",
            Self::BindGroupLayout => "bind group layout",
            Self::PipelineLayout => "pipeline layout",
            Self::BindGroup => "bind group",
            Self::ComputePipeline => "compute pipeline",
            Self::CommandEncoder => "command encoder",
            Self::CommandBuffer => "command buffer",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed client-side reference to a wire object.
pub trait WireObject: Copy {
    /// Kind of the referenced object.
    const KIND: ObjectKind;

    /// Wraps a raw handle.
    fn from_handle(handle: ObjectHandle) -> Self;

    /// Returns the raw handle.
    fn handle(self) -> ObjectHandle;
}

/// Declares a typed handle per object kind.
macro_rules! wire_objects {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(ObjectHandle);

            impl WireObject for $name {
                const KIND: ObjectKind = ObjectKind::$name;

                fn from_handle(handle: ObjectHandle) -> Self {
                    Self(handle)
                }

                fn handle(self) -> ObjectHandle {
                    self.0
                }
            }
        )*
    };
}

wire_objects! {
    /// Client reference to a device.
    Device,
    /// Client reference to a queue.
    Queue,
    /// Client reference to a buffer.
    Buffer,
    /// Client reference to a texture.
    Texture,
    /// Client reference to a texture view.
    TextureView,
    /// Client reference to a shader module.
    ShaderModule,
    /// Client reference to a bind group layout.
    BindGroupLayout,
    /// Client reference to a pipeline layout.
    PipelineLayout,
    /// Client reference to a bind group.
    BindGroup,
    /// Client reference to a compute pipeline.
    ComputePipeline,
    /// Client reference to a command encoder.
    CommandEncoder,
    /// Client reference to a command buffer.
    CommandBuffer,
}
