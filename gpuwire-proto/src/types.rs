//! Value enums and flag sets carried by records.

use serde::{Deserialize, Serialize};

use crate::error::{WireError, WireResult};

/// Declares a `u32`-backed wire enum with a checked decoder.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vdoc:meta])* $variant:ident = $value:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[non_exhaustive]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vdoc])* $variant = $value,)*
        }

        impl $name {
            /// Decodes a wire value; unknown values are fatal.
            pub const fn from_u32(value: u32) -> WireResult<Self> {
                match value {
                    $($value => Ok(Self::$variant),)*
                    _ => Err(WireError::InvalidValue(stringify!($name))),
                }
            }

            /// Wire value.
            pub const fn to_u32(self) -> u32 {
                self as u32
            }
        }
    };
}

wire_enum! {
    /// Category of an error reported by the device.
    pub enum ErrorType {
        /// Not an error; used by callbacks that always fire.
        NoError = 0,
        /// The call was invalid.
        Validation = 1,
        /// The backend ran out of memory.
        OutOfMemory = 2,
        /// The backend failed internally.
        Internal = 3,
        /// The device is gone.
        DeviceLost = 4,
        /// Any other failure.
        Unknown = 5,
    }
}

wire_enum! {
    /// Why a device was lost.
    pub enum DeviceLostReason {
        /// The backend did not say.
        Unknown = 0,
        /// The device was destroyed deliberately.
        Destroyed = 1,
        /// The wire connection failed.
        ConnectionLost = 2,
    }
}

wire_enum! {
    /// Outcome of a buffer map request.
    pub enum MapAsyncStatus {
        /// The range is mapped.
        Success = 0,
        /// The request was invalid.
        Error = 1,
        /// The buffer was unmapped or destroyed before completion.
        Aborted = 2,
        /// The device was lost before completion.
        DeviceLost = 3,
    }
}

wire_enum! {
    /// Error categories an error scope captures.
    pub enum ErrorFilter {
        /// Validation errors.
        Validation = 0,
        /// Out-of-memory errors.
        OutOfMemory = 1,
        /// Internal errors.
        Internal = 2,
    }
}

impl ErrorFilter {
    /// Returns `true` if a scope with this filter captures `error_type`.
    pub const fn captures(self, error_type: ErrorType) -> bool {
        matches!(
            (self, error_type),
            (Self::Validation, ErrorType::Validation)
                | (Self::OutOfMemory, ErrorType::OutOfMemory)
                | (Self::Internal, ErrorType::Internal)
        )
    }
}

wire_enum! {
    /// Outcome of popping an error scope.
    pub enum PopErrorScopeStatus {
        /// The scope was popped; the callback carries its first error, if any.
        Success = 0,
        /// No scope was pushed.
        EmptyStack = 1,
        /// The device was lost before the scope could be popped.
        DeviceLost = 2,
    }
}

wire_enum! {
    /// Outcome reported for an object whose creation failed.
    pub enum CreateStatus {
        /// The object is usable.
        Success = 0,
        /// Creation failed validation.
        Error = 1,
        /// Creation failed because an input object was invalid.
        InvalidInput = 2,
    }
}

wire_enum! {
    /// Binding slot type in a bind group layout.
    pub enum BindingType {
        /// Read-only uniform buffer.
        UniformBuffer = 0,
        /// Read-write storage buffer.
        StorageBuffer = 1,
        /// Read-only storage buffer.
        ReadOnlyStorageBuffer = 2,
        /// Sampled texture.
        SampledTexture = 3,
        /// Storage texture.
        StorageTexture = 4,
    }
}

wire_enum! {
    /// Texel format.
    pub enum TextureFormat {
        /// Four 8-bit normalized channels.
        Rgba8Unorm = 0,
        /// Four 8-bit normalized channels, BGRA order.
        Bgra8Unorm = 1,
        /// One 32-bit float channel.
        R32Float = 2,
        /// Four 32-bit float channels.
        Rgba32Float = 3,
        /// 32-bit float depth.
        Depth32Float = 4,
    }
}

impl TextureFormat {
    /// Bytes per texel.
    pub const fn texel_size(self) -> u64 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::R32Float | Self::Depth32Float => 4,
            Self::Rgba32Float => 16,
        }
    }
}

/// Buffer usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct BufferUsage;

impl BufferUsage {
    /// Mappable for reading.
    pub const MAP_READ: u32 = 1 << 0;
    /// Mappable for writing.
    pub const MAP_WRITE: u32 = 1 << 1;
    /// Source of copies.
    pub const COPY_SRC: u32 = 1 << 2;
    /// Destination of copies and queue writes.
    pub const COPY_DST: u32 = 1 << 3;
    /// Uniform binding.
    pub const UNIFORM: u32 = 1 << 6;
    /// Storage binding.
    pub const STORAGE: u32 = 1 << 7;
    /// Every defined bit.
    pub const ALL: u32 = Self::MAP_READ
        | Self::MAP_WRITE
        | Self::COPY_SRC
        | Self::COPY_DST
        | Self::UNIFORM
        | Self::STORAGE;
}

/// Texture usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct TextureUsage;

impl TextureUsage {
    /// Source of copies.
    pub const COPY_SRC: u32 = 1 << 0;
    /// Destination of copies.
    pub const COPY_DST: u32 = 1 << 1;
    /// Sampled binding.
    pub const TEXTURE_BINDING: u32 = 1 << 2;
    /// Storage binding.
    pub const STORAGE_BINDING: u32 = 1 << 3;
}

/// Shader stage visibility flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ShaderStage;

impl ShaderStage {
    /// Compute stage.
    pub const COMPUTE: u32 = 1 << 2;
}

/// Buffer map modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct MapMode;

impl MapMode {
    /// Map for reading.
    pub const READ: u32 = 1 << 0;
    /// Map for writing.
    pub const WRITE: u32 = 1 << 1;

    /// Checks that exactly one mode bit is set.
    pub const fn validate(mode: u32) -> WireResult<u32> {
        match mode {
            Self::READ | Self::WRITE => Ok(mode),
            _ => Err(WireError::InvalidValue("MapMode")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_enum_values_are_fatal() {
        assert_eq!(MapAsyncStatus::from_u32(0), Ok(MapAsyncStatus::Success));
        assert_eq!(
            MapAsyncStatus::from_u32(42),
            Err(WireError::InvalidValue("MapAsyncStatus"))
        );
    }

    #[test]
    fn filters_capture_their_own_category() {
        assert!(ErrorFilter::Validation.captures(ErrorType::Validation));
        assert!(ErrorFilter::OutOfMemory.captures(ErrorType::OutOfMemory));
        assert!(!ErrorFilter::Validation.captures(ErrorType::Internal));
        assert!(!ErrorFilter::Internal.captures(ErrorType::DeviceLost));
    }

    #[test]
    fn map_mode_must_be_single_bit() {
        assert!(MapMode::validate(MapMode::READ).is_ok());
        assert!(MapMode::validate(MapMode::READ | MapMode::WRITE).is_err());
        assert!(MapMode::validate(0).is_err());
    }
}
