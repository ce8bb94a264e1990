//! Return commands: server to client.
//!
//! Return commands name client objects by raw handle. The client checks the
//! handle against its own table and silently drops callbacks for objects
//! that were destroyed or recreated in the meantime.

use serde::Serialize;

use crate::codec::{self, Command, Decode, DeserializeAllocator, IdProvider, Layout, Transfer};
use crate::cursor::{ByteCursor, WireWriter};
use crate::error::{WireError, WireResult};
use crate::handle::{ObjectHandle, ObjectKind};
use crate::types::{
    CreateStatus, DeviceLostReason, ErrorType, MapAsyncStatus, PopErrorScopeStatus,
};

command_set! {
    /// Tag of a return command. `0` is never used.
    tag ReturnTag;
    /// Any decoded return command.
    union ReturnCommand;

    DeviceErrorCallback = 1,
    DeviceLostCallback = 2,
    BufferMapAsyncCallback = 3,
    ObjectErrorCallback = 4,
    DevicePopErrorScopeCallback = 5,
}

/// An error the device could not attribute to an object callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceErrorCallback {
    /// Device that raised the error.
    pub device: ObjectHandle,
    /// Category of the error.
    pub error_type: ErrorType,
    /// Human-readable description.
    pub message: String,
}

impl Layout for DeviceErrorCallback {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 4 + 8;
}

impl Command for DeviceErrorCallback {
    const TAG: u32 = ReturnTag::DeviceErrorCallback as u32;
}

impl<O> Transfer<O> for DeviceErrorCallback {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.message.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_handle(self.device)?;
        header.put_u32(self.error_type.to_u32())?;
        header.put_len(self.message.len())?;
        payload.put_bytes(self.message.as_bytes())
    }
}

impl Decode for DeviceErrorCallback {
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

/// The device is gone; every later call is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceLostCallback {
    /// Device that was lost.
    pub device: ObjectHandle,
    /// Why it was lost.
    pub reason: DeviceLostReason,
    /// Human-readable description.
    pub message: String,
}

impl Layout for DeviceLostCallback {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 4 + 8;
}

impl Command for DeviceLostCallback {
    const TAG: u32 = ReturnTag::DeviceLostCallback as u32;
}

impl<O> Transfer<O> for DeviceLostCallback {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.message.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_handle(self.device)?;
        header.put_u32(self.reason.to_u32())?;
        header.put_len(self.message.len())?;
        payload.put_bytes(self.message.as_bytes())
    }
}

impl Decode for DeviceLostCallback {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let reason = DeviceLostReason::from_u32(header.read_u32()?)?;
        let len = header.read_len()?;
        Ok(Self {
            device,
            reason,
            message: codec::read_string(payload, len, alloc)?,
        })
    }
}

/// Completion of a [`BufferMapAsync`](crate::BufferMapAsync) request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferMapAsyncCallback {
    /// Buffer the request was made on.
    pub buffer: ObjectHandle,
    /// Serial of the request.
    pub request_serial: u64,
    /// Outcome.
    pub status: MapAsyncStatus,
    /// Contents of the range for a successful read mapping; empty otherwise.
    pub read_data: Vec<u8>,
}

impl Layout for BufferMapAsyncCallback {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 8 + 4 + 8;
}

impl Command for BufferMapAsyncCallback {
    const TAG: u32 = ReturnTag::BufferMapAsyncCallback as u32;
}

impl<O> Transfer<O> for BufferMapAsyncCallback {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.read_data.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_handle(self.buffer)?;
        header.put_u64(self.request_serial)?;
        header.put_u32(self.status.to_u32())?;
        header.put_len(self.read_data.len())?;
        payload.put_bytes(&self.read_data)
    }
}

impl Decode for BufferMapAsyncCallback {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let buffer = codec::read_object(header, ObjectKind::Buffer)?;
        let request_serial = header.read_u64()?;
        let status = MapAsyncStatus::from_u32(header.read_u32()?)?;
        let len = header.read_len()?;
        Ok(Self {
            buffer,
            request_serial,
            status,
            read_data: codec::read_byte_array(payload, len, alloc)?,
        })
    }
}

/// Reports that creating an object failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectErrorCallback {
    /// Kind of the failed object.
    pub kind: ObjectKind,
    /// Handle the client chose for it.
    pub object: ObjectHandle,
    /// Why creation failed.
    pub status: CreateStatus,
    /// Human-readable description.
    pub message: String,
}

impl Layout for ObjectErrorCallback {
    const HEADER_SIZE: usize = 4 + ObjectHandle::SIZE + 4 + 8;
}

impl Command for ObjectErrorCallback {
    const TAG: u32 = ReturnTag::ObjectErrorCallback as u32;
}

impl<O> Transfer<O> for ObjectErrorCallback {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.message.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_u32(self.kind as u32)?;
        header.put_handle(self.object)?;
        header.put_u32(self.status.to_u32())?;
        header.put_len(self.message.len())?;
        payload.put_bytes(self.message.as_bytes())
    }
}

impl Decode for ObjectErrorCallback {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let kind = ObjectKind::from_u32(header.read_u32()?)
            .ok_or(WireError::InvalidValue("object kind"))?;
        let object = codec::read_object(header, kind)?;
        let status = CreateStatus::from_u32(header.read_u32()?)?;
        let len = header.read_len()?;
        Ok(Self {
            kind,
            object,
            status,
            message: codec::read_string(payload, len, alloc)?,
        })
    }
}

/// Completion of a [`DevicePopErrorScope`](crate::DevicePopErrorScope) request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePopErrorScopeCallback {
    /// Device the scope was popped on.
    pub device: ObjectHandle,
    /// Serial of the request being answered.
    pub request_serial: u64,
    /// Outcome.
    pub status: PopErrorScopeStatus,
    /// First error the scope captured; `NoError` when it stayed clean.
    pub error_type: ErrorType,
    /// Description of the captured error.
    pub message: String,
}

impl Layout for DevicePopErrorScopeCallback {
    const HEADER_SIZE: usize = ObjectHandle::SIZE + 8 + 4 + 4 + 8;
}

impl Command for DevicePopErrorScopeCallback {
    const TAG: u32 = ReturnTag::DevicePopErrorScopeCallback as u32;
}

impl<O> Transfer<O> for DevicePopErrorScopeCallback {
    fn extra_size(&self) -> WireResult<usize> {
        Ok(self.message.len())
    }

    fn serialize(
        &self,
        header: &mut WireWriter<'_>,
        payload: &mut WireWriter<'_>,
        _ids: &dyn IdProvider<O>,
    ) -> WireResult<()> {
        header.put_handle(self.device)?;
        header.put_u64(self.request_serial)?;
        header.put_u32(self.status.to_u32())?;
        header.put_u32(self.error_type.to_u32())?;
        header.put_len(self.message.len())?;
        payload.put_bytes(self.message.as_bytes())
    }
}

impl Decode for DevicePopErrorScopeCallback {
    fn deserialize(
        header: &mut ByteCursor<'_>,
        payload: &mut ByteCursor<'_>,
        alloc: &mut DeserializeAllocator,
    ) -> WireResult<Self> {
        let device = codec::read_object(header, ObjectKind::Device)?;
        let request_serial = header.read_u64()?;
        let status = PopErrorScopeStatus::from_u32(header.read_u32()?)?;
        let error_type = ErrorType::from_u32(header.read_u32()?)?;
        let len = header.read_len()?;
        Ok(Self {
            device,
            request_serial,
            status,
            error_type,
            message: codec::read_string(payload, len, alloc)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HandleIds;

    #[test]
    fn map_callback_carries_read_data() {
        let cb = BufferMapAsyncCallback {
            buffer: ObjectHandle::new(3, 2),
            request_serial: 7,
            status: MapAsyncStatus::Success,
            read_data: vec![1, 2, 3, 4],
        };
        let bytes = codec::encode_command(&cb, &HandleIds).unwrap();
        let mut alloc = DeserializeAllocator::new(64);
        assert_eq!(
            ReturnCommand::decode(&bytes, &mut alloc).unwrap(),
            ReturnCommand::BufferMapAsyncCallback(cb)
        );
    }

    #[test]
    fn object_error_roundtrip() {
        let cb = ObjectErrorCallback {
            kind: ObjectKind::CommandBuffer,
            object: ObjectHandle::new(1, 1),
            status: CreateStatus::InvalidInput,
            message: "encoder is invalid".into(),
        };
        let bytes = codec::encode_command(&cb, &HandleIds).unwrap();
        let mut alloc = DeserializeAllocator::new(64);
        let decoded = ReturnCommand::decode(&bytes, &mut alloc).unwrap();
        assert_eq!(decoded.tag(), ReturnTag::ObjectErrorCallback);
        assert_eq!(decoded, ReturnCommand::ObjectErrorCallback(cb));
    }

    #[test]
    fn every_return_command_roundtrips() {
        let device = ObjectHandle::new(1, 1);
        let cases = [
            ReturnCommand::DeviceErrorCallback(DeviceErrorCallback {
                device,
                error_type: ErrorType::OutOfMemory,
                message: "out of memory".into(),
            }),
            ReturnCommand::DeviceLostCallback(DeviceLostCallback {
                device,
                reason: DeviceLostReason::Destroyed,
                message: String::new(),
            }),
            ReturnCommand::BufferMapAsyncCallback(BufferMapAsyncCallback {
                buffer: ObjectHandle::new(2, 5),
                request_serial: 0,
                status: MapAsyncStatus::Aborted,
                read_data: Vec::new(),
            }),
            ReturnCommand::ObjectErrorCallback(ObjectErrorCallback {
                kind: ObjectKind::Texture,
                object: ObjectHandle::new(9, 1),
                status: CreateStatus::Error,
                message: String::new(),
            }),
            ReturnCommand::DevicePopErrorScopeCallback(DevicePopErrorScopeCallback {
                device,
                request_serial: u64::MAX,
                status: PopErrorScopeStatus::Success,
                error_type: ErrorType::Validation,
                message: "bad copy".into(),
            }),
        ];
        let mut alloc = DeserializeAllocator::new(64);
        for cb in &cases {
            let bytes = cb.encode().unwrap();
            assert_eq!(&ReturnCommand::decode(&bytes, &mut alloc).unwrap(), cb);
            alloc.reset();
        }
        for tag in 1..=5 {
            let tag = ReturnTag::from_u32(tag).unwrap();
            assert!(cases.iter().any(|c| c.tag() == tag), "{tag} not covered");
        }
    }

    #[test]
    fn forward_tags_are_not_return_tags() {
        let mut alloc = DeserializeAllocator::new(64);
        let bytes = [8, 0, 0, 0, 18, 0, 0, 0];
        assert_eq!(
            ReturnCommand::decode(&bytes, &mut alloc),
            Err(WireError::UnknownCommand(18))
        );
    }
}
