//! Client and server talking through in-memory transports.

use std::cell::RefCell;
use std::fs::File;
use std::io::BufReader;
use std::rc::Rc;

use gpuwire::proto::codec::encode_command;
use gpuwire::proto::trace::{self, Direction};
use gpuwire::proto::{
    CommandEncoderFinish, DeviceCreateBuffer, HandleIds, QueueWriteBuffer, WireError,
};
use gpuwire::{
    Buffer, BufferDescriptor, BufferUsage, Client, CreateStatus, DEVICE_HANDLE,
    DeviceLostReason, Error, ErrorFilter, ErrorType, HandleOutcome, MapAsyncStatus, MapMode,
    ObjectHandle, ObjectKind, PopErrorScopeStatus, Server, SoftwareBackend, TraceRecorder,
    WireConfig, WireObject,
};

/// A connected client and server.
struct Pair {
    client: Client,
    server: Server<SoftwareBackend>,
}

impl Pair {
    fn new() -> Self {
        Self::with_config(&WireConfig::default())
    }

    fn with_config(config: &WireConfig) -> Self {
        Self {
            client: Client::new(config),
            server: Server::new(SoftwareBackend::new(), config),
        }
    }

    /// Delivers staged forward commands, then the server's answers.
    fn round_trip(&mut self) {
        let mut forward: Vec<Vec<u8>> = Vec::new();
        self.client.flush(&mut forward).unwrap();
        for transmission in &forward {
            self.server.handle_commands(transmission).unwrap();
        }
        self.deliver_returns();
    }

    fn deliver_returns(&mut self) {
        let mut returns: Vec<Vec<u8>> = Vec::new();
        self.server.flush(&mut returns).unwrap();
        for transmission in &returns {
            self.client.handle_commands(transmission).unwrap();
        }
    }

    fn buffer(&mut self, size: u64, usage: u32) -> Buffer {
        let device = self.client.device();
        let descriptor = BufferDescriptor {
            size,
            usage,
            ..BufferDescriptor::default()
        };
        self.client.create_buffer(device, &descriptor).unwrap()
    }

    /// Contents of `buffer` on the backend.
    fn contents(&self, buffer: Buffer) -> Vec<u8> {
        let handle = self
            .server
            .object(ObjectKind::Buffer, buffer.handle())
            .flatten()
            .copied()
            .unwrap();
        self.server.backend().buffer_contents(handle).unwrap().to_vec()
    }
}

/// Shared log filled by callbacks.
fn log<T>() -> Rc<RefCell<Vec<T>>> {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn copy_and_read_back() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    let queue = pair.client.get_queue(device).unwrap();
    let source = pair.buffer(8, BufferUsage::COPY_SRC | BufferUsage::COPY_DST);
    let readback = pair.buffer(8, BufferUsage::MAP_READ | BufferUsage::COPY_DST);
    pair.client
        .write_buffer(queue, source, 0, &[1, 2, 3, 4, 5, 6, 7, 8])
        .unwrap();
    let encoder = pair.client.create_command_encoder(device, None).unwrap();
    pair.client
        .copy_buffer_to_buffer(encoder, source, 0, readback, 0, 8)
        .unwrap();
    let commands = pair.client.finish(encoder, Some("copy")).unwrap();
    pair.client.submit(queue, &[commands]).unwrap();

    let statuses = log();
    let sink = Rc::clone(&statuses);
    pair.client
        .map_async(readback, MapMode::READ, 0, 8, move |s| {
            sink.borrow_mut().push(s);
        })
        .unwrap();
    pair.round_trip();

    assert_eq!(*statuses.borrow(), [MapAsyncStatus::Success]);
    assert_eq!(
        pair.client.mapped_range(readback),
        Some(&[1, 2, 3, 4, 5, 6, 7, 8][..])
    );
    assert!(pair.client.mapped_range_mut(readback).is_none());
    assert_eq!(pair.contents(readback), [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn write_mapping_is_sent_back_on_unmap() {
    let mut pair = Pair::new();
    let buffer = pair.buffer(8, BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC);
    let statuses = log();
    let sink = Rc::clone(&statuses);
    pair.client
        .map_async(buffer, MapMode::WRITE, 0, 8, move |s| {
            sink.borrow_mut().push(s);
        })
        .unwrap();
    pair.round_trip();
    assert_eq!(*statuses.borrow(), [MapAsyncStatus::Success]);

    pair.client
        .mapped_range_mut(buffer)
        .unwrap()
        .copy_from_slice(&[9; 8]);
    pair.client.unmap(buffer).unwrap();
    pair.round_trip();

    assert!(pair.client.mapped_range(buffer).is_none());
    assert_eq!(pair.contents(buffer), [9; 8]);
}

#[test]
fn mapped_at_creation_starts_zeroed_and_writable() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    let descriptor = BufferDescriptor {
        size: 4,
        usage: BufferUsage::COPY_DST,
        mapped_at_creation: true,
        ..BufferDescriptor::default()
    };
    let buffer = pair.client.create_buffer(device, &descriptor).unwrap();
    let range = pair.client.mapped_range_mut(buffer).unwrap();
    assert_eq!(range, [0; 4]);
    range.copy_from_slice(&[4, 3, 2, 1]);
    pair.client.unmap(buffer).unwrap();
    pair.round_trip();
    assert_eq!(pair.contents(buffer), [4, 3, 2, 1]);
}

#[test]
fn unmap_aborts_pending_request_once() {
    let mut pair = Pair::new();
    let buffer = pair.buffer(8, BufferUsage::MAP_READ | BufferUsage::COPY_DST);
    let statuses = log();
    let sink = Rc::clone(&statuses);
    pair.client
        .map_async(buffer, MapMode::READ, 0, 8, move |s| {
            sink.borrow_mut().push(s);
        })
        .unwrap();
    pair.client.unmap(buffer).unwrap();
    pair.round_trip();

    assert_eq!(*statuses.borrow(), [MapAsyncStatus::Aborted]);
    assert!(pair.client.mapped_range(buffer).is_none());
}

#[test]
fn finish_failure_reaches_the_command_buffer() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    let source = pair.buffer(4, BufferUsage::COPY_SRC);
    let destination = pair.buffer(4, BufferUsage::COPY_DST);
    let encoder = pair.client.create_command_encoder(device, None).unwrap();
    pair.client
        .copy_buffer_to_buffer(encoder, source, 0, destination, 0, 8)
        .unwrap();
    let commands = pair.client.finish(encoder, None).unwrap();

    let errors = log();
    let sink = Rc::clone(&errors);
    pair.client
        .on_object_error(commands, move |status, message| {
            sink.borrow_mut().push((status, message.to_owned()));
        })
        .unwrap();
    pair.round_trip();

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, CreateStatus::Error);
    assert!(errors[0].1.starts_with("invalid command encoder"));
}

#[test]
fn invalid_objects_propagate_without_killing_the_connection() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    let device_errors = log();
    let sink = Rc::clone(&device_errors);
    pair.client.on_device_error(move |error_type, message| {
        sink.borrow_mut().push((error_type, message.to_owned()));
    });

    let broken = pair.buffer(0, BufferUsage::COPY_SRC);
    let destination = pair.buffer(4, BufferUsage::COPY_DST);
    let encoder = pair.client.create_command_encoder(device, None).unwrap();
    pair.client
        .copy_buffer_to_buffer(encoder, broken, 0, destination, 0, 4)
        .unwrap();
    pair.client.finish(encoder, None).unwrap();
    pair.round_trip();

    assert!(!pair.server.is_dead());
    assert!(matches!(
        pair.server.object(ObjectKind::Buffer, broken.handle()),
        Some(None)
    ));
    let device_errors = device_errors.borrow();
    assert_eq!(device_errors.len(), 2);
    assert_eq!(device_errors[0].0, ErrorType::Validation);
    assert!(
        device_errors[1]
            .1
            .starts_with("unhandled error for command buffer #1@1")
    );
}

#[test]
fn argument_created_later_is_an_error_object() {
    let mut server = Server::new(SoftwareBackend::new(), &WireConfig::default());
    let queue = ObjectHandle::new(1, 1);
    let buffer = ObjectHandle::new(1, 1);
    let get_queue = encode_command(
        &gpuwire::proto::DeviceGetQueue {
            device: DEVICE_HANDLE,
            result: queue,
        },
        &HandleIds,
    )
    .unwrap();
    let write = encode_command(
        &QueueWriteBuffer {
            queue,
            buffer,
            buffer_offset: 0,
            data: vec![0; 4],
        },
        &HandleIds,
    )
    .unwrap();
    let create = encode_command(
        &DeviceCreateBuffer {
            device: DEVICE_HANDLE,
            result: buffer,
            descriptor: BufferDescriptor {
                size: 4,
                usage: BufferUsage::COPY_DST,
                ..BufferDescriptor::default()
            },
        },
        &HandleIds,
    )
    .unwrap();

    let stream = [get_queue, write, create].concat();
    assert_eq!(server.handle_commands(&stream).unwrap(), HandleOutcome::Complete);
    assert_eq!(server.commands_handled(), 3);
    assert!(matches!(
        server.object(ObjectKind::Buffer, buffer),
        Some(Some(_))
    ));
}

#[test]
fn reused_id_rejects_stale_handle() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    let encoders: Vec<_> = (0..5)
        .map(|_| pair.client.create_command_encoder(device, None).unwrap())
        .collect();
    let fifth = encoders[4];
    assert_eq!(fifth.handle(), ObjectHandle::new(5, 1));
    pair.client.release(fifth).unwrap();
    let reused = pair.client.create_command_encoder(device, None).unwrap();
    assert_eq!(reused.handle(), ObjectHandle::new(5, 2));
    pair.round_trip();

    assert!(matches!(
        pair.client.finish(fifth, None),
        Err(Error::Wire(WireError::UnknownObject { .. }))
    ));

    let stale = encode_command(
        &CommandEncoderFinish {
            encoder: ObjectHandle::new(5, 1),
            result: ObjectHandle::new(1, 1),
            label: None,
        },
        &HandleIds,
    )
    .unwrap();
    let err = pair.server.handle_commands(&stale).unwrap_err();
    assert!(matches!(
        err,
        Error::Wire(WireError::MissingSelf {
            kind: ObjectKind::CommandEncoder,
            ..
        })
    ));
}

#[test]
fn stale_argument_after_reuse_is_an_error_object() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    let queue = pair.client.get_queue(device).unwrap();
    let errors = log();
    let sink = Rc::clone(&errors);
    pair.client.on_device_error(move |error_type, message| {
        sink.borrow_mut().push((error_type, message.to_owned()));
    });
    let buffers: Vec<_> = (0..5).map(|_| pair.buffer(4, BufferUsage::COPY_DST)).collect();
    let fifth = buffers[4];
    assert_eq!(fifth.handle(), ObjectHandle::new(5, 1));
    pair.client.release(fifth).unwrap();
    let reused = pair.buffer(4, BufferUsage::COPY_DST);
    assert_eq!(reused.handle(), ObjectHandle::new(5, 2));
    pair.round_trip();

    let write = encode_command(
        &QueueWriteBuffer {
            queue: queue.handle(),
            buffer: ObjectHandle::new(5, 1),
            buffer_offset: 0,
            data: vec![9; 4],
        },
        &HandleIds,
    )
    .unwrap();
    let outcome = pair.server.handle_commands(&write).unwrap();
    assert_eq!(outcome, HandleOutcome::Complete);
    assert!(!pair.server.is_dead());
    assert_eq!(pair.contents(reused), [0, 0, 0, 0]);

    pair.deliver_returns();
    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorType::Validation);
}

#[test]
fn split_delivery_waits_for_the_rest() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    pair.client
        .create_shader_module(device, Some("main"), "fn main() {}")
        .unwrap();
    pair.client.create_command_encoder(device, None).unwrap();
    let mut forward: Vec<Vec<u8>> = Vec::new();
    pair.client.flush(&mut forward).unwrap();
    let stream = forward.concat();

    let (head, tail) = stream.split_at(13);
    assert!(matches!(
        pair.server.handle_commands(head).unwrap(),
        HandleOutcome::Incomplete { buffered: 13 }
    ));
    assert_eq!(pair.server.commands_handled(), 0);
    assert_eq!(pair.server.handle_commands(tail).unwrap(), HandleOutcome::Complete);
    assert_eq!(pair.server.commands_handled(), 2);
}

#[test]
fn bad_command_size_is_fatal() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    pair.client.create_command_encoder(device, None).unwrap();
    let mut forward: Vec<Vec<u8>> = Vec::new();
    pair.client.flush(&mut forward).unwrap();
    let mut bytes = forward.concat();
    bytes[..4].copy_from_slice(&4u32.to_le_bytes());

    let err = pair.server.handle_commands(&bytes).unwrap_err();
    assert!(matches!(
        err,
        Error::Wire(WireError::BadCommandSize { declared: 4, .. })
    ));
    assert!(pair.server.is_dead());
    assert!(matches!(pair.server.tick(), Err(Error::Disconnected)));
}

#[test]
fn large_write_is_chunked() {
    let config = WireConfig::default().max_chunk_size(64);
    let mut pair = Pair::with_config(&config);
    let device = pair.client.device();
    let queue = pair.client.get_queue(device).unwrap();
    let buffer = pair.buffer(1024, BufferUsage::COPY_DST);
    let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    pair.client.write_buffer(queue, buffer, 0, &data).unwrap();

    let mut forward: Vec<Vec<u8>> = Vec::new();
    pair.client.flush(&mut forward).unwrap();
    assert!(forward.len() > 16);
    assert!(forward.iter().all(|t| t.len() <= 64));
    let outcomes: Vec<_> = forward
        .iter()
        .map(|t| pair.server.handle_commands(t).unwrap())
        .collect();

    assert_eq!(outcomes.last(), Some(&HandleOutcome::Complete));
    assert_eq!(pair.server.commands_handled(), 3);
    assert_eq!(pair.contents(buffer), data);
}

#[test]
fn error_scope_captures_errors_until_popped() {
    let mut pair = Pair::new();
    let device = pair.client.device();
    let device_errors = log();
    let sink = Rc::clone(&device_errors);
    pair.client.on_device_error(move |error_type, message| {
        sink.borrow_mut().push((error_type, message.to_owned()));
    });
    let popped = log();

    pair.client
        .push_error_scope(device, ErrorFilter::Validation)
        .unwrap();
    pair.buffer(0, BufferUsage::COPY_DST);
    let sink = Rc::clone(&popped);
    pair.client
        .pop_error_scope(device, move |status, error_type, message| {
            sink.borrow_mut().push((status, error_type, message.to_owned()));
        })
        .unwrap();
    pair.client
        .inject_error(device, ErrorType::OutOfMemory, "simulated")
        .unwrap();
    pair.round_trip();

    assert_eq!(
        *popped.borrow(),
        [(
            PopErrorScopeStatus::Success,
            ErrorType::Validation,
            "buffer size must be non-zero".to_owned()
        )]
    );
    assert_eq!(
        *device_errors.borrow(),
        [(ErrorType::OutOfMemory, "simulated".to_owned())]
    );
}

#[test]
fn device_loss_fails_pending_maps() {
    let mut pair = Pair::new();
    let buffer = pair.buffer(8, BufferUsage::MAP_READ | BufferUsage::COPY_DST);
    pair.round_trip();

    let reasons = log();
    let sink = Rc::clone(&reasons);
    pair.client
        .on_device_lost(move |reason, _| sink.borrow_mut().push(reason));
    let statuses = log();
    let sink = Rc::clone(&statuses);
    pair.client
        .map_async(buffer, MapMode::READ, 0, 8, move |s| {
            sink.borrow_mut().push(s);
        })
        .unwrap();

    pair.server
        .backend_mut()
        .lose_device(DeviceLostReason::Destroyed, "unplugged");
    pair.server.tick().unwrap();
    pair.deliver_returns();

    assert!(pair.client.is_lost());
    assert_eq!(*reasons.borrow(), [DeviceLostReason::Destroyed]);
    assert_eq!(*statuses.borrow(), [MapAsyncStatus::DeviceLost]);

    pair.round_trip();
    assert_eq!(statuses.borrow().len(), 1);
}

#[test]
fn release_destroys_backend_object() {
    let mut pair = Pair::new();
    let buffer = pair.buffer(4, BufferUsage::COPY_DST);
    pair.round_trip();
    assert_eq!(pair.server.backend().object_count(), 2);

    pair.client.release(buffer).unwrap();
    pair.round_trip();
    assert_eq!(pair.server.live_count(ObjectKind::Buffer), 0);
    assert_eq!(pair.server.backend().object_count(), 1);
}

#[test]
fn recorded_trace_replays_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forward.trace");

    let mut client = Client::new(&WireConfig::default());
    let device = client.device();
    let queue = client.get_queue(device).unwrap();
    let descriptor = BufferDescriptor {
        size: 16,
        usage: BufferUsage::COPY_DST,
        ..BufferDescriptor::default()
    };
    let buffer = client.create_buffer(device, &descriptor).unwrap();
    client.write_buffer(queue, buffer, 0, &[7; 16]).unwrap();

    let mut recorder = TraceRecorder::new(
        Vec::<Vec<u8>>::new(),
        File::create(&path).unwrap(),
        Direction::Forward,
    );
    client.flush(&mut recorder).unwrap();
    let (sent, file) = recorder.into_parts();
    drop(file);

    let entries = trace::read_all(&mut BufReader::new(File::open(&path).unwrap())).unwrap();
    assert_eq!(entries.len(), sent.len());
    assert!(entries.iter().all(|e| e.direction == Direction::Forward));

    let mut server = Server::new(SoftwareBackend::new(), &WireConfig::default());
    for entry in &entries {
        server.handle_commands(&entry.bytes).unwrap();
    }
    assert_eq!(server.commands_handled(), 3);
}
