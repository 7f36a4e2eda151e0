//! Unit tests for the driver channel and its reader thread.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::*;
use crate::codec::{self, Verb};
use crate::ids::VmId;
use crate::store::VmStatus;
use crate::test_support::{HealthEvent, RecordingReporter, RecordingStore, SharedBuffer};

struct BrokenPipe;

impl Write for BrokenPipe {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "driver exited"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FailingReader;

impl io::Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::other("stream reset"))
    }
}

fn dispatcher_with(
    store: &Arc<RecordingStore>,
    reporter: &Arc<RecordingReporter>,
) -> Arc<Dispatcher<Arc<RecordingStore>>> {
    Arc::new(Dispatcher::with_reporter(
        Arc::clone(store),
        reporter.clone(),
    ))
}

#[test]
fn send_writes_exactly_one_line() {
    let store = RecordingStore::with_vms(&[]);
    let reporter = Arc::new(RecordingReporter::default());
    let output = SharedBuffer::default();
    let (reader, writer) = io::pipe().expect("pipe");
    let (channel, handle) = DriverChannel::open(
        DriverId::new("kvm"),
        reader,
        output.clone(),
        dispatcher_with(&store, &reporter),
    )
    .expect("channel opens");

    channel
        .send(&codec::encode(Verb::Deploy, VmId::new(7), "x"))
        .expect("write succeeds");

    assert_eq!(output.contents(), "DEPLOY 7 x\n");
    drop(writer);
    handle.join().expect("reader exits cleanly");
}

#[test]
fn reader_applies_replies_and_survives_bad_lines() {
    let store = RecordingStore::with_vms(&[(7, VmStatus::Pending)]);
    let reporter = Arc::new(RecordingReporter::default());
    let dispatcher = dispatcher_with(&store, &reporter);
    let driver = DriverId::new("kvm");
    dispatcher
        .registry()
        .register(
            &driver,
            VmId::new(7),
            Verb::Deploy,
            Instant::now() + Duration::from_secs(30),
        )
        .expect("pair is free");

    let (reader, mut writer) = io::pipe().expect("pipe");
    let (_channel, handle) =
        DriverChannel::open(driver.clone(), reader, io::sink(), Arc::clone(&dispatcher))
            .expect("channel opens");

    writer
        .write_all(b"DEPLOY abc SUCCESS\n\xff\xfe\nLOG 7 I booting\nDEPLOY 7 SUCCESS one-7\n")
        .expect("driver writes");
    drop(writer);
    handle.join().expect("reader exits cleanly");

    assert_eq!(store.status(7), Some(VmStatus::Running));
    assert!(dispatcher.registry().is_empty());
    assert_eq!(
        reporter.events(),
        vec![
            HealthEvent::Opened(driver.clone()),
            HealthEvent::Closed {
                driver,
                failed: false
            },
        ]
    );
}

#[test]
fn oversized_line_is_skipped_and_reading_continues() {
    let store = RecordingStore::with_vms(&[(7, VmStatus::Pending)]);
    let reporter = Arc::new(RecordingReporter::default());
    let dispatcher = dispatcher_with(&store, &reporter);
    let driver = DriverId::new("kvm");
    dispatcher
        .registry()
        .register(
            &driver,
            VmId::new(7),
            Verb::Deploy,
            Instant::now() + Duration::from_secs(30),
        )
        .expect("pair is free");

    let (reader, mut writer) = io::pipe().expect("pipe");
    let (_channel, handle) =
        DriverChannel::open(driver, reader, io::sink(), Arc::clone(&dispatcher))
            .expect("channel opens");

    let mut flood = vec![b'x'; codec::MAX_LINE_BYTES + 10];
    flood.extend_from_slice(b"\nDEPLOY 7 SUCCESS\n");
    writer.write_all(&flood).expect("driver writes");
    drop(writer);
    handle.join().expect("reader exits cleanly");

    assert_eq!(store.status(7), Some(VmStatus::Running));
    assert!(dispatcher.registry().is_empty());
}

#[test]
fn read_line_stops_at_the_limit_and_discards_the_remainder() {
    let mut source = io::Cursor::new(b"0123456789abcdef\nPOLL 1 SUCCESS\n".to_vec());
    let mut buffer = Vec::new();

    let first = read_line(&mut source, &mut buffer, 8).expect("reads");
    assert_eq!(first, LineRead::Oversized);
    assert_eq!(buffer, b"01234567");

    buffer.clear();
    let second = read_line(&mut source, &mut buffer, 64).expect("reads");
    assert_eq!(second, LineRead::Line);
    assert_eq!(buffer, b"POLL 1 SUCCESS\n");

    buffer.clear();
    let third = read_line(&mut source, &mut buffer, 64).expect("reads");
    assert_eq!(third, LineRead::End);
}

#[test]
fn read_line_accepts_a_line_that_exactly_fills_the_limit() {
    let mut source = io::Cursor::new(b"POLL 1\n".to_vec());
    let mut buffer = Vec::new();

    let read = read_line(&mut source, &mut buffer, 7).expect("reads");

    assert_eq!(read, LineRead::Line);
    assert_eq!(buffer, b"POLL 1\n");
}

#[test]
fn read_line_passes_through_an_unterminated_final_line() {
    let mut source = io::Cursor::new(b"POLL 1 SUCCESS".to_vec());
    let mut buffer = Vec::new();

    let read = read_line(&mut source, &mut buffer, 64).expect("reads");

    assert_eq!(read, LineRead::Line);
    assert_eq!(buffer, b"POLL 1 SUCCESS");
}

#[test]
fn channel_is_closed_once_the_driver_exits() {
    let store = RecordingStore::with_vms(&[]);
    let reporter = Arc::new(RecordingReporter::default());
    let (channel, handle) = DriverChannel::open(
        DriverId::new("kvm"),
        io::empty(),
        io::sink(),
        dispatcher_with(&store, &reporter),
    )
    .expect("channel opens");

    handle.join().expect("reader exits cleanly");

    assert!(!channel.is_open());
    let error = channel
        .send(&codec::encode(Verb::Poll, VmId::new(1), ""))
        .expect_err("channel is closed");
    assert!(matches!(error, ChannelError::Closed { .. }));
}

#[test]
fn read_errors_close_the_channel_and_are_reported() {
    let store = RecordingStore::with_vms(&[]);
    let reporter = Arc::new(RecordingReporter::default());
    let (channel, handle) = DriverChannel::open(
        DriverId::new("xen"),
        FailingReader,
        io::sink(),
        dispatcher_with(&store, &reporter),
    )
    .expect("channel opens");

    handle.join().expect("reader exits cleanly");

    assert!(!channel.is_open());
    assert_eq!(
        reporter.events().last(),
        Some(&HealthEvent::Closed {
            driver: DriverId::new("xen"),
            failed: true
        })
    );
}

#[test]
fn failed_write_closes_the_channel() {
    let store = RecordingStore::with_vms(&[]);
    let reporter = Arc::new(RecordingReporter::default());
    let (reader, writer) = io::pipe().expect("pipe");
    let (channel, handle) = DriverChannel::open(
        DriverId::new("kvm"),
        reader,
        BrokenPipe,
        dispatcher_with(&store, &reporter),
    )
    .expect("channel opens");

    let error = channel
        .send(&codec::encode(Verb::Shutdown, VmId::new(2), ""))
        .expect_err("write fails");

    assert!(matches!(error, ChannelError::Io { .. }));
    assert!(!channel.is_open());
    drop(writer);
    handle.join().expect("reader exits cleanly");
}

#[test]
fn close_rejects_further_commands() {
    let store = RecordingStore::with_vms(&[]);
    let reporter = Arc::new(RecordingReporter::default());
    let (reader, writer) = io::pipe().expect("pipe");
    let output = SharedBuffer::default();
    let (channel, handle) = DriverChannel::open(
        DriverId::new("kvm"),
        reader,
        output.clone(),
        dispatcher_with(&store, &reporter),
    )
    .expect("channel opens");

    channel.close();
    let error = channel
        .send(&codec::encode(Verb::Cancel, VmId::new(2), ""))
        .expect_err("channel is closed");

    assert!(matches!(error, ChannelError::Closed { .. }));
    assert!(output.contents().is_empty());
    drop(writer);
    handle.join().expect("reader exits cleanly");
}
