//! One bidirectional session with a driver process.
//!
//! A [`DriverChannel`] owns the write half of the driver's byte stream. The
//! read half is moved into a dedicated reader thread that splits it into
//! lines and hands each one to the shared [`Dispatcher`]. A bad line is
//! dropped by the dispatcher and a line longer than
//! [`MAX_LINE_BYTES`](crate::codec::MAX_LINE_BYTES) is skipped unread; only
//! end of stream or a read error stops the reader, which then marks the
//! channel closed.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

use crate::codec::{self, CodecError, WireLine};
use crate::dispatcher::Dispatcher;
use crate::error::ChannelError;
use crate::ids::DriverId;
use crate::store::VmStore;

/// Tracing target for driver channel operations.
const CHANNEL_TARGET: &str = "vmm_driver::channel";

/// Write side of a driver session, shared by command submitters.
pub struct DriverChannel {
    driver: DriverId,
    writer: Mutex<Box<dyn Write + Send>>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for DriverChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverChannel")
            .field("driver", &self.driver)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl DriverChannel {
    /// Opens a channel over the driver's output and input streams.
    ///
    /// `reader` is usually the driver's stdout and `writer` its stdin. The
    /// reader thread runs until the driver closes its output.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Spawn`] when the reader thread cannot start.
    pub fn open<R, W, S>(
        driver: DriverId,
        reader: R,
        writer: W,
        dispatcher: Arc<Dispatcher<S>>,
    ) -> Result<(Arc<Self>, ChannelHandle), ChannelError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        S: VmStore + 'static,
    {
        let open = Arc::new(AtomicBool::new(true));
        let channel = Arc::new(Self {
            driver: driver.clone(),
            writer: Mutex::new(Box::new(writer)),
            open: Arc::clone(&open),
        });

        let reader_driver = driver.clone();
        let reader_open = Arc::clone(&open);
        let handle = thread::Builder::new()
            .name(format!("vmm-driver-{driver}"))
            .spawn(move || run_read_loop(&reader_driver, reader, &dispatcher, &reader_open))
            .map_err(|source| {
                open.store(false, Ordering::SeqCst);
                ChannelError::Spawn {
                    driver: driver.clone(),
                    source: Arc::new(source),
                }
            })?;

        Ok((
            channel,
            ChannelHandle {
                driver,
                handle: Some(handle),
            },
        ))
    }

    /// Driver behind the channel.
    #[must_use]
    pub const fn driver(&self) -> &DriverId {
        &self.driver
    }

    /// Returns `true` while commands may be written.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stops accepting commands. The reader keeps draining replies until the
    /// driver closes its output.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!(target: CHANNEL_TARGET, driver = %self.driver, "driver channel closed for writing");
        }
    }

    /// Writes one line to the driver and flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] when the channel is closed and
    /// [`ChannelError::Io`] when the write fails; the channel is closed in
    /// the latter case.
    pub fn send(&self, line: &WireLine) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed {
                driver: self.driver.clone(),
            });
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let written = writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.flush());
        drop(writer);

        written.map_err(|source| {
            self.open.store(false, Ordering::SeqCst);
            ChannelError::Io {
                driver: self.driver.clone(),
                source: Arc::new(source),
            }
        })?;

        debug!(
            target: CHANNEL_TARGET,
            driver = %self.driver,
            line = %line,
            "command written"
        );
        Ok(())
    }
}

/// Handle to a channel's reader thread.
#[derive(Debug)]
pub struct ChannelHandle {
    driver: DriverId,
    handle: Option<thread::JoinHandle<()>>,
}

impl ChannelHandle {
    /// Returns `true` once the reader thread has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(thread::JoinHandle::is_finished)
    }

    /// Waits for the reader thread to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ReaderPanic`] if the reader thread panicked.
    pub fn join(mut self) -> Result<(), ChannelError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ChannelError::ReaderPanic {
                driver: self.driver.clone(),
            }),
            None => Ok(()),
        }
    }
}

fn run_read_loop<R, S>(
    driver: &DriverId,
    reader: R,
    dispatcher: &Dispatcher<S>,
    open: &AtomicBool,
) where
    R: Read,
    S: VmStore,
{
    dispatcher.reporter().channel_opened(driver);
    let mut lines = BufReader::new(reader);
    let mut buffer = Vec::new();

    let failure = loop {
        buffer.clear();
        match read_line(&mut lines, &mut buffer, codec::MAX_LINE_BYTES) {
            Ok(LineRead::End) => break None,
            Ok(LineRead::Line) => {
                dispatcher.handle_line(driver, &buffer);
            }
            Ok(LineRead::Oversized) => {
                let error = CodecError::TooLong {
                    limit: codec::MAX_LINE_BYTES,
                };
                warn!(
                    target: CHANNEL_TARGET,
                    driver = %driver,
                    error = %error,
                    "dropping oversized driver line"
                );
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => break Some(error.to_string()),
        }
    };

    open.store(false, Ordering::SeqCst);
    dispatcher
        .reporter()
        .channel_closed(driver, failure.as_deref());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    End,
    Line,
    Oversized,
}

/// Reads one line of at most `limit` bytes into `buffer`.
///
/// When the limit is reached without a terminator the rest of the line is
/// consumed and discarded, and `buffer` holds only its first `limit` bytes.
fn read_line<B>(source: &mut B, buffer: &mut Vec<u8>, limit: usize) -> io::Result<LineRead>
where
    B: BufRead,
{
    let cap = u64::try_from(limit).unwrap_or(u64::MAX);
    let read = source.by_ref().take(cap).read_until(b'\n', buffer)?;
    if read == 0 {
        return Ok(LineRead::End);
    }
    if buffer.last() == Some(&b'\n') || read < limit {
        return Ok(LineRead::Line);
    }
    skip_rest_of_line(source)?;
    Ok(LineRead::Oversized)
}

fn skip_rest_of_line<B>(source: &mut B) -> io::Result<()>
where
    B: BufRead,
{
    loop {
        let (used, done) = match source.fill_buf() {
            Ok(available) => match available.iter().position(|&byte| byte == b'\n') {
                Some(end) => (end + 1, true),
                None => (available.len(), available.is_empty()),
            },
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        source.consume(used);
        if done {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests;
