//! Errors raised while talking to a driver.
//!
//! All errors use `thiserror`-derived types with structured context so callers
//! can inspect the failure programmatically. I/O errors are wrapped in `Arc`
//! to satisfy the `result_large_err` Clippy lint and keep the types `Clone`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::Verb;
use crate::descriptor::DescriptorError;
use crate::ids::{DriverId, VmId};
use crate::registry::AlreadyPending;

/// Errors raised by a [`DriverChannel`](crate::DriverChannel).
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The channel no longer accepts commands.
    #[error("driver '{driver}' channel is closed")]
    Closed {
        /// Driver behind the channel.
        driver: DriverId,
    },

    /// Writing to the driver failed. The channel is closed afterwards.
    #[error("I/O error on driver '{driver}' channel: {source}")]
    Io {
        /// Driver behind the channel.
        driver: DriverId,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The reader thread could not be started.
    #[error("failed to start reader thread for driver '{driver}': {source}")]
    Spawn {
        /// Driver behind the channel.
        driver: DriverId,
        /// Underlying spawn error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The reader thread panicked.
    #[error("reader thread for driver '{driver}' panicked")]
    ReaderPanic {
        /// Driver behind the channel.
        driver: DriverId,
    },
}

/// Errors returned synchronously when a command cannot be submitted.
///
/// Outcomes of accepted commands are never reported here; they surface only
/// through the VM status once the driver replies or the request times out.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// A command for the VM is already in flight on this driver.
    #[error(transparent)]
    AlreadyPending(#[from] AlreadyPending),

    /// The driver connection is down; nothing was registered.
    #[error("cannot send {verb} for VM {vm}: {source}")]
    ChannelClosed {
        /// Verb of the rejected command.
        verb: Verb,
        /// Target VM.
        vm: VmId,
        /// Channel failure.
        #[source]
        source: ChannelError,
    },

    /// The request timeout is too large to compute a deadline from.
    #[error("cannot send {verb} for VM {vm}: timeout {timeout:?} overflows the deadline")]
    DeadlineOutOfRange {
        /// Verb of the rejected command.
        verb: Verb,
        /// Target VM.
        vm: VmId,
        /// Configured request timeout.
        timeout: Duration,
    },

    /// The deployment descriptor could not be generated.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}
