//! Typed command API over one driver.
//!
//! [`VmmDriver`] is the only way callers issue lifecycle commands. Each
//! per-verb method builds a [`Command`], registers it as outstanding, and
//! writes exactly one line to the driver. The outcome of an accepted command
//! is never returned here: it reaches the VM status once the driver replies
//! or the request times out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use vmm_config::Config;

use crate::channel::DriverChannel;
use crate::codec::Verb;
use crate::command::Command;
use crate::descriptor::{self, DescriptorGenerator};
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, SubmissionError};
use crate::ids::{DriverId, VmId};
use crate::store::VmStore;

/// Tracing target for command submission.
const FACADE_TARGET: &str = "vmm_driver::facade";

struct DescriptorSink {
    generator: Arc<dyn DescriptorGenerator>,
    directory: PathBuf,
}

/// Command façade for a single driver.
///
/// # Example
///
/// ```
/// use std::io;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use vmm_driver::{Dispatcher, DriverChannel, DriverId, MemoryVmStore, VmId, VmmDriver};
///
/// let dispatcher = Arc::new(Dispatcher::new(Arc::new(MemoryVmStore::new())));
/// let (reader, _driver_stdout) = io::pipe().expect("pipe");
/// let (channel, _reader_thread) =
///     DriverChannel::open(DriverId::new("kvm"), reader, io::sink(), Arc::clone(&dispatcher))
///         .expect("channel opens");
///
/// let driver = VmmDriver::new(channel, dispatcher, Duration::from_secs(90));
/// driver.poll(VmId::new(3), "").expect("command accepted");
/// assert!(driver.poll(VmId::new(3), "").is_err());
/// ```
pub struct VmmDriver<S> {
    channel: Arc<DriverChannel>,
    dispatcher: Arc<Dispatcher<S>>,
    request_timeout: Duration,
    descriptor: Option<DescriptorSink>,
}

impl<S> VmmDriver<S>
where
    S: VmStore,
{
    /// Builds a façade writing to `channel` and registering with
    /// `dispatcher`. Each command must be answered within `request_timeout`.
    #[must_use]
    pub const fn new(
        channel: Arc<DriverChannel>,
        dispatcher: Arc<Dispatcher<S>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            request_timeout,
            descriptor: None,
        }
    }

    /// Builds a façade using the configured request timeout.
    #[must_use]
    pub const fn from_config(
        channel: Arc<DriverChannel>,
        dispatcher: Arc<Dispatcher<S>>,
        config: &Config,
    ) -> Self {
        Self::new(channel, dispatcher, config.request_timeout())
    }

    /// Generates a deployment descriptor in `directory` before every deploy.
    #[must_use]
    pub fn with_descriptor(
        mut self,
        generator: Arc<dyn DescriptorGenerator>,
        directory: impl Into<PathBuf>,
    ) -> Self {
        self.descriptor = Some(DescriptorSink {
            generator,
            directory: directory.into(),
        });
        self
    }

    /// Driver the commands are written to.
    #[must_use]
    pub fn driver(&self) -> &DriverId {
        self.channel.driver()
    }

    /// Deadline budget applied to each command.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Submits a command: registers it as outstanding, then writes it.
    ///
    /// # Errors
    ///
    /// Returns [`SubmissionError::ChannelClosed`] when the driver connection
    /// is down and [`SubmissionError::AlreadyPending`] when the VM already has
    /// a command in flight on this driver, and
    /// [`SubmissionError::DeadlineOutOfRange`] when the request timeout cannot
    /// be added to the current time. Nothing stays registered on error.
    pub fn submit(&self, command: &Command) -> Result<(), SubmissionError> {
        let driver = self.channel.driver();
        if !self.channel.is_open() {
            return Err(channel_closed(
                command,
                ChannelError::Closed {
                    driver: driver.clone(),
                },
            ));
        }

        let deadline = Instant::now()
            .checked_add(self.request_timeout)
            .ok_or(SubmissionError::DeadlineOutOfRange {
                verb: command.verb(),
                vm: command.vm(),
                timeout: self.request_timeout,
            })?;
        self.dispatcher
            .registry()
            .register(driver, command.vm(), command.verb(), deadline)?;

        if let Err(source) = self.channel.send(&command.encode()) {
            // The line never reached the driver, so no reply will resolve it.
            let _unregistered = self.dispatcher.registry().resolve(driver, command.vm());
            return Err(channel_closed(command, source));
        }

        debug!(
            target: FACADE_TARGET,
            driver = %driver,
            vm = %command.vm(),
            verb = %command.verb(),
            origin = %command.origin(),
            "command submitted"
        );
        Ok(())
    }

    /// Generates the deployment descriptor, if configured, then boots the VM.
    ///
    /// # Errors
    ///
    /// Returns [`SubmissionError::Descriptor`] when the descriptor cannot be
    /// generated; no command is sent in that case. Otherwise see
    /// [`VmmDriver::submit`].
    pub fn deploy(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        if let Some(sink) = &self.descriptor {
            sink.generate(vm)?;
        }
        self.submit(&Command::new(Verb::Deploy, vm, payload))
    }

    /// Asks the guest to shut down.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn shutdown(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Shutdown, vm, payload))
    }

    /// Hard-resets the VM.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn reset(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Reset, vm, payload))
    }

    /// Reboots the VM through the guest.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn reboot(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Reboot, vm, payload))
    }

    /// Destroys the VM without asking the guest.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn cancel(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Cancel, vm, payload))
    }

    /// Removes leftovers of the VM from its host.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn cleanup(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Cleanup, vm, payload))
    }

    /// Checkpoints the running VM.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn checkpoint(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Checkpoint, vm, payload))
    }

    /// Saves VM memory to disk and stops it.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn save(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Save, vm, payload))
    }

    /// Resumes the VM from a saved image.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn restore(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Restore, vm, payload))
    }

    /// Live-migrates the VM to another host.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn migrate(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Migrate, vm, payload))
    }

    /// Requests fresh monitoring data for the VM.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn poll(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::Poll, vm, payload))
    }

    /// Hot-plugs a disk.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn attach_disk(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::AttachDisk, vm, payload))
    }

    /// Hot-unplugs a disk.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn detach_disk(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::DetachDisk, vm, payload))
    }

    /// Hot-plugs a network interface.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn attach_nic(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::AttachNic, vm, payload))
    }

    /// Hot-unplugs a network interface.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn detach_nic(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::DetachNic, vm, payload))
    }

    /// Takes a hypervisor snapshot.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn snapshot_create(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::SnapshotCreate, vm, payload))
    }

    /// Reverts to a hypervisor snapshot.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn snapshot_revert(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::SnapshotRevert, vm, payload))
    }

    /// Deletes a hypervisor snapshot.
    ///
    /// # Errors
    ///
    /// See [`VmmDriver::submit`].
    pub fn snapshot_delete(&self, vm: VmId, payload: &str) -> Result<(), SubmissionError> {
        self.submit(&Command::new(Verb::SnapshotDelete, vm, payload))
    }
}

impl DescriptorSink {
    fn generate(&self, vm: VmId) -> Result<(), descriptor::DescriptorError> {
        let path = descriptor::descriptor_path(&self.directory, vm);
        self.generator.generate(vm, &path)?;
        debug!(
            target: FACADE_TARGET,
            vm = %vm,
            path = %path.display(),
            "deployment descriptor generated"
        );
        Ok(())
    }
}

fn channel_closed(command: &Command, source: ChannelError) -> SubmissionError {
    SubmissionError::ChannelClosed {
        verb: command.verb(),
        vm: command.vm(),
        source,
    }
}
