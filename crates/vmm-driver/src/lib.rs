//! Virtual machine driver communication layer.
//!
//! The `vmm-driver` crate connects the control plane to an external
//! hypervisor driver process. Commands are written to the driver as single
//! text lines over its standard input, and the driver answers asynchronously
//! over its standard output with reply lines and diagnostic `LOG` lines.
//!
//! # Architecture
//!
//! A [`VmmDriver`] façade turns lifecycle requests into [`Command`]s,
//! records each one in the [`RequestRegistry`] and writes it to the
//! [`DriverChannel`]. The channel's reader thread hands every line it reads
//! to the [`Dispatcher`], which decodes it with the [`codec`], matches it to
//! the outstanding request and applies the outcome to the VM through the
//! [`VmStore`] seam. Monitoring replies are parsed by [`monitoring`] before
//! they reach the store. A [`Housekeeper`] sweeps requests the driver never
//! answered and marks their VMs as timed out.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::process::{Command as Process, Stdio};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use vmm_driver::{Dispatcher, DriverChannel, DriverId, Housekeeper, MemoryVmStore, VmId, VmmDriver};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut child = Process::new("/var/lib/one/remotes/vmm/kvm/driver")
//!     .stdin(Stdio::piped())
//!     .stdout(Stdio::piped())
//!     .spawn()?;
//! let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
//!     return Ok(());
//! };
//!
//! let dispatcher = Arc::new(Dispatcher::new(MemoryVmStore::new()));
//! let (channel, _reader) =
//!     DriverChannel::open(DriverId::new("kvm"), stdout, stdin, Arc::clone(&dispatcher))?;
//! let _housekeeper = Housekeeper::new(Duration::from_secs(1)).start(Arc::clone(&dispatcher))?;
//!
//! let driver = VmmDriver::new(channel, dispatcher, Duration::from_secs(90));
//! driver.deploy(VmId::new(7), "<VM/>")?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod command;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod health;
pub mod housekeeping;
mod ids;
pub mod monitoring;
pub mod registry;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tests;

pub use self::channel::{ChannelHandle, DriverChannel};
pub use self::codec::{CodecError, DriverMessage, Reply, ReplyStatus, Verb, WireLine};
pub use self::command::{Command, Origin};
pub use self::descriptor::{DescriptorError, DescriptorGenerator};
pub use self::dispatcher::{Dispatcher, LineOutcome, MonitoringOutcome, ReplyDisposition};
pub use self::error::{ChannelError, SubmissionError};
pub use self::facade::VmmDriver;
pub use self::health::{HealthReporter, StructuredHealthReporter};
pub use self::housekeeping::{Housekeeper, HousekeeperError, HousekeeperHandle, MIN_SWEEP_INTERVAL};
pub use self::ids::{DriverId, VmId};
pub use self::monitoring::MonitoringRecord;
pub use self::registry::{AlreadyPending, OutstandingRequest, RequestRegistry, TimedOut};
pub use self::store::{MemoryVmStore, StoreError, VmHandle, VmObject, VmStatus, VmStore};
