//! Interface to the store that owns VM objects.
//!
//! The dispatcher never holds a VM object directly. It asks the [`VmStore`]
//! for an exclusive, closure-scoped lock on one VM and mutates it through the
//! [`VmHandle`] passed to the closure. The lock is released when the closure
//! returns, on every path, so it can never be held across driver I/O.
//!
//! [`MemoryVmStore`] is an in-process implementation used by tests and by
//! embedders that keep VM state in memory.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;

use crate::codec::Verb;
use crate::ids::VmId;
use crate::monitoring::MonitoringRecord;

/// Lifecycle status of a VM as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmStatus {
    /// Created but not yet confirmed by a driver.
    Pending,
    /// Running on a host.
    Running,
    /// Suspended by the hypervisor.
    Paused,
    /// Memory saved to disk, VM stopped.
    Saved,
    /// Shut down or destroyed.
    Done,
    /// The driver reported a failure for the verb.
    Failed(Verb),
    /// The driver did not answer the verb before its deadline.
    TimedOut(Verb),
    /// No reliable information.
    Unknown,
}

impl VmStatus {
    /// Maps a monitoring state code to a status.
    ///
    /// Returns `None` for the unknown sentinel and for codes this crate does
    /// not recognise; such polls leave the status untouched.
    #[must_use]
    pub const fn from_poll_state(code: char) -> Option<Self> {
        match code {
            'a' => Some(Self::Running),
            'p' => Some(Self::Paused),
            'e' => Some(Self::Failed(Verb::Poll)),
            'd' => Some(Self::Done),
            _ => None,
        }
    }

    /// Returns `true` for statuses that end an operation's effect.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Saved | Self::Done | Self::Failed(_) | Self::TimedOut(_)
        )
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => formatter.write_str("pending"),
            Self::Running => formatter.write_str("running"),
            Self::Paused => formatter.write_str("paused"),
            Self::Saved => formatter.write_str("saved"),
            Self::Done => formatter.write_str("done"),
            Self::Failed(verb) => write!(formatter, "failed({verb})"),
            Self::TimedOut(verb) => write!(formatter, "timed-out({verb})"),
            Self::Unknown => formatter.write_str("unknown"),
        }
    }
}

impl Verb {
    /// Status applied when the driver reports `SUCCESS` for this verb.
    ///
    /// `POLL` has no fixed target; its status comes from the monitoring
    /// payload.
    #[must_use]
    pub const fn success_status(self) -> Option<VmStatus> {
        match self {
            Self::Poll => None,
            Self::Shutdown | Self::Cancel | Self::Cleanup => Some(VmStatus::Done),
            Self::Save => Some(VmStatus::Saved),
            Self::Deploy
            | Self::Reset
            | Self::Reboot
            | Self::Checkpoint
            | Self::Restore
            | Self::Migrate
            | Self::AttachDisk
            | Self::DetachDisk
            | Self::AttachNic
            | Self::DetachNic
            | Self::SnapshotCreate
            | Self::SnapshotRevert
            | Self::SnapshotDelete => Some(VmStatus::Running),
        }
    }

    /// Status applied when the driver reports `FAILURE` for this verb.
    ///
    /// A failed `POLL` says nothing about the VM itself, so it has none.
    #[must_use]
    pub const fn failure_status(self) -> Option<VmStatus> {
        match self {
            Self::Poll => None,
            verb => Some(VmStatus::Failed(verb)),
        }
    }
}

/// Mutable view of one locked VM object.
pub trait VmHandle {
    /// Identifier of the locked VM.
    fn id(&self) -> VmId;

    /// Current status.
    fn status(&self) -> VmStatus;

    /// Replaces the status.
    fn set_status(&mut self, status: VmStatus);

    /// Replaces the monitoring snapshot.
    fn set_monitoring(&mut self, record: MonitoringRecord);

    /// Records the hypervisor-side identifier returned by a deploy.
    fn set_deploy_id(&mut self, deploy_id: &str);

    /// Records driver error text for operators.
    fn record_error(&mut self, message: &str);
}

/// Errors raised when a VM cannot be locked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No VM with this id exists.
    #[error("VM {vm} does not exist")]
    UnknownVm {
        /// Requested VM.
        vm: VmId,
    },

    /// The backing store could not provide the VM.
    #[error("VM {vm} is unavailable: {message}")]
    Unavailable {
        /// Requested VM.
        vm: VmId,
        /// Store-specific description.
        message: String,
    },
}

/// Store that owns VM objects and hands out per-VM lock scopes.
pub trait VmStore: Send + Sync {
    /// Locks `vm`, runs `apply` on it, then releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the VM cannot be locked. `apply` is not
    /// invoked in that case.
    fn lock(&self, vm: VmId, apply: &mut dyn FnMut(&mut dyn VmHandle)) -> Result<(), StoreError>;
}

impl<T> VmStore for Arc<T>
where
    T: VmStore + ?Sized,
{
    fn lock(&self, vm: VmId, apply: &mut dyn FnMut(&mut dyn VmHandle)) -> Result<(), StoreError> {
        (**self).lock(vm, apply)
    }
}

/// VM object held by [`MemoryVmStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmObject {
    id: VmId,
    status: VmStatus,
    monitoring: Option<MonitoringRecord>,
    deploy_id: Option<String>,
    last_error: Option<String>,
}

impl VmObject {
    /// Creates a VM object with the given status and no monitoring data.
    #[must_use]
    pub const fn new(id: VmId, status: VmStatus) -> Self {
        Self {
            id,
            status,
            monitoring: None,
            deploy_id: None,
            last_error: None,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> VmStatus {
        self.status
    }

    /// Last monitoring snapshot applied, if any.
    #[must_use]
    pub const fn monitoring(&self) -> Option<&MonitoringRecord> {
        self.monitoring.as_ref()
    }

    /// Hypervisor-side identifier recorded by a successful deploy.
    #[must_use]
    pub fn deploy_id(&self) -> Option<&str> {
        self.deploy_id.as_deref()
    }

    /// Most recent error text reported by a driver.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

impl VmHandle for VmObject {
    fn id(&self) -> VmId {
        self.id
    }

    fn status(&self) -> VmStatus {
        self.status
    }

    fn set_status(&mut self, status: VmStatus) {
        self.status = status;
    }

    fn set_monitoring(&mut self, record: MonitoringRecord) {
        self.monitoring = Some(record);
    }

    fn set_deploy_id(&mut self, deploy_id: &str) {
        self.deploy_id = Some(deploy_id.to_owned());
    }

    fn record_error(&mut self, message: &str) {
        self.last_error = Some(message.to_owned());
    }
}

/// In-memory [`VmStore`] with one mutex per VM.
///
/// # Example
///
/// ```
/// use vmm_driver::{MemoryVmStore, VmId, VmStatus, VmStore};
///
/// let store = MemoryVmStore::new();
/// store.insert(VmId::new(7), VmStatus::Pending);
/// store
///     .lock(VmId::new(7), &mut |vm| vm.set_status(VmStatus::Running))
///     .expect("VM exists");
/// assert_eq!(store.status(VmId::new(7)), Some(VmStatus::Running));
/// ```
#[derive(Debug, Default)]
pub struct MemoryVmStore {
    vms: RwLock<HashMap<VmId, Arc<Mutex<VmObject>>>>,
}

impl MemoryVmStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a VM.
    pub fn insert(&self, vm: VmId, status: VmStatus) {
        let mut vms = self.vms.write().unwrap_or_else(PoisonError::into_inner);
        vms.insert(vm, Arc::new(Mutex::new(VmObject::new(vm, status))));
    }

    /// Returns a copy of the VM object.
    #[must_use]
    pub fn snapshot(&self, vm: VmId) -> Option<VmObject> {
        let object = self.object(vm)?;
        let guard = object.lock().unwrap_or_else(PoisonError::into_inner);
        Some(guard.clone())
    }

    /// Returns the current status of the VM.
    #[must_use]
    pub fn status(&self, vm: VmId) -> Option<VmStatus> {
        self.snapshot(vm).map(|object| object.status)
    }

    fn object(&self, vm: VmId) -> Option<Arc<Mutex<VmObject>>> {
        let vms = self.vms.read().unwrap_or_else(PoisonError::into_inner);
        vms.get(&vm).map(Arc::clone)
    }
}

impl VmStore for MemoryVmStore {
    fn lock(&self, vm: VmId, apply: &mut dyn FnMut(&mut dyn VmHandle)) -> Result<(), StoreError> {
        // The map lock is released before the per-VM lock is taken.
        let object = self.object(vm).ok_or(StoreError::UnknownVm { vm })?;
        let mut guard = object.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut *guard);
        Ok(())
    }
}
