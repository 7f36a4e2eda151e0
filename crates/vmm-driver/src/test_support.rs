//! Test doubles shared by unit and behaviour tests.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::codec::{Reply, Verb};
use crate::health::HealthReporter;
use crate::ids::{DriverId, VmId};
use crate::monitoring::MonitoringRecord;
use crate::registry::TimedOut;
use crate::store::{MemoryVmStore, StoreError, VmHandle, VmObject, VmStatus, VmStore};

/// One interaction with the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreCall {
    Lock(VmId),
    SetStatus(VmId, VmStatus),
    SetMonitoring(VmId, MonitoringRecord),
    SetDeployId(VmId, String),
    RecordError(VmId, String),
}

/// Store spy that records every lock and mutation before delegating to a
/// [`MemoryVmStore`].
#[derive(Debug, Default)]
pub(crate) struct RecordingStore {
    inner: MemoryVmStore,
    calls: Mutex<Vec<StoreCall>>,
}

impl RecordingStore {
    pub(crate) fn with_vms(vms: &[(u32, VmStatus)]) -> Arc<Self> {
        let store = Self::default();
        for (id, status) in vms {
            store.inner.insert(VmId::new(*id), *status);
        }
        Arc::new(store)
    }

    pub(crate) fn calls(&self) -> Vec<StoreCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Calls that changed a VM, leaving out bare lock acquisitions.
    pub(crate) fn mutations(&self) -> Vec<StoreCall> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, StoreCall::Lock(_)))
            .collect()
    }

    pub(crate) fn status(&self, vm: u32) -> Option<VmStatus> {
        self.inner.status(VmId::new(vm))
    }

    pub(crate) fn snapshot(&self, vm: u32) -> Option<VmObject> {
        self.inner.snapshot(VmId::new(vm))
    }

    fn push(&self, call: StoreCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

struct RecordingHandle<'a> {
    inner: &'a mut dyn VmHandle,
    store: &'a RecordingStore,
}

impl VmHandle for RecordingHandle<'_> {
    fn id(&self) -> VmId {
        self.inner.id()
    }

    fn status(&self) -> VmStatus {
        self.inner.status()
    }

    fn set_status(&mut self, status: VmStatus) {
        self.store.push(StoreCall::SetStatus(self.id(), status));
        self.inner.set_status(status);
    }

    fn set_monitoring(&mut self, record: MonitoringRecord) {
        self.store
            .push(StoreCall::SetMonitoring(self.id(), record.clone()));
        self.inner.set_monitoring(record);
    }

    fn set_deploy_id(&mut self, deploy_id: &str) {
        self.store
            .push(StoreCall::SetDeployId(self.id(), deploy_id.to_owned()));
        self.inner.set_deploy_id(deploy_id);
    }

    fn record_error(&mut self, message: &str) {
        self.store
            .push(StoreCall::RecordError(self.id(), message.to_owned()));
        self.inner.record_error(message);
    }
}

impl VmStore for RecordingStore {
    fn lock(&self, vm: VmId, apply: &mut dyn FnMut(&mut dyn VmHandle)) -> Result<(), StoreError> {
        self.push(StoreCall::Lock(vm));
        self.inner.lock(vm, &mut |handle| {
            let mut recording = RecordingHandle {
                inner: handle,
                store: self,
            };
            apply(&mut recording);
        })
    }
}

/// Health event captured by [`RecordingReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HealthEvent {
    Opened(DriverId),
    Closed { driver: DriverId, failed: bool },
    Orphaned { driver: DriverId, vm: VmId, verb: Verb },
    TimedOut { vm: VmId, verb: Verb },
}

#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingReporter {
    pub(crate) fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, event: HealthEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl HealthReporter for RecordingReporter {
    fn channel_opened(&self, driver: &DriverId) {
        self.push(HealthEvent::Opened(driver.clone()));
    }

    fn channel_closed(&self, driver: &DriverId, error: Option<&str>) {
        self.push(HealthEvent::Closed {
            driver: driver.clone(),
            failed: error.is_some(),
        });
    }

    fn reply_orphaned(&self, driver: &DriverId, reply: &Reply) {
        self.push(HealthEvent::Orphaned {
            driver: driver.clone(),
            vm: reply.vm(),
            verb: reply.verb(),
        });
    }

    fn request_timed_out(&self, expired: &TimedOut) {
        self.push(HealthEvent::TimedOut {
            vm: expired.request().vm(),
            verb: expired.request().verb(),
        });
    }
}

/// Cloneable in-memory writer standing in for a driver's stdin.
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub(crate) fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
