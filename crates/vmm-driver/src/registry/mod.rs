//! Registry of commands awaiting a driver reply.
//!
//! The [`RequestRegistry`] holds at most one [`OutstandingRequest`] per
//! driver and VM. A second command for the same pair is rejected with
//! [`AlreadyPending`] rather than queued, so two replies can never race to
//! update one VM. Entries leave the registry when a terminal reply resolves
//! them, when a housekeeping [`sweep`](RequestRegistry::sweep) finds them past
//! their deadline, or when a driver is recovered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::codec::Verb;
use crate::ids::{DriverId, VmId};

/// A command written to a driver and not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    driver: DriverId,
    vm: VmId,
    verb: Verb,
    sequence: u64,
    submitted_at: Instant,
    deadline: Instant,
}

impl OutstandingRequest {
    /// Driver the command was written to.
    #[must_use]
    pub const fn driver(&self) -> &DriverId {
        &self.driver
    }

    /// VM the command addresses.
    #[must_use]
    pub const fn vm(&self) -> VmId {
        self.vm
    }

    /// Verb of the command.
    #[must_use]
    pub const fn verb(&self) -> Verb {
        self.verb
    }

    /// When the command was registered.
    #[must_use]
    pub const fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Instant after which the command counts as timed out.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// A request removed by [`RequestRegistry::sweep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOut {
    request: OutstandingRequest,
    overdue: Duration,
}

impl TimedOut {
    /// The expired request.
    #[must_use]
    pub const fn request(&self) -> &OutstandingRequest {
        &self.request
    }

    /// How far past its deadline the request was when swept.
    #[must_use]
    pub const fn overdue(&self) -> Duration {
        self.overdue
    }
}

/// Returned when a command targets a VM that already has one in flight.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("driver '{driver}' already has a {verb} pending for VM {vm}")]
pub struct AlreadyPending {
    /// Driver holding the pending request.
    pub driver: DriverId,
    /// VM the pending request addresses.
    pub vm: VmId,
    /// Verb of the request already in flight.
    pub verb: Verb,
}

type RequestKey = (DriverId, VmId);

/// Thread-safe table of in-flight requests.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use vmm_driver::{DriverId, RequestRegistry, Verb, VmId};
///
/// let registry = RequestRegistry::new();
/// let kvm = DriverId::new("kvm");
/// let deadline = Instant::now() + Duration::from_secs(30);
///
/// registry.register(&kvm, VmId::new(7), Verb::Deploy, deadline).expect("first command");
/// assert!(registry.register(&kvm, VmId::new(7), Verb::Poll, deadline).is_err());
///
/// let resolved = registry.resolve(&kvm, VmId::new(7)).expect("entry present");
/// assert_eq!(resolved.verb(), Verb::Deploy);
/// assert!(registry.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct RequestRegistry {
    entries: Mutex<HashMap<RequestKey, OutstandingRequest>>,
    next_sequence: AtomicU64,
}

impl RequestRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestKey, OutstandingRequest>> {
        // A panic while the lock was held cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a command as in flight until `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`AlreadyPending`] when the driver already has a request for
    /// this VM. The existing entry is left untouched.
    pub fn register(
        &self,
        driver: &DriverId,
        vm: VmId,
        verb: Verb,
        deadline: Instant,
    ) -> Result<(), AlreadyPending> {
        let mut entries = self.entries();
        let key = (driver.clone(), vm);
        if let Some(existing) = entries.get(&key) {
            return Err(AlreadyPending {
                driver: driver.clone(),
                vm,
                verb: existing.verb,
            });
        }
        entries.insert(
            key,
            OutstandingRequest {
                driver: driver.clone(),
                vm,
                verb,
                sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
                submitted_at: Instant::now(),
                deadline,
            },
        );
        Ok(())
    }

    /// Removes and returns the request pending for the pair, if any.
    pub fn resolve(&self, driver: &DriverId, vm: VmId) -> Option<OutstandingRequest> {
        self.entries().remove(&(driver.clone(), vm))
    }

    /// Removes the pending request only when it was issued for `verb`.
    ///
    /// A reply naming another verb belongs to an older, already forgotten
    /// command; the current entry stays pending.
    pub fn resolve_reply(
        &self,
        driver: &DriverId,
        vm: VmId,
        verb: Verb,
    ) -> Option<OutstandingRequest> {
        let mut entries = self.entries();
        let key = (driver.clone(), vm);
        match entries.get(&key) {
            Some(pending) if pending.verb == verb => entries.remove(&key),
            _ => None,
        }
    }

    /// Removes and returns every request whose deadline is before `now`,
    /// ordered by deadline.
    pub fn sweep(&self, now: Instant) -> Vec<TimedOut> {
        let mut entries = self.entries();
        let expired: Vec<RequestKey> = entries
            .iter()
            .filter(|(_, request)| request.deadline < now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut timed_out: Vec<TimedOut> = expired
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .map(|request| TimedOut {
                overdue: now.saturating_duration_since(request.deadline),
                request,
            })
            .collect();
        timed_out.sort_by_key(|entry| entry.request.deadline);
        timed_out
    }

    /// Returns copies of the requests whose deadline is before `now`, ordered
    /// by deadline. Nothing is removed; see [`RequestRegistry::expire`].
    #[must_use]
    pub fn overdue(&self, now: Instant) -> Vec<OutstandingRequest> {
        let mut overdue: Vec<OutstandingRequest> = self
            .entries()
            .values()
            .filter(|request| request.deadline < now)
            .cloned()
            .collect();
        overdue.sort_by_key(|request| request.deadline);
        overdue
    }

    /// Removes `request` as timed out if it is still the entry pending for its
    /// pair.
    ///
    /// Returns `None` when the request was resolved in the meantime or a newer
    /// command for the same pair has replaced it.
    pub fn expire(&self, request: &OutstandingRequest, now: Instant) -> Option<TimedOut> {
        let mut entries = self.entries();
        let key = (request.driver.clone(), request.vm);
        match entries.get(&key) {
            Some(current) if current.sequence == request.sequence => {
                entries.remove(&key).map(|expired| TimedOut {
                    overdue: now.saturating_duration_since(expired.deadline),
                    request: expired,
                })
            }
            _ => None,
        }
    }

    /// Removes and returns every request pending on `driver`.
    pub fn drain_driver(&self, driver: &DriverId) -> Vec<OutstandingRequest> {
        let mut entries = self.entries();
        let keys: Vec<RequestKey> = entries
            .keys()
            .filter(|(owner, _)| owner == driver)
            .cloned()
            .collect();
        let mut drained: Vec<OutstandingRequest> = keys
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect();
        drained.sort_by_key(|request| request.vm);
        drained
    }

    /// Returns a copy of the request pending for the pair, if any.
    #[must_use]
    pub fn pending(&self, driver: &DriverId, vm: VmId) -> Option<OutstandingRequest> {
        self.entries().get(&(driver.clone(), vm)).cloned()
    }

    /// Number of requests in flight across all drivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` when nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests;
