//! Protocol engine that applies driver replies to VM state.
//!
//! Every `(driver, vm)` pair moves through `Idle → Pending → Applying → Idle`
//! or `Pending → TimedOut → Idle`. The [`RequestRegistry`] holds the pending
//! half; this module owns the transitions out of it:
//!
//! - a reply that matches the pending request is applied under the VM's lock
//!   scope, using the per-verb success and failure statuses;
//! - a `POLL` reply is parsed before the lock is taken and only writes the
//!   monitoring snapshot, plus the status when the driver reported one;
//! - a reply with no pending request is discarded and reported;
//! - [`Dispatcher::sweep`] marks overdue requests as timed out without
//!   retrying them.
//!
//! Decode and parse errors are logged and contained here, so a driver that
//! writes one bad line keeps its channel.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::codec::{
    self, CodecError, DriverLog, DriverMessage, Reply, ReplyStatus, Severity, Verb,
};
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::ids::{DriverId, VmId};
use crate::monitoring::{self, MonitoringRecord, ParseError};
use crate::registry::{OutstandingRequest, RequestRegistry, TimedOut};
use crate::store::{StoreError, VmHandle, VmStatus, VmStore};

/// Tracing target for dispatcher operations.
const DISPATCHER_TARGET: &str = "vmm_driver::dispatcher";

/// Tracing target used to replay driver `LOG` lines.
const DRIVER_LOG_TARGET: &str = "vmm_driver::driver_log";

/// Result of applying a monitoring payload to a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitoringOutcome {
    /// The snapshot was written. `status` is set when the VM status changed.
    Updated {
        /// Status written from the payload's state code.
        status: Option<VmStatus>,
    },
    /// The payload could not be parsed; the VM was left untouched.
    Skipped(ParseError),
}

/// What the dispatcher did with a decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// The reply resolved a request and its transition was applied.
    Applied {
        /// Status written to the VM, if the verb defines one.
        status: Option<VmStatus>,
    },
    /// A `POLL` reply resolved its request.
    Monitored(MonitoringOutcome),
    /// The reply matched no outstanding request and was discarded.
    Orphaned,
    /// The request was resolved but the VM could not be locked.
    StoreFailed(StoreError),
}

/// What the dispatcher did with a raw line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// The line was a reply.
    Reply(ReplyDisposition),
    /// The line was a driver diagnostic and was logged.
    Logged,
    /// The line did not decode and was dropped.
    Dropped(CodecError),
}

/// State machine shared by every driver channel and the housekeeper.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
/// use vmm_driver::{Dispatcher, DriverId, MemoryVmStore, Verb, VmId, VmStatus};
///
/// let store = Arc::new(MemoryVmStore::new());
/// store.insert(VmId::new(7), VmStatus::Pending);
/// let dispatcher = Dispatcher::new(Arc::clone(&store));
/// let kvm = DriverId::new("kvm");
///
/// dispatcher
///     .registry()
///     .register(&kvm, VmId::new(7), Verb::Deploy, Instant::now() + Duration::from_secs(30))
///     .expect("nothing pending");
/// dispatcher.handle_line(&kvm, b"DEPLOY 7 SUCCESS one-7\n");
///
/// assert_eq!(store.status(VmId::new(7)), Some(VmStatus::Running));
/// assert!(dispatcher.registry().is_empty());
/// ```
pub struct Dispatcher<S> {
    registry: RequestRegistry,
    store: S,
    reporter: Arc<dyn HealthReporter>,
}

impl<S> Dispatcher<S>
where
    S: VmStore,
{
    /// Builds a dispatcher that reports health events through `tracing`.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_reporter(store, Arc::new(StructuredHealthReporter::new()))
    }

    /// Builds a dispatcher with a custom health reporter.
    #[must_use]
    pub fn with_reporter(store: S, reporter: Arc<dyn HealthReporter>) -> Self {
        Self {
            registry: RequestRegistry::new(),
            store,
            reporter,
        }
    }

    /// Registry of requests awaiting a reply.
    #[must_use]
    pub const fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Store receiving state transitions.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Reporter receiving health events.
    #[must_use]
    pub fn reporter(&self) -> &dyn HealthReporter {
        self.reporter.as_ref()
    }

    /// Decodes and handles one raw line read from `driver`.
    ///
    /// Lines that do not decode are logged and dropped.
    pub fn handle_line(&self, driver: &DriverId, raw: &[u8]) -> LineOutcome {
        match codec::decode_message(raw) {
            Ok(message) => self.handle_message(driver, message),
            Err(decode_error) => {
                warn!(
                    target: DISPATCHER_TARGET,
                    driver = %driver,
                    error = %decode_error,
                    line = %String::from_utf8_lossy(raw).trim_end(),
                    "dropping undecodable driver line"
                );
                LineOutcome::Dropped(decode_error)
            }
        }
    }

    /// Handles one decoded message from `driver`.
    pub fn handle_message(&self, driver: &DriverId, message: DriverMessage) -> LineOutcome {
        match message {
            DriverMessage::Reply(reply) => LineOutcome::Reply(self.handle_reply(driver, &reply)),
            DriverMessage::Log(log) => {
                replay_driver_log(driver, &log);
                LineOutcome::Logged
            }
        }
    }

    /// Resolves `reply` against the registry and applies its transition.
    pub fn handle_reply(&self, driver: &DriverId, reply: &Reply) -> ReplyDisposition {
        let Some(request) = self
            .registry
            .resolve_reply(driver, reply.vm(), reply.verb())
        else {
            self.reporter.reply_orphaned(driver, reply);
            return ReplyDisposition::Orphaned;
        };

        let disposition = match (reply.verb(), reply.status()) {
            (Verb::Poll, ReplyStatus::Success) => self.poll_succeeded(reply),
            (_, ReplyStatus::Success) => self.command_succeeded(reply),
            (_, ReplyStatus::Failure) => self.command_failed(driver, reply),
        };

        debug!(
            target: DISPATCHER_TARGET,
            driver = %driver,
            vm = %request.vm(),
            verb = %request.verb(),
            status = %reply.status(),
            elapsed_ms = u64::try_from(request.submitted_at().elapsed().as_millis())
                .unwrap_or(u64::MAX),
            disposition = ?disposition,
            "reply applied"
        );
        disposition
    }

    /// Parses `payload` and writes it to `vm` under the VM's lock scope.
    ///
    /// The payload is parsed before the lock is taken. An unparseable
    /// payload never locks the VM.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the VM cannot be locked.
    pub fn process_poll(&self, vm: VmId, payload: &str) -> Result<MonitoringOutcome, StoreError> {
        let mut pending_record = match parse_payload(vm, payload) {
            Ok(record) => Some(record),
            Err(parse_error) => return Ok(MonitoringOutcome::Skipped(parse_error)),
        };
        let mut status = None;
        self.store.lock(vm, &mut |handle| {
            if let Some(record) = pending_record.take() {
                status = write_record(handle, record);
            }
        })?;
        Ok(MonitoringOutcome::Updated { status })
    }

    /// Parses `payload` and writes it to a VM the caller already holds.
    pub fn apply_monitoring(&self, handle: &mut dyn VmHandle, payload: &str) -> MonitoringOutcome {
        match parse_payload(handle.id(), payload) {
            Ok(record) => MonitoringOutcome::Updated {
                status: write_record(handle, record),
            },
            Err(parse_error) => MonitoringOutcome::Skipped(parse_error),
        }
    }

    /// Expires every request whose deadline is before `now`.
    ///
    /// Each expired VM is marked [`VmStatus::TimedOut`]. The command is not
    /// retried and a late reply for it will be discarded as an orphan. The
    /// entry leaves the registry under the VM's lock scope, so a request that
    /// was answered or replaced meanwhile is left alone.
    pub fn sweep(&self, now: Instant) -> Vec<TimedOut> {
        let mut expired = Vec::new();
        for candidate in self.registry.overdue(now) {
            let status = VmStatus::TimedOut(candidate.verb());
            let mut entry = None;
            let locked = self.store.lock(candidate.vm(), &mut |handle| {
                entry = self.registry.expire(&candidate, now);
                if entry.is_some() {
                    handle.set_status(status);
                }
            });
            if let Err(store_error) = locked {
                entry = self.registry.expire(&candidate, now);
                warn!(
                    target: DISPATCHER_TARGET,
                    driver = %candidate.driver(),
                    vm = %candidate.vm(),
                    error = %store_error,
                    "could not mark timed-out VM"
                );
            }
            if let Some(timed_out) = entry {
                self.reporter.request_timed_out(&timed_out);
                expired.push(timed_out);
            }
        }
        expired
    }

    /// Forgets every request pending on `driver` without touching VM state.
    ///
    /// Call this after reconnecting to a driver. The returned requests are
    /// not replayed; the caller polls those VMs so that their status comes
    /// from the hypervisor rather than from a command that may or may not
    /// have run.
    pub fn recover(&self, driver: &DriverId) -> Vec<OutstandingRequest> {
        let drained = self.registry.drain_driver(driver);
        info!(
            target: DISPATCHER_TARGET,
            driver = %driver,
            pending = drained.len(),
            "cleared pending requests for recovered driver"
        );
        drained
    }

    fn poll_succeeded(&self, reply: &Reply) -> ReplyDisposition {
        match self.process_poll(reply.vm(), reply.data()) {
            Ok(outcome) => ReplyDisposition::Monitored(outcome),
            Err(store_error) => store_failed(reply, store_error),
        }
    }

    fn command_succeeded(&self, reply: &Reply) -> ReplyDisposition {
        let status = reply.verb().success_status();
        let reported_id = reply.data().trim();
        let deploy_id =
            (reply.verb() == Verb::Deploy && !reported_id.is_empty()).then_some(reported_id);
        let result = self.store.lock(reply.vm(), &mut |handle| {
            if let Some(id) = deploy_id {
                handle.set_deploy_id(id);
            }
            if let Some(target) = status {
                handle.set_status(target);
            }
        });
        match result {
            Ok(()) => ReplyDisposition::Applied { status },
            Err(store_error) => store_failed(reply, store_error),
        }
    }

    fn command_failed(&self, driver: &DriverId, reply: &Reply) -> ReplyDisposition {
        warn!(
            target: DISPATCHER_TARGET,
            driver = %driver,
            vm = %reply.vm(),
            verb = %reply.verb(),
            error = reply.data(),
            "driver reported failure"
        );
        let status = reply.verb().failure_status();
        let error_text = reply.data().trim();
        let result = self.store.lock(reply.vm(), &mut |handle| {
            if !error_text.is_empty() {
                handle.record_error(error_text);
            }
            if let Some(target) = status {
                handle.set_status(target);
            }
        });
        match result {
            Ok(()) => ReplyDisposition::Applied { status },
            Err(store_error) => store_failed(reply, store_error),
        }
    }
}

fn store_failed(reply: &Reply, store_error: StoreError) -> ReplyDisposition {
    warn!(
        target: DISPATCHER_TARGET,
        vm = %reply.vm(),
        verb = %reply.verb(),
        error = %store_error,
        "could not apply reply to VM"
    );
    ReplyDisposition::StoreFailed(store_error)
}

fn parse_payload(vm: VmId, payload: &str) -> Result<MonitoringRecord, ParseError> {
    monitoring::parse(payload).inspect_err(|parse_error| {
        warn!(
            target: DISPATCHER_TARGET,
            vm = %vm,
            error = %parse_error,
            "skipping unparseable monitoring payload"
        );
    })
}

/// Writes the snapshot and, when the state code maps to a different status,
/// the status. Returns the status written.
fn write_record(handle: &mut dyn VmHandle, record: MonitoringRecord) -> Option<VmStatus> {
    let reported = VmStatus::from_poll_state(record.state);
    handle.set_monitoring(record);
    match reported {
        Some(status) if status != handle.status() => {
            handle.set_status(status);
            Some(status)
        }
        _ => None,
    }
}

fn replay_driver_log(driver: &DriverId, log: &DriverLog) {
    let vm = log.vm().map(|id| id.get());
    let message = log.message();
    match log.severity() {
        Severity::Error => error!(target: DRIVER_LOG_TARGET, driver = %driver, vm, "{message}"),
        Severity::Warning => warn!(target: DRIVER_LOG_TARGET, driver = %driver, vm, "{message}"),
        Severity::Info => info!(target: DRIVER_LOG_TARGET, driver = %driver, vm, "{message}"),
        Severity::Debug => debug!(target: DRIVER_LOG_TARGET, driver = %driver, vm, "{message}"),
    }
}
