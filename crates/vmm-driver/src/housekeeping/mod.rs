//! Periodic sweep of overdue requests.
//!
//! The housekeeper runs on its own thread so that a stuck driver never
//! delays timeouts for other VMs, and so that reader threads never sweep.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::store::VmStore;

/// Tracing target for housekeeping operations.
const HOUSEKEEPING_TARGET: &str = "vmm_driver::housekeeping";

/// Shortest accepted sweep cadence; shorter intervals are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Errors raised by the housekeeper thread.
#[derive(Debug, Error)]
pub enum HousekeeperError {
    /// The thread could not be started.
    #[error("failed to start housekeeper thread: {source}")]
    Spawn {
        /// Underlying spawn error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The thread panicked.
    #[error("housekeeper thread panicked")]
    ThreadPanic,
}

/// Starts periodic sweeps over a shared dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct Housekeeper {
    interval: Duration,
}

impl Housekeeper {
    /// Builds a housekeeper that sweeps every `interval`, but no more often
    /// than [`MIN_SWEEP_INTERVAL`].
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        if interval.as_nanos() < MIN_SWEEP_INTERVAL.as_nanos() {
            Self {
                interval: MIN_SWEEP_INTERVAL,
            }
        } else {
            Self { interval }
        }
    }

    /// Sweep cadence.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the sweep thread.
    ///
    /// # Errors
    ///
    /// Returns [`HousekeeperError::Spawn`] when the thread cannot start.
    pub fn start<S>(
        self,
        dispatcher: Arc<Dispatcher<S>>,
    ) -> Result<HousekeeperHandle, HousekeeperError>
    where
        S: VmStore + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name(String::from("vmm-housekeeper"))
            .spawn(move || run_sweep_loop(&dispatcher, interval, &shutdown_flag))
            .map_err(|source| HousekeeperError::Spawn {
                source: Arc::new(source),
            })?;
        Ok(HousekeeperHandle {
            shutdown,
            handle: Some(handle),
        })
    }
}

/// Handle to the background housekeeper thread.
#[derive(Debug)]
pub struct HousekeeperHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HousekeeperHandle {
    /// Asks the thread to stop after its current sweep.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
    }

    /// Stops the thread and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`HousekeeperError::ThreadPanic`] if the thread panicked.
    pub fn join(mut self) -> Result<(), HousekeeperError> {
        self.shutdown();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| HousekeeperError::ThreadPanic),
            None => Ok(()),
        }
    }
}

impl Drop for HousekeeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_sweep_loop<S>(dispatcher: &Dispatcher<S>, interval: Duration, shutdown: &AtomicBool)
where
    S: VmStore,
{
    info!(
        target: HOUSEKEEPING_TARGET,
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "housekeeper active"
    );
    while !shutdown.load(Ordering::SeqCst) {
        let expired = dispatcher.sweep(Instant::now());
        if !expired.is_empty() {
            debug!(
                target: HOUSEKEEPING_TARGET,
                expired = expired.len(),
                "swept overdue requests"
            );
        }
        // Woken early by `shutdown`; spurious wake-ups only cause an extra sweep.
        thread::park_timeout(interval);
    }
}
