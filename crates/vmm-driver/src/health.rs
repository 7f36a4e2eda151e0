//! Structured health reporting for driver channel events.

use std::sync::Arc;

use crate::codec::Reply;
use crate::ids::DriverId;
use crate::registry::TimedOut;

const HEALTH_TARGET: &str = "vmm_driver::health";

/// Observer trait used to surface driver events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked when a driver channel starts reading.
    fn channel_opened(&self, driver: &DriverId);

    /// Invoked when a driver channel stops reading.
    ///
    /// `error` carries the I/O failure that closed the channel, if any.
    fn channel_closed(&self, driver: &DriverId, error: Option<&str>);

    /// Invoked when a reply matches no outstanding request.
    fn reply_orphaned(&self, driver: &DriverId, reply: &Reply);

    /// Invoked when a request passes its deadline without a reply.
    fn request_timed_out(&self, expired: &TimedOut);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter + ?Sized,
{
    fn channel_opened(&self, driver: &DriverId) {
        (**self).channel_opened(driver);
    }

    fn channel_closed(&self, driver: &DriverId, error: Option<&str>) {
        (**self).channel_closed(driver, error);
    }

    fn reply_orphaned(&self, driver: &DriverId, reply: &Reply) {
        (**self).reply_orphaned(driver, reply);
    }

    fn request_timed_out(&self, expired: &TimedOut) {
        (**self).request_timed_out(expired);
    }
}

/// Default reporter that records events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn channel_opened(&self, driver: &DriverId) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "channel_opened",
            driver = %driver,
            "driver channel open"
        );
    }

    fn channel_closed(&self, driver: &DriverId, error: Option<&str>) {
        if let Some(message) = error {
            tracing::warn!(
                target: HEALTH_TARGET,
                event = "channel_closed",
                driver = %driver,
                error = message,
                "driver channel closed after I/O error"
            );
        } else {
            tracing::info!(
                target: HEALTH_TARGET,
                event = "channel_closed",
                driver = %driver,
                "driver channel closed"
            );
        }
    }

    fn reply_orphaned(&self, driver: &DriverId, reply: &Reply) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "reply_orphaned",
            driver = %driver,
            vm = %reply.vm(),
            verb = %reply.verb(),
            status = %reply.status(),
            "discarding reply with no outstanding request"
        );
    }

    fn request_timed_out(&self, expired: &TimedOut) {
        let request = expired.request();
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "request_timed_out",
            driver = %request.driver(),
            vm = %request.vm(),
            verb = %request.verb(),
            overdue_ms = u64::try_from(expired.overdue().as_millis()).unwrap_or(u64::MAX),
            "driver did not answer before the deadline"
        );
    }
}
