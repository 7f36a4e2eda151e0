use crate::logging::LogFormat;

/// Default log filter expression used by driver hosts.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Seconds a driver may take to answer a command before it is timed out.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 90;

/// Milliseconds between two housekeeping sweeps of the request registry.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Default log filter expression used by driver hosts.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}
