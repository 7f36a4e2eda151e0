//! Shared configuration for the VM driver layer.
//!
//! [`Config`] is resolved by `ortho_config` from built-in defaults, an
//! optional configuration file, `VMM_*` environment variables, and command
//! line flags, in increasing order of precedence. [`DriverAttributes`] holds
//! the read-only, per-backend defaults a hypervisor driver is configured
//! with; how those are loaded is left to the host process.

mod attributes;
mod defaults;
mod logging;

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use attributes::DriverAttributes;
pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_MS,
    default_log_filter, default_log_filter_string, default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Runtime configuration shared by driver hosts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "VMM")]
pub struct Config {
    /// `tracing` filter expression, e.g. `info,vmm_driver=debug`.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Output format for log records.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Seconds a driver may take to answer before the request times out.
    #[ortho_config(default = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
    /// Milliseconds between housekeeping sweeps of pending requests.
    #[ortho_config(default = DEFAULT_SWEEP_INTERVAL_MS)]
    pub sweep_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Filter expression for the tracing subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Selected log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Deadline budget applied to every submitted command.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Cadence of the housekeeping sweep.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
