//! Parser for the monitoring data returned by `POLL` replies.
//!
//! The payload is a whitespace-separated list of `KEY=VALUE` tokens. The keys
//! `CPU`, `MEMORY`, `NETTX`, `NETRX`, and `STATE` fill the fixed fields of a
//! [`MonitoringRecord`]; any other key is kept verbatim in
//! [`MonitoringRecord::custom`]. A bad numeric value only zeroes that metric,
//! so one broken probe never discards the whole update.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

/// Tracing target for monitoring parser diagnostics.
const MONITORING_TARGET: &str = "vmm_driver::monitoring";

/// State code used when the driver reports no `STATE`.
pub const UNKNOWN_STATE: char = '-';

/// Live resource usage and hypervisor state of a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringRecord {
    /// CPU usage in percent of one core.
    pub cpu: u32,
    /// Memory in use, in kilobytes.
    pub memory_kb: u64,
    /// Bytes transmitted over all interfaces.
    pub net_tx: u64,
    /// Bytes received over all interfaces.
    pub net_rx: u64,
    /// Single-character hypervisor state, [`UNKNOWN_STATE`] when absent.
    pub state: char,
    /// Keys the driver reported beyond the fixed fields.
    pub custom: HashMap<String, String>,
}

impl Default for MonitoringRecord {
    fn default() -> Self {
        Self {
            cpu: 0,
            memory_kb: 0,
            net_tx: 0,
            net_rx: 0,
            state: UNKNOWN_STATE,
            custom: HashMap::new(),
        }
    }
}

impl MonitoringRecord {
    /// Returns `true` when the driver reported a state.
    #[must_use]
    pub const fn has_state(&self) -> bool {
        self.state != UNKNOWN_STATE
    }
}

/// Errors raised while parsing a monitoring payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A token is not a `KEY=VALUE` pair.
    #[error("unparseable monitoring token '{token}'")]
    Unparseable {
        /// Offending token.
        token: String,
    },
}

/// Parses a raw poll payload.
///
/// # Errors
///
/// Returns [`ParseError::Unparseable`] when a token has no `=` or an empty
/// key. Callers treat that as "no update", never as a VM failure.
///
/// # Example
///
/// ```
/// use vmm_driver::monitoring;
///
/// let record = monitoring::parse("CPU=45 MEMORY=204800 STATE=a GUEST_IP=10.0.0.4")
///     .expect("payload parses");
/// assert_eq!(record.cpu, 45);
/// assert_eq!(record.memory_kb, 204_800);
/// assert_eq!(record.state, 'a');
/// assert_eq!(record.custom.get("GUEST_IP").map(String::as_str), Some("10.0.0.4"));
/// ```
pub fn parse(raw: &str) -> Result<MonitoringRecord, ParseError> {
    let mut record = MonitoringRecord::default();

    for token in raw.split_whitespace() {
        let (key, value) = split_pair(token)?;
        match key {
            "CPU" => record.cpu = numeric(key, value),
            "MEMORY" => record.memory_kb = numeric(key, value),
            "NETTX" => record.net_tx = numeric(key, value),
            "NETRX" => record.net_rx = numeric(key, value),
            "STATE" => record.state = state_code(value),
            _ => {
                record.custom.insert(key.to_owned(), value.to_owned());
            }
        }
    }

    Ok(record)
}

fn split_pair(token: &str) -> Result<(&str, &str), ParseError> {
    match token.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(ParseError::Unparseable {
            token: token.to_owned(),
        }),
    }
}

fn numeric<T>(key: &str, value: &str) -> T
where
    T: std::str::FromStr + Default,
{
    value.parse().unwrap_or_else(|_| {
        debug!(
            target: MONITORING_TARGET,
            key,
            value,
            "non-numeric metric, defaulting to zero"
        );
        T::default()
    })
}

fn state_code(value: &str) -> char {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(code), None) => code,
        _ => {
            debug!(
                target: MONITORING_TARGET,
                value,
                "state is not a single character, treating as unknown"
            );
            UNKNOWN_STATE
        }
    }
}
