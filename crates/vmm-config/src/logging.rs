use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Output shape of driver-layer log records.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One flattened JSON object per event, for log shippers.
    #[default]
    Json,
    /// One line per event with the target and fields inline.
    Compact,
    /// Multi-line records for reading a single driver session by hand.
    Pretty,
}

impl LogFormat {
    /// Returns `true` when records are meant for machines rather than people.
    ///
    /// Machine-readable output never carries ANSI colour codes.
    #[must_use]
    pub const fn is_machine_readable(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Error returned when a log format name is not recognised.
pub type LogFormatParseError = strum::ParseError;
