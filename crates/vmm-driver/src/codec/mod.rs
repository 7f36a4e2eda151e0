//! Line codec for the driver protocol.
//!
//! Every message is one newline-terminated ASCII line. Commands flow to the
//! driver as `<VERB> <vm-id> <payload>`; replies flow back as
//! `<VERB> <vm-id> SUCCESS|FAILURE [<data>]`. The payload or data is always
//! the final field and runs to the end of the line. Drivers may also emit
//! `LOG <vm-id|-> <I|W|E|D> <text>` lines, which carry diagnostics only.
//!
//! The codec holds no state. Decoding is tolerant: each failure is reported
//! as a [`CodecError`] so the caller can drop the line and keep reading.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::ids::VmId;

/// Keyword introducing a driver diagnostic line.
pub const LOG_KEYWORD: &str = "LOG";

/// Longest line accepted from a driver, terminator included.
///
/// Longer lines are discarded as [`CodecError::TooLong`].
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Placeholder used in `LOG` lines that concern no particular VM.
const NO_VM: &str = "-";

/// Lifecycle action understood by every driver.
///
/// # Example
///
/// ```
/// use vmm_driver::Verb;
///
/// assert_eq!(Verb::SnapshotCreate.as_str(), "SNAPSHOTCREATE");
/// assert_eq!("ATTACHNIC".parse::<Verb>().ok(), Some(Verb::AttachNic));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Boot a VM from its deployment descriptor.
    Deploy,
    /// Gracefully shut a VM down.
    Shutdown,
    /// Hard-reset a running VM.
    Reset,
    /// Reboot a running VM through the guest.
    Reboot,
    /// Destroy a VM without asking the guest.
    Cancel,
    /// Remove leftovers of a VM from the host.
    Cleanup,
    /// Checkpoint a running VM.
    Checkpoint,
    /// Save VM memory to disk and stop it.
    Save,
    /// Resume a VM from a saved image.
    Restore,
    /// Move a running VM to another host.
    Migrate,
    /// Collect monitoring data for a VM.
    Poll,
    /// Hot-plug a disk.
    AttachDisk,
    /// Hot-unplug a disk.
    DetachDisk,
    /// Hot-plug a network interface.
    AttachNic,
    /// Hot-unplug a network interface.
    DetachNic,
    /// Take a hypervisor snapshot.
    SnapshotCreate,
    /// Revert to a hypervisor snapshot.
    SnapshotRevert,
    /// Delete a hypervisor snapshot.
    SnapshotDelete,
}

impl Verb {
    /// Every verb, in protocol order.
    pub const ALL: [Self; 18] = [
        Self::Deploy,
        Self::Shutdown,
        Self::Reset,
        Self::Reboot,
        Self::Cancel,
        Self::Cleanup,
        Self::Checkpoint,
        Self::Save,
        Self::Restore,
        Self::Migrate,
        Self::Poll,
        Self::AttachDisk,
        Self::DetachDisk,
        Self::AttachNic,
        Self::DetachNic,
        Self::SnapshotCreate,
        Self::SnapshotRevert,
        Self::SnapshotDelete,
    ];

    /// Returns the wire token for the verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "DEPLOY",
            Self::Shutdown => "SHUTDOWN",
            Self::Reset => "RESET",
            Self::Reboot => "REBOOT",
            Self::Cancel => "CANCEL",
            Self::Cleanup => "CLEANUP",
            Self::Checkpoint => "CHECKPOINT",
            Self::Save => "SAVE",
            Self::Restore => "RESTORE",
            Self::Migrate => "MIGRATE",
            Self::Poll => "POLL",
            Self::AttachDisk => "ATTACHDISK",
            Self::DetachDisk => "DETACHDISK",
            Self::AttachNic => "ATTACHNIC",
            Self::DetachNic => "DETACHNIC",
            Self::SnapshotCreate => "SNAPSHOTCREATE",
            Self::SnapshotRevert => "SNAPSHOTREVERT",
            Self::SnapshotDelete => "SNAPSHOTDELETE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a token names no known verb.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown verb: {0}")]
pub struct VerbParseError(String);

impl VerbParseError {
    /// Returns the token that could not be parsed.
    #[must_use]
    pub fn token(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for Verb {
    type Err = VerbParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|verb| verb.as_str() == token)
            .ok_or_else(|| VerbParseError(token.to_owned()))
    }
}

/// Terminal result reported by a driver for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    /// The driver carried out the command.
    Success,
    /// The driver could not carry out the command.
    Failure,
}

impl ReplyStatus {
    /// Returns the wire token for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding a line read from a driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The line holds bytes outside UTF-8.
    #[error("line is not valid text")]
    NotText,

    /// A mandatory field is missing.
    #[error("line is truncated: missing {field}")]
    Truncated {
        /// Name of the first missing field.
        field: &'static str,
    },

    /// The id field is not a VM number.
    #[error("malformed VM id '{token}'")]
    MalformedId {
        /// Offending id token.
        token: String,
    },

    /// The first field names no known verb.
    #[error("unknown verb '{token}'")]
    UnknownVerb {
        /// Offending verb token.
        token: String,
    },

    /// The line exceeds [`MAX_LINE_BYTES`] and was discarded unread.
    #[error("line exceeds {limit} bytes")]
    TooLong {
        /// Limit that was exceeded.
        limit: usize,
    },

    /// The status field is neither `SUCCESS` nor `FAILURE`.
    #[error("unknown reply status '{token}'")]
    UnknownStatus {
        /// Offending status token.
        token: String,
    },
}

/// A complete protocol line, newline included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireLine(String);

impl WireLine {
    /// Returns the line as text.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the line as bytes ready for writing.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for WireLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.trim_end())
    }
}

/// Encodes a command line for a driver.
///
/// The payload is written verbatim as the final field; callers escape any
/// embedded newline before it reaches the codec.
///
/// # Example
///
/// ```
/// use vmm_driver::{Verb, VmId, codec};
///
/// let line = codec::encode(Verb::Deploy, VmId::new(7), "<VM/>");
/// assert_eq!(line.as_str(), "DEPLOY 7 <VM/>\n");
/// ```
#[must_use]
pub fn encode(verb: Verb, vm: VmId, payload: &str) -> WireLine {
    WireLine(format!("{verb} {vm} {payload}\n"))
}

/// Structural fields of a protocol line.
///
/// `args` is everything after the separator that follows the id, up to the
/// line terminator, byte for byte. For commands it is the payload; for replies
/// it starts with the status token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    verb: Verb,
    vm: VmId,
    args: String,
}

impl DecodedLine {
    /// Verb named by the line.
    #[must_use]
    pub const fn verb(&self) -> Verb {
        self.verb
    }

    /// VM the line refers to.
    #[must_use]
    pub const fn vm(&self) -> VmId {
        self.vm
    }

    /// Trailing argument string.
    #[must_use]
    pub const fn args(&self) -> &str {
        self.args.as_str()
    }

    /// Interprets the arguments as a reply status followed by data.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] when no status is present and
    /// [`CodecError::UnknownStatus`] when the status token is not recognised.
    pub fn into_reply(self) -> Result<Reply, CodecError> {
        let (token, data) = next_field(&self.args).ok_or(CodecError::Truncated { field: "status" })?;
        let status = ReplyStatus::from_token(token).ok_or_else(|| CodecError::UnknownStatus {
            token: token.to_owned(),
        })?;
        Ok(Reply {
            verb: self.verb,
            vm: self.vm,
            status,
            data: data.to_owned(),
        })
    }
}

/// Answer from a driver to a previously written command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    verb: Verb,
    vm: VmId,
    status: ReplyStatus,
    data: String,
}

impl Reply {
    /// Builds a reply, mainly for tests and driver simulators.
    #[must_use]
    pub fn new(verb: Verb, vm: VmId, status: ReplyStatus, data: impl Into<String>) -> Self {
        Self {
            verb,
            vm,
            status,
            data: data.into(),
        }
    }

    /// Verb of the command being answered.
    #[must_use]
    pub const fn verb(&self) -> Verb {
        self.verb
    }

    /// VM the command addressed.
    #[must_use]
    pub const fn vm(&self) -> VmId {
        self.vm
    }

    /// Terminal status reported by the driver.
    #[must_use]
    pub const fn status(&self) -> ReplyStatus {
        self.status
    }

    /// Data after the status: monitoring payload, deploy id, or error text.
    #[must_use]
    pub const fn data(&self) -> &str {
        self.data.as_str()
    }
}

/// Severity attached to a driver `LOG` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational message (`I`).
    Info,
    /// Warning (`W`).
    Warning,
    /// Error (`E`).
    Error,
    /// Debug detail (`D`).
    Debug,
}

impl Severity {
    fn from_token(token: &str) -> Self {
        match token {
            "E" => Self::Error,
            "W" => Self::Warning,
            "D" => Self::Debug,
            _ => Self::Info,
        }
    }
}

/// Diagnostic line emitted by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverLog {
    vm: Option<VmId>,
    severity: Severity,
    message: String,
}

impl DriverLog {
    /// VM the message concerns, if any.
    #[must_use]
    pub const fn vm(&self) -> Option<VmId> {
        self.vm
    }

    /// Severity chosen by the driver.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.severity
    }

    /// Message text.
    #[must_use]
    pub const fn message(&self) -> &str {
        self.message.as_str()
    }
}

/// Message read from a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverMessage {
    /// Terminal answer to a command.
    Reply(Reply),
    /// Diagnostic output.
    Log(DriverLog),
}

/// Splits a raw line into its structural fields.
///
/// # Errors
///
/// Returns [`CodecError::NotText`] for non UTF-8 input,
/// [`CodecError::Truncated`] when the verb or id is missing,
/// [`CodecError::UnknownVerb`] for an unrecognised verb, and
/// [`CodecError::MalformedId`] when the id is not a VM number.
pub fn decode(raw: &[u8]) -> Result<DecodedLine, CodecError> {
    let text = line_text(raw)?;
    let (verb_token, rest) = next_field(text).ok_or(CodecError::Truncated { field: "verb" })?;
    let verb = verb_token
        .parse::<Verb>()
        .map_err(|error| CodecError::UnknownVerb {
            token: error.token().to_owned(),
        })?;
    let (vm, args) = decode_id(rest)?;
    Ok(DecodedLine {
        verb,
        vm,
        args: args.to_owned(),
    })
}

/// Decodes a line read from a driver into a reply or a diagnostic.
///
/// # Errors
///
/// Propagates every [`decode`] error, plus the reply errors described on
/// [`DecodedLine::into_reply`].
///
/// # Example
///
/// ```
/// use vmm_driver::codec::{self, DriverMessage, ReplyStatus};
///
/// let message = codec::decode_message(b"POLL 3 SUCCESS CPU=45\n").expect("valid reply");
/// let DriverMessage::Reply(reply) = message else {
///     panic!("expected a reply");
/// };
/// assert_eq!(reply.status(), ReplyStatus::Success);
/// assert_eq!(reply.data(), "CPU=45");
/// ```
pub fn decode_message(raw: &[u8]) -> Result<DriverMessage, CodecError> {
    let text = line_text(raw)?;
    match next_field(text) {
        Some((LOG_KEYWORD, rest)) => decode_log(rest).map(DriverMessage::Log),
        _ => decode(raw)?.into_reply().map(DriverMessage::Reply),
    }
}

fn decode_log(rest: &str) -> Result<DriverLog, CodecError> {
    let (id_token, after_id) = next_field(rest).ok_or(CodecError::Truncated { field: "id" })?;
    let vm = if id_token == NO_VM {
        None
    } else {
        Some(parse_id(id_token)?)
    };
    let (severity_token, message) =
        next_field(after_id).ok_or(CodecError::Truncated { field: "severity" })?;
    Ok(DriverLog {
        vm,
        severity: Severity::from_token(severity_token),
        message: message.to_owned(),
    })
}

fn decode_id(rest: &str) -> Result<(VmId, &str), CodecError> {
    let (token, args) = next_field(rest).ok_or(CodecError::Truncated { field: "id" })?;
    Ok((parse_id(token)?, args))
}

fn parse_id(token: &str) -> Result<VmId, CodecError> {
    token.parse().map_err(|_| CodecError::MalformedId {
        token: token.to_owned(),
    })
}

/// Strips one `\n` or `\r\n` terminator and nothing else.
fn line_text(raw: &[u8]) -> Result<&str, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotText)?;
    let unterminated = text.strip_suffix('\n').unwrap_or(text);
    Ok(unterminated.strip_suffix('\r').unwrap_or(unterminated))
}

/// Returns the next whitespace-delimited token and everything after the
/// single separator that ends it.
///
/// The remainder is not trimmed: the final field is opaque.
fn next_field(text: &str) -> Option<(&str, &str)> {
    let start = text.trim_start();
    if start.is_empty() {
        return None;
    }
    match start.split_once(char::is_whitespace) {
        Some((token, rest)) => Some((token, rest)),
        None => Some((start, "")),
    }
}
