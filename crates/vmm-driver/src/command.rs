//! Lifecycle commands addressed to a driver.

use std::fmt;

use crate::codec::{self, Verb, WireLine};
use crate::ids::VmId;

/// Subsystem that asked for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The VM lifecycle manager, e.g. a scheduled deployment.
    Lifecycle,
    /// The monitoring cycle that refreshes VM state.
    Monitoring,
    /// An explicit operator request.
    Operator,
}

impl fmt::Display for Origin {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Lifecycle => "lifecycle",
            Self::Monitoring => "monitoring",
            Self::Operator => "operator",
        };
        formatter.write_str(label)
    }
}

/// An immutable command ready to be written to a driver.
///
/// The payload is opaque to this crate: usually a deployment descriptor path
/// or an XML document, already escaped so it holds no newline.
///
/// # Example
///
/// ```
/// use vmm_driver::{Command, Origin, Verb, VmId};
///
/// let command = Command::new(Verb::Migrate, VmId::new(5), "host02");
/// assert_eq!(command.origin(), Origin::Lifecycle);
/// assert_eq!(command.encode().as_str(), "MIGRATE 5 host02\n");
///
/// let poll = Command::new(Verb::Poll, VmId::new(3), "");
/// assert_eq!(poll.origin(), Origin::Monitoring);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    vm: VmId,
    payload: String,
    origin: Origin,
}

impl Command {
    /// Builds a command with the default origin for its verb.
    ///
    /// `POLL` defaults to [`Origin::Monitoring`]; every other verb to
    /// [`Origin::Lifecycle`].
    #[must_use]
    pub fn new(verb: Verb, vm: VmId, payload: impl Into<String>) -> Self {
        let origin = if verb == Verb::Poll {
            Origin::Monitoring
        } else {
            Origin::Lifecycle
        };
        Self {
            verb,
            vm,
            payload: payload.into(),
            origin,
        }
    }

    /// Overrides the issuing subsystem.
    #[must_use]
    pub const fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Verb of the command.
    #[must_use]
    pub const fn verb(&self) -> Verb {
        self.verb
    }

    /// Target VM.
    #[must_use]
    pub const fn vm(&self) -> VmId {
        self.vm
    }

    /// Opaque payload written as the final field.
    #[must_use]
    pub const fn payload(&self) -> &str {
        self.payload.as_str()
    }

    /// Subsystem that issued the command.
    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// Renders the command as a protocol line.
    #[must_use]
    pub fn encode(&self) -> WireLine {
        codec::encode(self.verb, self.vm, &self.payload)
    }
}
