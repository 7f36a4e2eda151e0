//! Hypervisor-specific deployment descriptor capability.
//!
//! Each backend (KVM, Xen, ...) renders its own descriptor file before a VM
//! is deployed. The façade receives the generator as a trait object when it
//! is built; this crate never renders descriptors itself.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ids::VmId;

/// Renders a backend-specific deployment descriptor for a VM.
pub trait DescriptorGenerator: Send + Sync {
    /// Writes the descriptor for `vm` to `output`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] when the descriptor cannot be produced or
    /// written.
    fn generate(&self, vm: VmId, output: &Path) -> Result<(), DescriptorError>;
}

/// Error raised when a deployment descriptor cannot be generated.
#[derive(Debug, Error)]
#[error("failed to generate deployment descriptor for VM {vm}: {message}")]
pub struct DescriptorError {
    /// VM whose descriptor failed.
    pub vm: VmId,
    message: String,
    /// Optional source error reported by the backend.
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DescriptorError {
    /// Builds an error without an underlying source.
    #[must_use]
    pub fn new(vm: VmId, message: impl Into<String>) -> Self {
        Self {
            vm,
            message: message.into(),
            source: None,
        }
    }

    /// Builds an error that wraps an underlying source.
    #[must_use]
    pub fn with_source(
        vm: VmId,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            vm,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Human-readable message describing the failure.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

/// Returns the descriptor path for `vm` inside `directory`.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use vmm_driver::{VmId, descriptor};
///
/// let path = descriptor::descriptor_path(Path::new("/var/lib/one/vms/7"), VmId::new(7));
/// assert_eq!(path, Path::new("/var/lib/one/vms/7/deployment.7"));
/// ```
#[must_use]
pub fn descriptor_path(directory: &Path, vm: VmId) -> PathBuf {
    directory.join(format!("deployment.{vm}"))
}
