//! Collaborator traits and their implementations
//!
//! The conversion core only talks to the hypervisor and to the image tool
//! through these traits, so tests can substitute in-memory fakes.

mod qemu_img;
mod virsh;

pub use qemu_img::{parse_progress, QemuImgConfig, QemuImgTool};
pub use virsh::{VirshBackend, VirshConfig};

use crate::error::Result;
use crate::types::{DomainDescriptor, ImageFormat};
use std::path::Path;

/// Access to the virtualization management layer
pub trait DomainManager {
    /// Fetch the persistent descriptor of a domain
    fn lookup_domain(&self, name: &str) -> Result<DomainDescriptor>;

    /// Check whether a domain is currently active
    fn is_domain_active(&self, name: &str) -> Result<bool>;

    /// Replace a domain's persistent configuration with `descriptor`
    fn define_domain(&self, descriptor: &DomainDescriptor) -> Result<()>;
}

/// One invocation of the external conversion capability
#[derive(Debug, Clone, Copy)]
pub struct ConvertRequest<'a> {
    pub source: &'a Path,
    pub source_format: ImageFormat,
    pub destination: &'a Path,
    pub destination_format: ImageFormat,
}

/// External image probing and conversion
pub trait ImageTool {
    /// Inspect the file contents and report its actual format
    fn probe_format(&self, path: &Path) -> Result<String>;

    /// Write `request.destination` from `request.source`.
    ///
    /// When `progress` is given it receives completion percentages; a tool
    /// that cannot report progress simply never calls it.
    fn convert(
        &self,
        request: &ConvertRequest<'_>,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<()>;
}
