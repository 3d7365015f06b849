//! virt-disk-convert: Convert the disk images of libvirt domains
//!
//! This library converts every file-backed disk of a shut-off domain to a new
//! image format and points the domain configuration at the converted files.
//! A run is all-or-nothing: if any disk fails to convert, the files created
//! so far are removed and the configuration is left untouched.

pub mod backend;
pub mod converter;
pub mod error;
pub mod inventory;
pub mod metadata;
pub mod planner;
pub mod progress;
pub mod rewrite;
pub mod transaction;
pub mod types;

pub use backend::{DomainManager, ImageTool, QemuImgTool, VirshBackend};
pub use error::{Error, Result};
pub use metadata::{MetadataPreserver, MetadataSnapshot, PreserveFlags, UnixMetadata};
pub use progress::{LogProgress, ProgressSink};
pub use transaction::TransactionCoordinator;
pub use types::{
    CleanupWarning, ConversionTask, ConvertOptions, Disk, DiskKind, DomainDescriptor,
    ImageFormat, RunSummary, TaskStatus,
};

/// Parse a user supplied target format
pub fn parse_target_format(format: &str) -> Result<ImageFormat> {
    format
        .parse()
        .map_err(|_| Error::UnsupportedFormat(format.to_string()))
}

/// Plan the conversion of a domain's disks without changing anything
pub fn plan_domain_disks(
    domain_name: &str,
    target_format: &str,
    options: &ConvertOptions,
) -> Result<Vec<ConversionTask>> {
    let target = parse_target_format(target_format)?;
    let manager = VirshBackend::new(options.connection_uri.clone());
    let tool = QemuImgTool::new()?;

    let (_, tasks) = TransactionCoordinator::new(&manager, &tool).plan(domain_name, target, options)?;
    Ok(tasks)
}

/// Convert all disks of `domain_name` to `target_format` using virsh and
/// qemu-img, logging progress when `options.show_progress` is set.
pub fn convert_domain_disks(
    domain_name: &str,
    target_format: &str,
    options: &ConvertOptions,
) -> Result<RunSummary> {
    let target = parse_target_format(target_format)?;
    let manager = VirshBackend::new(options.connection_uri.clone());
    let tool = QemuImgTool::new()?;
    let progress = LogProgress::new();

    TransactionCoordinator::new(&manager, &tool)
        .with_progress(&progress)
        .run(domain_name, target, options)
}
