//! Core types for disk conversion

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A disk image format understood by the qemu driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Qcow,
    Cow,
    Qed,
    Vdi,
    Vmdk,
}

impl ImageFormat {
    /// All supported formats
    pub const ALL: [ImageFormat; 7] = [
        ImageFormat::Raw,
        ImageFormat::Qcow2,
        ImageFormat::Qcow,
        ImageFormat::Cow,
        ImageFormat::Qed,
        ImageFormat::Vdi,
        ImageFormat::Vmdk,
    ];

    /// Name used by qemu-img and in the domain descriptor
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Qcow => "qcow",
            ImageFormat::Cow => "cow",
            ImageFormat::Qed => "qed",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Vmdk => "vmdk",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                let names: Vec<&str> = ImageFormat::ALL.iter().map(|f| f.as_str()).collect();
                format!(
                    "Invalid image format '{}'. Must be one of: {}",
                    s,
                    names.join(", ")
                )
            })
    }
}

/// The persisted configuration of a domain, as handed out by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub xml: String,
}

impl DomainDescriptor {
    pub fn new(name: impl Into<String>, xml: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            xml: xml.into(),
        }
    }
}

/// How a disk is backed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskKind {
    /// A plain image file that can be converted
    File(PathBuf),
    /// Anything else (block device, pool volume, network, empty drive, removable media)
    NonConvertible(String),
}

/// One `<disk>` element of a domain descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    /// Position among the descriptor's disk elements
    pub index: usize,
    /// Target device name (e.g. `vda`)
    pub target: String,
    /// Device type (`disk`, `cdrom`, `floppy`, `lun`)
    pub device: String,
    /// `<driver name=...>`, if declared
    pub driver_name: Option<String>,
    /// `<driver type=...>`, if declared
    pub declared_format: Option<String>,
    pub kind: DiskKind,
}

impl Disk {
    /// Source path when the disk is eligible for conversion
    pub fn file_source(&self) -> Option<&Path> {
        match &self.kind {
            DiskKind::File(path) => Some(path),
            DiskKind::NonConvertible(_) => None,
        }
    }
}

/// Status of a single conversion task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Skipped(String),
    Succeeded,
    Failed(String),
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Skipped(reason) => write!(f, "skipped ({})", reason),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed(cause) => write!(f, "failed ({})", cause),
        }
    }
}

/// Planned conversion of one file-backed disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionTask {
    pub disk_index: usize,
    pub target: String,
    pub source: PathBuf,
    pub source_format: ImageFormat,
    pub destination: PathBuf,
    pub destination_format: ImageFormat,
    pub status: TaskStatus,
}

impl ConversionTask {
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, TaskStatus::Skipped(_))
    }
}

impl fmt::Display for ConversionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: [{}]:{} -> [{}]:{}",
            self.target,
            self.source_format,
            self.source.display(),
            self.destination_format,
            self.destination.display()
        )
    }
}

/// Options for a conversion run
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Append the target format as a file name suffix
    pub add_type_extension: bool,
    /// Report conversion progress through the progress sink
    pub show_progress: bool,
    /// Delete original images after the new configuration is committed
    pub remove_old_files: bool,
    /// Copy owner and group of the source image
    pub keep_ownership: bool,
    /// Copy permission bits of the source image
    pub keep_permissions: bool,
    /// Hypervisor connection URI
    pub connection_uri: String,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            add_type_extension: false,
            show_progress: false,
            remove_old_files: false,
            keep_ownership: false,
            keep_permissions: false,
            connection_uri: "qemu:///system".to_string(),
        }
    }
}

/// Non-fatal problem hit while cleaning up files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not remove {}: {}", self.path.display(), self.reason)
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub domain: String,
    pub target_format: ImageFormat,
    pub tasks: Vec<ConversionTask>,
    /// Whether a new configuration was defined
    pub committed: bool,
    pub warnings: Vec<CleanupWarning>,
}

impl RunSummary {
    /// Number of disks that were actually converted
    pub fn converted(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .count()
    }
}
