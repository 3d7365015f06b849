//! Per-disk conversion planning

use crate::backend::ImageTool;
use crate::error::{Error, Result};
use crate::types::{ConversionTask, Disk, ImageFormat, TaskStatus};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The only disk driver whose images can be converted
const SUPPORTED_DRIVER: &str = "qemu";

/// Infix marking a converted image when no type extension is requested
const CONVERTED_MARKER: &str = "converted";

/// Compute where the converted image for `source` is written.
///
/// With `add_type_extension` the format name is appended to the file name
/// (`disk.img` -> `disk.img.qcow2`); otherwise a `converted` marker is
/// placed before the extension (`disk.img` -> `disk.converted.img`).
pub fn destination_path(
    source: &Path,
    format: ImageFormat,
    add_type_extension: bool,
) -> Result<PathBuf> {
    let file_name = source.file_name().ok_or_else(|| {
        Error::Planning(format!("'{}' does not name a file", source.display()))
    })?;

    let mut name = OsString::new();
    if add_type_extension {
        name.push(file_name);
        name.push(".");
        name.push(format.as_str());
    } else {
        name.push(source.file_stem().unwrap_or(file_name));
        name.push(".");
        name.push(CONVERTED_MARKER);
        if let Some(ext) = source.extension() {
            name.push(".");
            name.push(ext);
        }
    }

    Ok(source.with_file_name(name))
}

/// Decides, for every file-backed disk, whether and where to convert it
pub struct ConversionPlanner<'a, T: ImageTool + ?Sized> {
    tool: &'a T,
    target: ImageFormat,
    add_type_extension: bool,
}

impl<'a, T: ImageTool + ?Sized> ConversionPlanner<'a, T> {
    pub fn new(tool: &'a T, target: ImageFormat, add_type_extension: bool) -> Self {
        Self {
            tool,
            target,
            add_type_extension,
        }
    }

    /// Plan all disks. Non-convertible disks produce no task.
    ///
    /// Nothing on disk is modified; any error means no task list at all.
    pub fn plan(&self, disks: &[Disk]) -> Result<Vec<ConversionTask>> {
        let inventoried: HashSet<&Path> = disks.iter().filter_map(|d| d.file_source()).collect();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut tasks = Vec::new();

        for disk in disks {
            let Some(source) = disk.file_source() else {
                debug!(disk = %disk.target, "not file backed, leaving untouched");
                continue;
            };

            let task = self.plan_disk(disk, source, &inventoried)?;
            if task.is_pending() && !claimed.insert(task.destination.clone()) {
                return Err(Error::Planning(format!(
                    "disk {} would be written to {}, which another disk also targets",
                    disk.target,
                    task.destination.display()
                )));
            }
            tasks.push(task);
        }

        Ok(tasks)
    }

    fn plan_disk(
        &self,
        disk: &Disk,
        source: &Path,
        inventoried: &HashSet<&Path>,
    ) -> Result<ConversionTask> {
        if let Some(driver) = disk.driver_name.as_deref() {
            if driver != SUPPORTED_DRIVER {
                return Err(Error::Planning(format!(
                    "disk {} uses driver '{}', only '{}' is supported",
                    disk.target, driver, SUPPORTED_DRIVER
                )));
            }
        }

        let probed = self.tool.probe_format(source)?;
        let source_format: ImageFormat = probed.parse().map_err(|_| {
            Error::Planning(format!(
                "disk {} ({}) has unsupported format '{}'",
                disk.target,
                source.display(),
                probed
            ))
        })?;

        if let Some(declared) = disk.declared_format.as_deref() {
            if declared != source_format.as_str() {
                warn!(
                    disk = %disk.target,
                    declared,
                    probed = %source_format,
                    "declared image format differs from file contents, using probed format"
                );
            }
        }

        if source_format == self.target {
            return Ok(ConversionTask {
                disk_index: disk.index,
                target: disk.target.clone(),
                source: source.to_path_buf(),
                source_format,
                destination: source.to_path_buf(),
                destination_format: self.target,
                status: TaskStatus::Skipped("already target format".to_string()),
            });
        }

        let destination = destination_path(source, self.target, self.add_type_extension)?;
        if inventoried.contains(destination.as_path()) {
            return Err(Error::Planning(format!(
                "destination {} of disk {} is already used by another disk",
                destination.display(),
                disk.target
            )));
        }
        if destination.symlink_metadata().is_ok() {
            return Err(Error::Planning(format!(
                "destination {} of disk {} already exists",
                destination.display(),
                disk.target
            )));
        }

        Ok(ConversionTask {
            disk_index: disk.index,
            target: disk.target.clone(),
            source: source.to_path_buf(),
            source_format,
            destination,
            destination_format: self.target,
            status: TaskStatus::Pending,
        })
    }
}
