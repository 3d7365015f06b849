//! All-or-nothing conversion of a domain's disks
//!
//! A run moves through `Planning -> Converting -> Committing -> Done`, or
//! through `RollingBack` when a conversion or the commit fails. Which files
//! exist because of the run is tracked in a [`TransactionLedger`], and
//! cleanup is driven only by that ledger.
//!
//! The domain configuration is defined at most once, after every task has
//! either succeeded or been skipped. Original images are removed only after
//! that define was accepted.

use crate::backend::{DomainManager, ImageTool};
use crate::converter::ImageConverter;
use crate::error::{Error, Result};
use crate::inventory::DiskInventory;
use crate::metadata::{MetadataPreserver, PreserveFlags, UnixMetadata};
use crate::planner::ConversionPlanner;
use crate::progress::ProgressSink;
use crate::rewrite::DomainConfigRewriter;
use crate::types::{
    CleanupWarning, ConversionTask, ConvertOptions, Disk, DomainDescriptor, ImageFormat,
    RunSummary, TaskStatus,
};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Phase of a conversion run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Planning,
    Converting,
    Committing,
    RollingBack,
    Done { success: bool },
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Planning => write!(f, "planning"),
            RunState::Converting => write!(f, "converting"),
            RunState::Committing => write!(f, "committing"),
            RunState::RollingBack => write!(f, "rolling back"),
            RunState::Done { success: true } => write!(f, "done"),
            RunState::Done { success: false } => write!(f, "failed"),
        }
    }
}

/// Task outcomes and files created during one run
#[derive(Debug, Clone, Default)]
pub struct TransactionLedger {
    tasks: Vec<ConversionTask>,
    created: Vec<PathBuf>,
}

impl TransactionLedger {
    pub fn new(tasks: Vec<ConversionTask>) -> Self {
        Self {
            tasks,
            created: Vec::new(),
        }
    }

    pub fn tasks(&self) -> &[ConversionTask] {
        &self.tasks
    }

    /// Destination files written by this run, in creation order
    pub fn created(&self) -> &[PathBuf] {
        &self.created
    }

    /// Every task ended as `Succeeded` or `Skipped`
    pub fn is_complete(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Succeeded | TaskStatus::Skipped(_)))
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.iter().any(ConversionTask::is_pending)
    }

    pub fn into_tasks(self) -> Vec<ConversionTask> {
        self.tasks
    }
}

/// Remove `path`, turning a failure into a warning
fn remove_file(path: &Path) -> Option<CleanupWarning> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            None
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cleanup failed");
            Some(CleanupWarning {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    }
}

/// Delete every destination file the run created, newest first
pub fn roll_back(ledger: &TransactionLedger) -> Vec<CleanupWarning> {
    ledger
        .created
        .iter()
        .rev()
        .filter_map(|path| remove_file(path))
        .collect()
}

/// Delete the original image of every converted disk
pub fn remove_originals(ledger: &TransactionLedger) -> Vec<CleanupWarning> {
    ledger
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Succeeded && t.source != t.destination)
        .filter_map(|t| {
            info!(disk = %t.target, path = %t.source.display(), "removing original image");
            remove_file(&t.source)
        })
        .collect()
}

/// Drives one conversion run for one domain
pub struct TransactionCoordinator<'a, M, T>
where
    M: DomainManager + ?Sized,
    T: ImageTool + ?Sized,
{
    manager: &'a M,
    tool: &'a T,
    progress: Option<&'a dyn ProgressSink>,
    metadata: &'a dyn MetadataPreserver,
}

impl<'a, M, T> TransactionCoordinator<'a, M, T>
where
    M: DomainManager + ?Sized,
    T: ImageTool + ?Sized,
{
    pub fn new(manager: &'a M, tool: &'a T) -> Self {
        Self {
            manager,
            tool,
            progress: None,
            metadata: &UnixMetadata,
        }
    }

    /// Sink used when `ConvertOptions::show_progress` is set
    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Replace the filesystem used to preserve ownership and permissions
    pub fn with_metadata(mut self, metadata: &'a dyn MetadataPreserver) -> Self {
        self.metadata = metadata;
        self
    }

    fn enter(&self, domain: &str, state: RunState) {
        debug!(domain, %state, "run state");
    }

    /// Look up the domain and plan every disk without touching any file
    pub fn plan(
        &self,
        domain: &str,
        target: ImageFormat,
        options: &ConvertOptions,
    ) -> Result<(DomainDescriptor, Vec<ConversionTask>)> {
        let descriptor = self.manager.lookup_domain(domain)?;
        if self.manager.is_domain_active(domain)? {
            return Err(Error::DomainRunning(domain.to_string()));
        }

        let disks: Vec<Disk> = DiskInventory::new(&descriptor).collect::<Result<_>>()?;
        debug!(domain, disks = disks.len(), "inventoried disks");

        let tasks = ConversionPlanner::new(self.tool, target, options.add_type_extension)
            .plan(&disks)?;
        Ok((descriptor, tasks))
    }

    /// Convert every disk of `domain` to `target` and commit the new
    /// configuration, or leave the domain exactly as it was.
    pub fn run(
        &self,
        domain: &str,
        target: ImageFormat,
        options: &ConvertOptions,
    ) -> Result<RunSummary> {
        self.enter(domain, RunState::Planning);
        let (descriptor, tasks) = match self.plan(domain, target, options) {
            Ok(planned) => planned,
            Err(e) => {
                self.enter(domain, RunState::Done { success: false });
                return Err(e);
            }
        };
        let mut ledger = TransactionLedger::new(tasks);

        if !ledger.has_pending() {
            info!(domain, "no disk needs conversion");
            self.enter(domain, RunState::Done { success: true });
            return Ok(RunSummary {
                domain: domain.to_string(),
                target_format: target,
                tasks: ledger.into_tasks(),
                committed: false,
                warnings: Vec::new(),
            });
        }

        self.enter(domain, RunState::Converting);
        if let Err(e) = self.convert_all(&mut ledger, options) {
            self.abort(domain, &ledger);
            return Err(e);
        }

        self.enter(domain, RunState::Committing);
        debug_assert!(ledger.is_complete());
        if let Err(e) = DomainConfigRewriter::new(self.manager).commit(&descriptor, ledger.tasks()) {
            self.abort(domain, &ledger);
            return Err(e);
        }

        let warnings = if options.remove_old_files {
            remove_originals(&ledger)
        } else {
            Vec::new()
        };

        self.enter(domain, RunState::Done { success: true });
        Ok(RunSummary {
            domain: domain.to_string(),
            target_format: target,
            tasks: ledger.into_tasks(),
            committed: true,
            warnings,
        })
    }

    /// Roll back after a failure before commit
    fn abort(&self, domain: &str, ledger: &TransactionLedger) {
        self.enter(domain, RunState::RollingBack);
        let warnings = roll_back(ledger);
        if !warnings.is_empty() {
            warn!(domain, stray = warnings.len(), "some converted images could not be removed");
        }
        self.enter(domain, RunState::Done { success: false });
    }

    /// Convert pending tasks in order, stopping at the first failure
    fn convert_all(&self, ledger: &mut TransactionLedger, options: &ConvertOptions) -> Result<()> {
        let flags = PreserveFlags {
            keep_ownership: options.keep_ownership,
            keep_permissions: options.keep_permissions,
        };
        let converter = match self.progress {
            Some(sink) if options.show_progress => ImageConverter::new(self.tool).with_progress(sink),
            _ => ImageConverter::new(self.tool),
        };

        for index in 0..ledger.tasks.len() {
            let task = &ledger.tasks[index];
            if !task.is_pending() {
                debug!(disk = %task.target, status = %task.status, "nothing to do");
                continue;
            }

            let result = convert_task(&converter, self.metadata, task, flags, &mut ledger.created);
            let task = &mut ledger.tasks[index];
            match result {
                Ok(()) => {
                    info!(disk = %task.target, path = %task.destination.display(), "converted");
                    task.status = TaskStatus::Succeeded;
                }
                Err(e) => {
                    warn!(disk = %task.target, error = %e, "conversion failed, aborting run");
                    task.status = TaskStatus::Failed(e.to_string());
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Convert one task and reapply the source metadata to its output
fn convert_task<T: ImageTool + ?Sized>(
    converter: &ImageConverter<'_, T>,
    metadata: &dyn MetadataPreserver,
    task: &ConversionTask,
    flags: PreserveFlags,
    created: &mut Vec<PathBuf>,
) -> Result<()> {
    let snapshot = if flags.any() {
        Some(metadata.capture(&task.source)?)
    } else {
        None
    };

    converter.convert(task)?;
    created.push(task.destination.clone());

    if let Some(snapshot) = snapshot {
        metadata.apply(&snapshot, &task.destination, flags)?;
    }
    Ok(())
}
