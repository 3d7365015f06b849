//! Conversion of a single disk image

use crate::backend::{ConvertRequest, ImageTool};
use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::types::ConversionTask;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Runs the external conversion for one pending task and checks its output
pub struct ImageConverter<'a, T: ImageTool + ?Sized> {
    tool: &'a T,
    progress: Option<&'a dyn ProgressSink>,
}

impl<'a, T: ImageTool + ?Sized> ImageConverter<'a, T> {
    pub fn new(tool: &'a T) -> Self {
        Self {
            tool,
            progress: None,
        }
    }

    /// Report progress of every conversion to `sink`
    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Convert `task.source` into `task.destination`.
    ///
    /// On any failure the destination file is removed before returning.
    pub fn convert(&self, task: &ConversionTask) -> Result<()> {
        if !task.is_pending() {
            return Err(Error::ConversionFailed {
                disk: task.target.clone(),
                cause: format!("task is {}, not pending", task.status),
            });
        }

        let request = ConvertRequest {
            source: &task.source,
            source_format: task.source_format,
            destination: &task.destination,
            destination_format: task.destination_format,
        };

        let outcome = self
            .run_tool(&task.target, &request)
            .map_err(|e| Error::ConversionFailed {
                disk: task.target.clone(),
                cause: e.to_string(),
            })
            .and_then(|()| verify_output(task));

        if outcome.is_err() {
            discard(&task.destination);
        }
        outcome
    }

    fn run_tool(&self, disk: &str, request: &ConvertRequest<'_>) -> Result<()> {
        let Some(sink) = self.progress else {
            return self.tool.convert(request, None);
        };

        sink.start(disk);
        let mut report = |percent: f32| sink.update(disk, percent);
        let result = self.tool.convert(request, Some(&mut report));
        sink.finish(disk);
        result
    }
}

/// The tool claimed success; make sure something non-empty was written
fn verify_output(task: &ConversionTask) -> Result<()> {
    let failure = |reason: String| Error::ConversionVerification {
        disk: task.target.clone(),
        path: task.destination.clone(),
        reason,
    };

    match fs::metadata(&task.destination) {
        Ok(meta) if !meta.is_file() => Err(failure("not a regular file".to_string())),
        Ok(meta) if meta.len() == 0 => Err(failure("output is empty".to_string())),
        Ok(_) => Ok(()),
        Err(e) => Err(failure(e.to_string())),
    }
}

/// Best-effort removal of a partially written destination
fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial output"),
    }
}
