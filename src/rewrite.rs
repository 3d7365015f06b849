//! Domain descriptor rewriting and commit
//!
//! The new descriptor is produced by streaming the original one and only
//! touching the `<source file>` and `<driver type>` attributes of disks whose
//! conversion succeeded. Every other byte is copied through.

use crate::backend::DomainManager;
use crate::error::{Error, Result};
use crate::inventory::{attr, is_device_disk};
use crate::types::{ConversionTask, DomainDescriptor, TaskStatus};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// Rewrite `element` (a direct child of a converted disk) for `task`.
///
/// Returns `None` for elements that stay as they are.
fn rewrite_child(
    element: &BytesStart<'_>,
    task: &ConversionTask,
) -> Result<Option<BytesStart<'static>>> {
    let destination = task.destination.to_string_lossy();
    let (key, value): (&str, &str) = match element.name().as_ref() {
        b"source" => {
            let current = attr(element, b"file")?;
            if current.as_deref().map(Path::new) != Some(task.source.as_path()) {
                return Err(Error::Inventory(format!(
                    "disk {} no longer points at {}",
                    task.target,
                    task.source.display()
                )));
            }
            ("file", &*destination)
        }
        b"driver" => ("type", task.destination_format.as_str()),
        _ => return Ok(None),
    };

    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut rewritten = BytesStart::new(name);
    let mut replaced = false;
    for attribute in element.attributes() {
        let attribute = attribute?;
        if attribute.key.as_ref() == key.as_bytes() {
            rewritten.push_attribute((key, value));
            replaced = true;
        } else {
            rewritten.push_attribute(attribute);
        }
    }
    if !replaced {
        rewritten.push_attribute((key, value));
    }
    Ok(Some(rewritten))
}

/// Driver element for a converted disk that never declared one
fn missing_driver(task: &ConversionTask) -> BytesStart<'static> {
    let mut driver = BytesStart::new("driver");
    driver.push_attribute(("name", "qemu"));
    driver.push_attribute(("type", task.destination_format.as_str()));
    driver
}

/// Build the descriptor that references the converted images.
///
/// Only `Succeeded` tasks are applied; skipped and non-convertible disks are
/// copied unchanged.
pub fn rewrite(original: &DomainDescriptor, tasks: &[ConversionTask]) -> Result<DomainDescriptor> {
    let replacements: HashMap<usize, &ConversionTask> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Succeeded)
        .map(|t| (t.disk_index, t))
        .collect();

    let mut reader = Reader::from_str(&original.xml);
    let mut writer = Writer::new(Vec::new());
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut next_index = 0usize;
    // Task of the disk being copied, and the nesting depth inside it
    let mut current: Option<&ConversionTask> = None;
    let mut disk_depth: Option<usize> = None;
    let mut driver_seen = false;
    let mut rewritten_sources = HashSet::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                let parent = stack.last().map(|p| p.as_slice());
                match (disk_depth, current) {
                    (None, _) if is_device_disk(&name, parent) => {
                        current = replacements.get(&next_index).copied();
                        next_index += 1;
                        disk_depth = Some(0);
                        driver_seen = false;
                        writer.write_event(Event::Start(e))?;
                    }
                    (Some(0), Some(task)) => {
                        driver_seen |= e.name().as_ref() == b"driver";
                        match rewrite_child(&e, task)? {
                            Some(rewritten) => {
                                if rewritten.name().as_ref() == b"source" {
                                    rewritten_sources.insert(task.disk_index);
                                }
                                writer.write_event(Event::Start(rewritten))?;
                            }
                            None => writer.write_event(Event::Start(e))?,
                        }
                        disk_depth = Some(1);
                    }
                    (Some(depth), _) => {
                        disk_depth = Some(depth + 1);
                        writer.write_event(Event::Start(e))?;
                    }
                    (None, _) => writer.write_event(Event::Start(e))?,
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let parent = stack.last().map(|p| p.as_slice());
                if disk_depth.is_none() && is_device_disk(e.name().as_ref(), parent) {
                    next_index += 1;
                }
                let rewritten = match (disk_depth, current) {
                    (Some(0), Some(task)) => {
                        driver_seen |= e.name().as_ref() == b"driver";
                        rewrite_child(&e, task)?
                    }
                    _ => None,
                };
                match rewritten {
                    Some(rewritten) => {
                        if let Some(task) = current {
                            if rewritten.name().as_ref() == b"source" {
                                rewritten_sources.insert(task.disk_index);
                            }
                        }
                        writer.write_event(Event::Empty(rewritten))?;
                    }
                    None => writer.write_event(Event::Empty(e))?,
                }
            }
            Event::End(e) => {
                stack.pop();
                disk_depth = match disk_depth {
                    Some(0) => {
                        if let Some(task) = current.take() {
                            if !driver_seen {
                                writer.write_event(Event::Empty(missing_driver(task)))?;
                            }
                        }
                        None
                    }
                    Some(depth) => Some(depth - 1),
                    None => None,
                };
                writer.write_event(Event::End(e))?;
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    if let Some(missing) = replacements
        .values()
        .find(|t| !rewritten_sources.contains(&t.disk_index))
    {
        return Err(Error::Inventory(format!(
            "disk {} not found in descriptor of '{}'",
            missing.target, original.name
        )));
    }

    let xml = String::from_utf8(writer.into_inner())
        .map_err(|e| Error::Inventory(format!("rewritten descriptor is not UTF-8: {}", e)))?;
    debug!(domain = %original.name, disks = replacements.len(), "rewrote descriptor");
    Ok(DomainDescriptor::new(original.name.clone(), xml))
}

/// Produces and commits the post-conversion configuration
pub struct DomainConfigRewriter<'a, M: DomainManager + ?Sized> {
    manager: &'a M,
}

impl<'a, M: DomainManager + ?Sized> DomainConfigRewriter<'a, M> {
    pub fn new(manager: &'a M) -> Self {
        Self { manager }
    }

    /// Rewrite `original` for `tasks` and define it in one replace operation.
    ///
    /// Any failure, including a rejection by the manager, is `CommitFailed`.
    pub fn commit(&self, original: &DomainDescriptor, tasks: &[ConversionTask]) -> Result<()> {
        let commit_failed = |e: Error| Error::CommitFailed {
            domain: original.name.clone(),
            cause: e.to_string(),
        };

        let descriptor = rewrite(original, tasks).map_err(commit_failed)?;
        self.manager
            .define_domain(&descriptor)
            .map_err(commit_failed)?;
        info!(domain = %original.name, "committed new domain configuration");
        Ok(())
    }
}
