//! Error types for virt-disk-convert

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for virt-disk-convert operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while converting a domain's disks
#[derive(Error, Debug)]
pub enum Error {
    #[error("Domain '{0}' does not exist")]
    DomainNotFound(String),

    #[error("Domain '{0}' is running. Shut it down before converting its disks.")]
    DomainRunning(String),

    #[error("Malformed domain descriptor: {0}")]
    Inventory(String),

    #[error("Cannot plan conversion: {0}")]
    Planning(String),

    #[error("Unsupported image format '{0}'")]
    UnsupportedFormat(String),

    #[error("Failed to probe format of {path}: {cause}")]
    Probe { path: PathBuf, cause: String },

    #[error("Conversion of disk {disk} failed: {cause}")]
    ConversionFailed { disk: String, cause: String },

    #[error("Converted image {path} for disk {disk} is invalid: {reason}")]
    ConversionVerification {
        disk: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to read metadata of {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to apply metadata to {path}: {cause}")]
    MetadataApply { path: PathBuf, cause: String },

    #[error("Domain '{domain}' rejected the new configuration: {cause}")]
    CommitFailed { domain: String, cause: String },

    #[error("Required tool '{0}' not found")]
    ToolNotFound(String),

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::Xml(err.into())
    }
}
