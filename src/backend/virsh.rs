//! libvirt access through the `virsh` command-line client

use crate::backend::DomainManager;
use crate::error::{Error, Result};
use crate::types::DomainDescriptor;
use std::io::{self, Write};
use std::process::{Command, Output};
use tracing::debug;

/// Configuration for the virsh backend
#[derive(Debug, Clone)]
pub struct VirshConfig {
    /// virsh executable (e.g., virsh or /usr/bin/virsh)
    pub program: String,
    /// Hypervisor connection URI (e.g., qemu:///system)
    pub connection_uri: String,
}

impl Default for VirshConfig {
    fn default() -> Self {
        Self {
            program: "virsh".to_string(),
            connection_uri: "qemu:///system".to_string(),
        }
    }
}

/// Domain manager backed by `virsh -c <uri>`
pub struct VirshBackend {
    config: VirshConfig,
}

impl VirshBackend {
    /// Create a backend talking to `connection_uri` with the default virsh
    pub fn new(connection_uri: impl Into<String>) -> Self {
        Self::with_config(VirshConfig {
            connection_uri: connection_uri.into(),
            ..VirshConfig::default()
        })
    }

    /// Create a backend with custom configuration
    pub fn with_config(config: VirshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VirshConfig {
        &self.config
    }

    fn spawn(&self, args: &[&str]) -> Result<Output> {
        debug!(uri = %self.config.connection_uri, ?args, "running virsh");
        Command::new(&self.config.program)
            .arg("-c")
            .arg(&self.config.connection_uri)
            .args(args)
            .output()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Error::ToolNotFound(self.config.program.clone())
                } else {
                    Error::Io(e)
                }
            })
    }

    /// Run a virsh command and return stdout
    fn run_command(&self, args: &[&str]) -> Result<String> {
        let output = self.spawn(args)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(Error::CommandFailed {
                command: format!(
                    "{} -c {} {}",
                    self.config.program,
                    self.config.connection_uri,
                    args.join(" ")
                ),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Whether a `virsh domstate` answer describes a domain that is not running
fn is_inactive_state(state: &str) -> bool {
    matches!(state.trim(), "shut off" | "crashed")
}

/// Arguments fetching the persistent descriptor, secrets included
fn dumpxml_args(name: &str) -> [&str; 4] {
    ["dumpxml", "--inactive", "--security-info", name]
}

/// Whether virsh's stderr reports a missing domain
fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

impl DomainManager for VirshBackend {
    fn lookup_domain(&self, name: &str) -> Result<DomainDescriptor> {
        match self.run_command(&dumpxml_args(name)) {
            Ok(xml) => Ok(DomainDescriptor::new(name, xml)),
            Err(Error::CommandFailed { stderr, .. }) if is_missing_domain(&stderr) => {
                Err(Error::DomainNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn is_domain_active(&self, name: &str) -> Result<bool> {
        let state = self.run_command(&["domstate", name])?;
        Ok(!is_inactive_state(&state))
    }

    fn define_domain(&self, descriptor: &DomainDescriptor) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-", descriptor.name))
            .suffix(".xml")
            .tempfile()?;
        file.write_all(descriptor.xml.as_bytes())?;
        file.flush()?;

        let path = file.path().to_string_lossy().to_string();
        self.run_command(&["define", &path])?;
        Ok(())
    }
}
