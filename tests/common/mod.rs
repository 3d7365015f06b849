// tests/common/mod.rs

//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use virt_disk_convert::backend::ConvertRequest;
use virt_disk_convert::{
    DomainDescriptor, DomainManager, Error, ImageTool, MetadataPreserver, MetadataSnapshot,
    PreserveFlags, Result, UnixMetadata,
};

/// Domain manager holding a single domain in memory
pub struct FakeManager {
    pub name: String,
    pub xml: RefCell<String>,
    pub active: bool,
    pub reject_define: bool,
    pub define_calls: Cell<usize>,
}

impl FakeManager {
    pub fn new(name: &str, xml: String) -> Self {
        Self {
            name: name.to_string(),
            xml: RefCell::new(xml),
            active: false,
            reject_define: false,
            define_calls: Cell::new(0),
        }
    }

    pub fn xml(&self) -> String {
        self.xml.borrow().clone()
    }
}

impl DomainManager for FakeManager {
    fn lookup_domain(&self, name: &str) -> Result<DomainDescriptor> {
        if name != self.name {
            return Err(Error::DomainNotFound(name.to_string()));
        }
        Ok(DomainDescriptor::new(name, self.xml()))
    }

    fn is_domain_active(&self, _name: &str) -> Result<bool> {
        Ok(self.active)
    }

    fn define_domain(&self, descriptor: &DomainDescriptor) -> Result<()> {
        self.define_calls.set(self.define_calls.get() + 1);
        if self.reject_define {
            return Err(Error::CommandFailed {
                command: "virsh define".to_string(),
                stderr: "error: operation failed: domain is locked".to_string(),
            });
        }
        *self.xml.borrow_mut() = descriptor.xml.clone();
        Ok(())
    }
}

/// Image tool that tracks formats per path and "converts" by writing bytes
#[derive(Default)]
pub struct FakeTool {
    pub formats: RefCell<HashMap<PathBuf, String>>,
    /// Conversions whose source is this path fail after writing partial output
    pub fail_on: Option<PathBuf>,
    /// Conversions whose source is this path "succeed" with an empty output
    pub empty_on: Option<PathBuf>,
    /// Replace the source with a directory after converting it, so it cannot be unlinked
    pub pin_source: Option<PathBuf>,
    pub probes: Cell<usize>,
    pub conversions: RefCell<Vec<PathBuf>>,
}

impl FakeTool {
    /// Create an image file at `path` that probes as `format`
    pub fn add_image(&self, path: &Path, format: &str) {
        fs::write(path, format!("{} image data", format)).unwrap();
        self.formats
            .borrow_mut()
            .insert(path.to_path_buf(), format.to_string());
    }

    pub fn conversion_count(&self) -> usize {
        self.conversions.borrow().len()
    }
}

impl ImageTool for FakeTool {
    fn probe_format(&self, path: &Path) -> Result<String> {
        self.probes.set(self.probes.get() + 1);
        self.formats
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Probe {
                path: path.to_path_buf(),
                cause: "Could not open image".to_string(),
            })
    }

    fn convert(
        &self,
        request: &ConvertRequest<'_>,
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<()> {
        self.conversions
            .borrow_mut()
            .push(request.source.to_path_buf());

        if self.fail_on.as_deref() == Some(request.source) {
            fs::write(request.destination, b"partial")?;
            return Err(Error::CommandFailed {
                command: "qemu-img convert".to_string(),
                stderr: "qemu-img: error while writing sector 2048".to_string(),
            });
        }

        if self.empty_on.as_deref() == Some(request.source) {
            fs::write(request.destination, b"")?;
            return Ok(());
        }

        fs::write(
            request.destination,
            format!("{} image data", request.destination_format),
        )?;
        fs::set_permissions(request.destination, fs::Permissions::from_mode(0o644))?;
        if let Some(progress) = progress {
            progress(50.0);
            progress(100.0);
        }
        self.formats.borrow_mut().insert(
            request.destination.to_path_buf(),
            request.destination_format.to_string(),
        );

        if self.pin_source.as_deref() == Some(request.source) {
            fs::remove_file(request.source)?;
            fs::create_dir(request.source)?;
        }
        Ok(())
    }
}

/// Local metadata handling that refuses to touch one destination
pub struct RefusingMetadata {
    pub refuse: PathBuf,
}

impl MetadataPreserver for RefusingMetadata {
    fn capture(&self, path: &Path) -> Result<MetadataSnapshot> {
        UnixMetadata.capture(path)
    }

    fn apply(&self, snapshot: &MetadataSnapshot, path: &Path, flags: PreserveFlags) -> Result<()> {
        if path == self.refuse {
            return Err(Error::MetadataApply {
                path: path.to_path_buf(),
                cause: "chown 0:0: Operation not permitted".to_string(),
            });
        }
        UnixMetadata.apply(snapshot, path, flags)
    }
}

/// Domain descriptor with one file-backed disk per `(target, path, declared format)`
pub fn domain_xml(name: &str, disks: &[(&str, &Path, &str)]) -> String {
    let mut xml = format!("<domain type='kvm'>\n  <name>{}</name>\n  <devices>\n", name);
    for (target, path, format) in disks {
        xml.push_str(&format!(
            "    <disk type='file' device='disk'>\n      \
             <driver name='qemu' type='{}'/>\n      \
             <source file='{}'/>\n      \
             <target dev='{}' bus='virtio'/>\n    \
             </disk>\n",
            format,
            path.display(),
            target
        ));
    }
    xml.push_str("    <disk type='network' device='disk'>\n      \
                  <source protocol='rbd' name='pool/image'/>\n      \
                  <target dev='vdz' bus='virtio'/>\n    \
                  </disk>\n");
    xml.push_str("  </devices>\n</domain>\n");
    xml
}
