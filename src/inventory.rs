//! Disk inventory of a domain descriptor
//!
//! [`DiskInventory`] walks the descriptor lazily and yields one [`Disk`] per
//! `<devices><disk>` element, in document order. Disks that are not plain
//! image files are yielded too, tagged as non-convertible, so the rewriter
//! can carry them over unchanged.

use crate::error::{Error, Result};
use crate::types::{Disk, DiskKind, DomainDescriptor};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::PathBuf;

/// Read an attribute value, unescaped
pub(crate) fn attr(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute?;
        if attribute.key.as_ref() == key {
            return Ok(Some(attribute.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Whether `name` is a `<disk>` element directly under `<devices>`
pub(crate) fn is_device_disk(name: &[u8], parent: Option<&[u8]>) -> bool {
    name == b"disk" && parent == Some(b"devices".as_slice())
}

/// Lazy iterator over the disks of one descriptor
pub struct DiskInventory<'a> {
    reader: Reader<&'a [u8]>,
    stack: Vec<Vec<u8>>,
    next_index: usize,
    done: bool,
}

impl<'a> DiskInventory<'a> {
    pub fn new(descriptor: &'a DomainDescriptor) -> Self {
        Self::from_xml(&descriptor.xml)
    }

    pub fn from_xml(xml: &'a str) -> Self {
        Self {
            reader: Reader::from_str(xml),
            stack: Vec::new(),
            next_index: 0,
            done: false,
        }
    }

    fn malformed(&self, err: impl std::fmt::Display) -> Error {
        Error::Inventory(format!(
            "at byte {}: {}",
            self.reader.buffer_position(),
            err
        ))
    }

    fn check_root(&self, name: &[u8]) -> Result<()> {
        if self.stack.is_empty() && name != b"domain" {
            return Err(Error::Inventory(format!(
                "expected <domain> root element, found <{}>",
                String::from_utf8_lossy(name)
            )));
        }
        Ok(())
    }

    fn next_disk(&mut self) -> Result<Option<Disk>> {
        loop {
            let event = self.reader.read_event().map_err(|e| self.malformed(e))?;
            match event {
                Event::Start(e) => {
                    let name = e.name().as_ref().to_vec();
                    self.check_root(&name)?;
                    let parent = self.stack.last().map(|p| p.as_slice());
                    if is_device_disk(&name, parent) {
                        let index = self.next_index;
                        self.next_index += 1;
                        return self.read_disk(index, &e).map(Some);
                    }
                    self.stack.push(name);
                }
                Event::Empty(e) => {
                    let name = e.name();
                    self.check_root(name.as_ref())?;
                    let parent = self.stack.last().map(|p| p.as_slice());
                    if is_device_disk(name.as_ref(), parent) {
                        return Err(Error::Inventory(format!(
                            "disk #{} has no target device",
                            self.next_index
                        )));
                    }
                }
                Event::End(_) => {
                    self.stack.pop();
                }
                Event::Eof => {
                    if !self.stack.is_empty() {
                        return Err(self.malformed("unexpected end of document"));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    /// Consume the body of a `<disk>` element up to its closing tag
    fn read_disk(&mut self, index: usize, disk: &BytesStart<'_>) -> Result<Disk> {
        let disk_type = attr(disk, b"type")?;
        let device = attr(disk, b"device")?.unwrap_or_else(|| "disk".to_string());

        let mut target = None;
        let mut driver_name = None;
        let mut declared_format = None;
        let mut source_file = None;
        let mut depth = 0usize;

        loop {
            let event = self.reader.read_event().map_err(|e| self.malformed(e))?;
            let (element, opens) = match event {
                Event::Start(e) => (e, true),
                Event::Empty(e) => (e, false),
                Event::End(_) if depth == 0 => break,
                Event::End(_) => {
                    depth -= 1;
                    continue;
                }
                Event::Eof => return Err(self.malformed("unterminated <disk> element")),
                _ => continue,
            };

            if depth == 0 {
                match element.name().as_ref() {
                    b"target" => target = attr(&element, b"dev")?,
                    b"driver" => {
                        driver_name = attr(&element, b"name")?;
                        declared_format = attr(&element, b"type")?;
                    }
                    b"source" => source_file = attr(&element, b"file")?,
                    _ => {}
                }
            }
            if opens {
                depth += 1;
            }
        }

        let target = target
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Inventory(format!("disk #{} has no target device", index)))?;

        let kind = match (disk_type.as_deref(), device.as_str(), source_file) {
            (_, "cdrom" | "floppy", _) => {
                DiskKind::NonConvertible(format!("removable {} media", device))
            }
            (None | Some("file"), _, Some(file)) if !file.is_empty() => {
                DiskKind::File(PathBuf::from(file))
            }
            (None | Some("file"), _, _) => DiskKind::NonConvertible("no source file".to_string()),
            (Some(other), _, _) => DiskKind::NonConvertible(format!("{} backed", other)),
        };

        Ok(Disk {
            index,
            target,
            device,
            driver_name,
            declared_format,
            kind,
        })
    }
}

impl Iterator for DiskInventory<'_> {
    type Item = Result<Disk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_disk() {
            Ok(Some(disk)) => Some(Ok(disk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Collect every disk of a descriptor, failing on the first malformed one
pub fn inventory(descriptor: &DomainDescriptor) -> Result<Vec<Disk>> {
    DiskInventory::new(descriptor).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const DOMAIN: &str = r#"
<domain type='kvm'>
  <name>debian-master</name>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='raw'/>
      <source file='/vms/debian-master.img'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='block' device='disk'>
      <driver name='qemu' type='raw'/>
      <source dev='/dev/vg0/data'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/isos/debian.iso'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <disk type='file' device='disk'>
      <source file='/vms/scratch &amp; tmp.qcow2'>
        <seclabel model='dac' relabel='no'/>
      </source>
      <target dev='vdc' bus='virtio'/>
    </disk>
  </devices>
</domain>
"#;

    #[test]
    fn test_inventory_yields_disks_in_order() {
        let disks: Vec<Disk> = DiskInventory::from_xml(DOMAIN)
            .collect::<Result<_>>()
            .unwrap();

        let targets: Vec<&str> = disks.iter().map(|d| d.target.as_str()).collect();
        assert_eq!(targets, vec!["vda", "vdb", "sda", "vdc"]);
        assert_eq!(disks.iter().map(|d| d.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_inventory_tags_non_file_disks() {
        let disks = inventory(&DomainDescriptor::new("debian-master", DOMAIN)).unwrap();

        assert_eq!(disks[0].file_source(), Some(Path::new("/vms/debian-master.img")));
        assert_eq!(disks[0].declared_format.as_deref(), Some("raw"));
        assert_eq!(disks[0].driver_name.as_deref(), Some("qemu"));
        assert_eq!(
            disks[1].kind,
            DiskKind::NonConvertible("block backed".to_string())
        );
        assert_eq!(
            disks[2].kind,
            DiskKind::NonConvertible("removable cdrom media".to_string())
        );
    }

    #[test]
    fn test_inventory_handles_nested_source_and_missing_driver() {
        let disks = inventory(&DomainDescriptor::new("debian-master", DOMAIN)).unwrap();

        assert_eq!(
            disks[3].file_source(),
            Some(Path::new("/vms/scratch & tmp.qcow2"))
        );
        assert_eq!(disks[3].declared_format, None);
        assert_eq!(disks[3].driver_name, None);
    }

    #[test]
    fn test_inventory_rejects_disk_without_target() {
        let xml = r#"<domain><devices>
            <disk type='file'><source file='/vms/a.img'/></disk>
        </devices></domain>"#;

        let result: Result<Vec<Disk>> = DiskInventory::from_xml(xml).collect();
        assert!(matches!(result, Err(Error::Inventory(msg)) if msg.contains("#0")));
    }

    #[test]
    fn test_inventory_rejects_garbage() {
        let result = inventory(&DomainDescriptor::new("x", "<domain><devices></domain>"));
        assert!(matches!(result, Err(Error::Inventory(_))));

        let result = inventory(&DomainDescriptor::new("x", "<network/>"));
        assert!(matches!(result, Err(Error::Inventory(_))));
    }

    #[test]
    fn test_inventory_without_disks_is_empty() {
        let xml = "<domain><name>empty</name><devices/></domain>";
        assert!(inventory(&DomainDescriptor::new("empty", xml)).unwrap().is_empty());
    }

    #[test]
    fn test_inventory_stops_after_error() {
        let xml = r#"<domain><devices><disk/><disk type='file'>
            <source file='/a'/><target dev='vda'/></disk></devices></domain>"#;
        let mut disks = DiskInventory::from_xml(xml);
        assert!(disks.next().unwrap().is_err());
        assert!(disks.next().is_none());
    }
}
