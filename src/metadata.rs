//! Ownership and permission preservation for converted images

use crate::error::{Error, Result};
use nix::unistd::{chown, Gid, Uid};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::debug;

/// Owner, group and permission bits of a source image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// Which parts of a snapshot to reapply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreserveFlags {
    pub keep_ownership: bool,
    pub keep_permissions: bool,
}

impl PreserveFlags {
    pub fn any(&self) -> bool {
        self.keep_ownership || self.keep_permissions
    }
}

/// Reads and reapplies file ownership and permissions
pub trait MetadataPreserver {
    fn capture(&self, path: &Path) -> Result<MetadataSnapshot>;

    fn apply(&self, snapshot: &MetadataSnapshot, path: &Path, flags: PreserveFlags) -> Result<()>;
}

/// Metadata handling through the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixMetadata;

impl MetadataPreserver for UnixMetadata {
    fn capture(&self, path: &Path) -> Result<MetadataSnapshot> {
        capture(path)
    }

    fn apply(&self, snapshot: &MetadataSnapshot, path: &Path, flags: PreserveFlags) -> Result<()> {
        apply(snapshot, path, flags)
    }
}

/// Read the ownership and permission bits of `path`
pub fn capture(path: &Path) -> Result<MetadataSnapshot> {
    let meta = fs::metadata(path).map_err(|source| Error::MetadataRead {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(MetadataSnapshot {
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode() & 0o7777,
    })
}

/// Reapply the requested parts of `snapshot` to `path`
pub fn apply(snapshot: &MetadataSnapshot, path: &Path, flags: PreserveFlags) -> Result<()> {
    if flags.keep_ownership {
        debug!(path = %path.display(), uid = snapshot.uid, gid = snapshot.gid, "restoring ownership");
        chown(
            path,
            Some(Uid::from_raw(snapshot.uid)),
            Some(Gid::from_raw(snapshot.gid)),
        )
        .map_err(|e| Error::MetadataApply {
            path: path.to_path_buf(),
            cause: format!("chown {}:{}: {}", snapshot.uid, snapshot.gid, e),
        })?;
    }

    // chown may clear setuid/setgid bits, so permissions go last
    if flags.keep_permissions {
        debug!(path = %path.display(), mode = %format!("{:o}", snapshot.mode), "restoring permissions");
        fs::set_permissions(path, fs::Permissions::from_mode(snapshot.mode)).map_err(|e| {
            Error::MetadataApply {
                path: path.to_path_buf(),
                cause: format!("chmod {:o}: {}", snapshot.mode, e),
            }
        })?;
    }

    Ok(())
}
