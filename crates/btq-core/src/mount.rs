//! Mount/session lifecycle.
//!
//! Mount state is process-wide: a UUID goes `Unmounted → Mounted` on first
//! use and stays mounted until [`MountTable::cleanup`] tears everything
//! down at shutdown. Individual operations borrow the mount through a
//! [`FilesystemHandle`], whose descriptors are closed on every exit path
//! when the handle drops.

use btq_error::{HelperError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Executes the actual mount/unmount transitions.
///
/// The table's state machine is all that lives above this seam, so it can
/// be driven in tests without root privileges.
pub trait Mounter: Send + Sync {
    fn mount(&self, uuid: &str, target: &Path) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Spawns the system `mount`/`umount` binaries.
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, uuid: &str, target: &Path) -> Result<()> {
        let output = Command::new("mount")
            .args(["-t", "btrfs", "-o", "subvolid=0"])
            .arg(format!("UUID={uuid}"))
            .arg(target)
            .output()?;
        if !output.status.success() {
            return Err(HelperError::Mount {
                uuid: uuid.to_owned(),
                detail: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let output = Command::new("umount").arg(target).output()?;
        if !output.status.success() {
            return Err(HelperError::Mount {
                uuid: target.display().to_string(),
                detail: format!(
                    "umount: {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

struct TableInner {
    /// Private directory holding one mount point per UUID. Created lazily
    /// on the first acquire.
    base: Option<tempfile::TempDir>,
    mounted: BTreeSet<String>,
}

/// Process-wide registry of mounted filesystems, keyed by UUID.
pub struct MountTable {
    mounter: Box<dyn Mounter>,
    inner: Mutex<TableInner>,
}

impl MountTable {
    pub fn new(mounter: Box<dyn Mounter>) -> Self {
        Self {
            mounter,
            inner: Mutex::new(TableInner {
                base: None,
                mounted: BTreeSet::new(),
            }),
        }
    }

    /// A table backed by the system mount/umount binaries.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Box::new(SystemMounter))
    }

    /// Ensure `uuid` is mounted and open its root directory.
    ///
    /// Idempotent on the mount step: a second acquire for an
    /// already-mounted UUID only opens a fresh root descriptor.
    pub fn acquire(&self, uuid: &str) -> Result<FilesystemHandle> {
        validate_uuid(uuid)?;

        let mount_point = {
            let mut inner = self.inner.lock();
            let base_path = match &inner.base {
                Some(base) => base.path().to_path_buf(),
                None => {
                    let base = tempfile::Builder::new().prefix("btrquery-").tempdir()?;
                    tracing::info!(path = %base.path().display(), "created private mount directory");
                    let path = base.path().to_path_buf();
                    inner.base = Some(base);
                    path
                }
            };

            let mount_point = base_path.join(uuid);
            if !inner.mounted.contains(uuid) {
                fs::create_dir_all(&mount_point)?;
                self.mounter.mount(uuid, &mount_point)?;
                inner.mounted.insert(uuid.to_owned());
                tracing::info!(uuid, path = %mount_point.display(), "mounted filesystem");
            }
            mount_point
        };

        Ok(FilesystemHandle {
            root: open_dir(&mount_point)?,
            root_path: mount_point,
            tracked: Vec::new(),
        })
    }

    /// Whether `uuid` is currently mounted.
    #[must_use]
    pub fn is_mounted(&self, uuid: &str) -> bool {
        self.inner.lock().mounted.contains(uuid)
    }

    /// Best-effort global teardown: unmount every mounted UUID, then
    /// remove the private mount-point directory.
    ///
    /// Failures are logged and skipped so one stuck mount cannot keep the
    /// rest mounted. Safe to call repeatedly, including when nothing is
    /// mounted.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock();
        let Some(base) = inner.base.take() else {
            return;
        };

        for uuid in std::mem::take(&mut inner.mounted) {
            let target = base.path().join(&uuid);
            if let Err(err) = self.mounter.unmount(&target) {
                tracing::warn!(%uuid, %err, "unmount failed during cleanup");
            }
            if let Err(err) = fs::remove_dir(&target) {
                tracing::warn!(%uuid, %err, "could not remove mount point");
            }
        }

        if let Err(err) = base.close() {
            tracing::warn!(%err, "could not remove private mount directory");
        }
    }
}

/// A UUID is used as a path component under the private directory, so it
/// must not be able to traverse out of it.
fn validate_uuid(uuid: &str) -> Result<()> {
    let well_formed = !uuid.is_empty()
        && uuid
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-');
    if !well_formed {
        return Err(HelperError::InvalidRequest {
            reason: format!("malformed filesystem UUID {uuid:?}"),
        });
    }
    Ok(())
}

fn open_dir(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(path)?)
}

/// An open filesystem root plus the sub-descriptors one operation opened
/// beneath it. All descriptors close when the handle goes out of scope,
/// whichever way the operation exits.
#[derive(Debug)]
pub struct FilesystemHandle {
    root: File,
    root_path: PathBuf,
    tracked: Vec<File>,
}

impl FilesystemHandle {
    #[must_use]
    pub fn root_fd(&self) -> RawFd {
        self.root.as_raw_fd()
    }

    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Resolve a client-supplied path against the mounted root.
    ///
    /// A leading `/` is stripped so the path stays root-relative instead
    /// of escaping into the host filesystem.
    #[must_use]
    pub fn subpath(&self, relative: &str) -> PathBuf {
        self.root_path.join(relative.trim_start_matches('/'))
    }

    /// Open a directory beneath the root; the descriptor stays valid (and
    /// tracked for release) until the handle drops.
    pub fn open_subpath(&mut self, relative: &str) -> Result<RawFd> {
        let dir = open_dir(&self.subpath(relative))?;
        let fd = dir.as_raw_fd();
        self.tracked.push(dir);
        Ok(fd)
    }

    /// Explicitly end the session, closing the root descriptor and every
    /// tracked sub-descriptor. Dropping the handle has the same effect.
    pub fn release(self) {}
}
