//! The one unsafe corner: raw ioctl calls against an open directory fd.
//!
//! Every wrapper takes a caller-encoded byte buffer (built by the record
//! codec) and reports failure as [`HelperError::Ioctl`] with the OS error
//! code attached. Nothing here interprets buffer contents.

use btq_error::{HelperError, Result};
use btq_types::{
    IOC_DEFAULT_SUBVOL, IOC_SPACE_INFO, IOC_TREE_SEARCH, SEARCH_ARGS_SIZE, VOL_ARGS_SIZE,
};
use std::os::unix::io::RawFd;

fn ioctl(fd: RawFd, op: &'static str, request: u64, ptr: *mut libc::c_void) -> Result<()> {
    // Safety: the caller hands us a live fd and a buffer sized for the
    // request; the kernel never writes past the size encoded in the
    // request number.
    let rv = unsafe { libc::ioctl(fd, request as _, ptr) };
    if rv < 0 {
        return Err(HelperError::Ioctl {
            op,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Issue one `BTRFS_IOC_TREE_SEARCH` call; the kernel rewrites the key's
/// item count and fills the trailing buffer.
pub fn tree_search(fd: RawFd, args: &mut [u8; SEARCH_ARGS_SIZE]) -> Result<()> {
    ioctl(fd, "tree_search", IOC_TREE_SEARCH, args.as_mut_ptr().cast())
}

/// Issue one `BTRFS_IOC_SPACE_INFO` call into a caller-sized buffer.
///
/// The buffer must hold at least the 16-byte argument header; the slot
/// capacity encoded there bounds what the kernel writes back.
pub fn space_info(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    ioctl(fd, "space_info", IOC_SPACE_INFO, buf.as_mut_ptr().cast())
}

/// Issue a vol-args ioctl (subvolume create/delete/snapshot, device
/// add/remove) against `fd`.
pub fn vol_args_ioctl(
    fd: RawFd,
    op: &'static str,
    request: u64,
    args: &mut [u8; VOL_ARGS_SIZE],
) -> Result<()> {
    ioctl(fd, op, request, args.as_mut_ptr().cast())
}

/// Point the default-subvolume at `subvol_id`.
pub fn set_default_subvol(fd: RawFd, subvol_id: u64) -> Result<()> {
    let mut id = subvol_id;
    ioctl(
        fd,
        "default_subvol",
        IOC_DEFAULT_SUBVOL,
        std::ptr::from_mut(&mut id).cast(),
    )
}

/// Effective uid of this process.
#[must_use]
pub fn effective_uid() -> u32 {
    // Safety: geteuid has no failure modes and touches no memory.
    unsafe { libc::geteuid() }
}
