//! Loopback service (endpoint `remoteloop`): binds a backing file to a loop
//! device on behalf of a stage, materializing the device node inside the
//! stage's sandbox via the passed directory fd.
//!
//! Ioctl numbers are the kernel's documented loop-device ABI (see
//! `linux/loop.h`), ported to `nix`'s typed ioctl macros rather than raw
//! `libc::ioctl` calls.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex;

use nix::{ioctl_none, ioctl_write_int, ioctl_write_ptr};
use serde_json::{json, Value};

use crate::error::GraphError;
use crate::rpc::{FdSet, Service};

const LOOP_CTL_GET_FREE: u8 = 0x82;
const LOOP_SET_FD: u8 = 0x00;
const LOOP_CLR_FD: u8 = 0x01;
const LOOP_SET_STATUS64: u8 = 0x04;
const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
#[derive(Clone, Copy)]
struct LoopInfo64 {
    device: u64,
    inode: u64,
    rdevice: u64,
    offset: u64,
    size_limit: u64,
    number: u32,
    encrypt_type: u32,
    encrypt_key_size: u32,
    flags: u32,
    file_name: [u8; LO_NAME_SIZE],
    crypt_name: [u8; LO_NAME_SIZE],
    encrypt_key: [u8; LO_KEY_SIZE],
    init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // SAFETY: an all-zero LoopInfo64 is a valid bit pattern.
        unsafe { std::mem::zeroed() }
    }
}

ioctl_none!(loop_ctl_get_free, 0x4C, LOOP_CTL_GET_FREE);
ioctl_write_int!(loop_set_fd, 0x4C, LOOP_SET_FD);
ioctl_none!(loop_clr_fd, 0x4C, LOOP_CLR_FD);
ioctl_write_ptr!(loop_set_status64, 0x4C, LOOP_SET_STATUS64, LoopInfo64);

/// A pinned loop binding; released (`LOOP_CLR_FD`) when the service tears down.
struct PinnedLoop {
    devname: String,
    loop_fd: OwnedFd,
}

#[derive(Default)]
pub struct LoopbackService {
    pinned: Mutex<Vec<PinnedLoop>>,
}

impl LoopbackService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the allocated device's name (e.g. `loop3`) and its minor
    /// number, so a caller building a `node: {major, minor}` descriptor for
    /// the stage doesn't have to re-derive the index from the name.
    pub(crate) fn bind(
        &self,
        backing: OwnedFd,
        dir_fd: OwnedFd,
        offset: u64,
        sizelimit: u64,
    ) -> Result<(String, u32), GraphError> {
        let ctl = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/loop-control")
            .map_err(|e| GraphError::Loop(format!("open /dev/loop-control: {e}")))?;

        let free_index = unsafe { loop_ctl_get_free(ctl.as_raw_fd()) }
            .map_err(|e| GraphError::Loop(format!("LOOP_CTL_GET_FREE: {e}")))?
            as u32;

        let devname = format!("loop{free_index}");
        let loop_path = format!("/dev/{devname}");
        let loop_dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&loop_path)
            .map_err(|e| GraphError::Loop(format!("open {loop_path}: {e}")))?;
        let loop_fd: OwnedFd = loop_dev.into();

        unsafe { loop_set_fd(loop_fd.as_raw_fd(), backing.as_raw_fd() as u64) }
            .map_err(|e| GraphError::Loop(format!("LOOP_SET_FD: {e}")))?;

        let mut info = LoopInfo64 { offset, size_limit: sizelimit, flags: LO_FLAGS_AUTOCLEAR, ..Default::default() };
        let name_bytes = devname.as_bytes();
        let n = name_bytes.len().min(LO_NAME_SIZE - 1);
        info.file_name[..n].copy_from_slice(&name_bytes[..n]);

        if let Err(e) = unsafe { loop_set_status64(loop_fd.as_raw_fd(), &info) } {
            let _ = unsafe { loop_clr_fd(loop_fd.as_raw_fd()) };
            return Err(GraphError::Loop(format!("LOOP_SET_STATUS64: {e}")));
        }

        // Materialize the device node inside the stage's directory via the
        // passed directory fd, mirroring the node created at step 2 of the
        // build root's /dev setup (major 7, minor = free_index).
        mknod_at(&dir_fd, &devname, 7, free_index as u64)?;

        self.pinned.lock().unwrap().push(PinnedLoop { devname: devname.clone(), loop_fd });
        Ok((devname, free_index))
    }
}

fn mknod_at(dir_fd: &OwnedFd, name: &str, major: u64, minor: u64) -> Result<(), GraphError> {
    use nix::sys::stat::{mknodat, Mode, SFlag};
    mknodat(
        dir_fd,
        name,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o660),
        nix::sys::stat::makedev(major, minor),
    )
    .map_err(|e| GraphError::Loop(format!("mknodat {name}: {e}")))
}

impl Service for LoopbackService {
    fn name(&self) -> &'static str {
        "remoteloop"
    }

    fn dispatch(
        &self,
        method: &str,
        args: Value,
        fds: &mut FdSet,
    ) -> Result<(Value, Vec<OwnedFd>), GraphError> {
        match method {
            "loopback" => {
                let fd_index = args.get("fd_index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let dir_fd_index = args.get("dir_fd_index").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
                let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0);
                let sizelimit = args.get("sizelimit").and_then(|v| v.as_u64()).unwrap_or(0);

                let backing = fds
                    .take(fd_index)
                    .ok_or_else(|| GraphError::Protocol("loopback: missing backing fd".into()))?;
                let dir_fd = fds
                    .take(dir_fd_index)
                    .ok_or_else(|| GraphError::Protocol("loopback: missing dir fd".into()))?;

                let (devname, minor) = self.bind(backing, dir_fd, offset, sizelimit)?;
                Ok((json!({"devname": devname, "minor": minor}), Vec::new()))
            }
            other => Err(GraphError::UnknownModule { kind: "remoteloop-method", name: other.to_string() }),
        }
    }
}

impl Drop for LoopbackService {
    fn drop(&mut self) {
        for pinned in self.pinned.lock().unwrap().drain(..) {
            if let Err(e) = unsafe { loop_clr_fd(pinned.loop_fd.as_raw_fd()) } {
                log::warn!("failed to release {}: {e}", pinned.devname);
            }
        }
    }
}

/// Open `path` for loop backing (read-write), returning an owned fd suitable
/// to pass via `SCM_RIGHTS`.
pub fn open_backing_file(path: &std::path::Path) -> Result<OwnedFd, GraphError> {
    let f: File = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| GraphError::Loop(format!("open {}: {e}", path.display())))?;
    Ok(f.into())
}
