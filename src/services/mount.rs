//! Mount service: mounts a filesystem from an opened device at
//! `<mounts_root>/<name>`, and unmounts (lazily, with retry) on teardown.

use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;
use serde_json::{json, Value};

use crate::error::GraphError;
use crate::rpc::{FdSet, Service};
use crate::services::device::OpenDevice;

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub name: String,
    pub info_name: String,
    pub source_device: String,
    pub target: PathBuf,
    pub options: Value,
}

#[derive(Default)]
pub struct MountService {
    active: Mutex<Vec<PathBuf>>,
}

impl MountService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_all(
        &self,
        specs: &[MountSpec],
        devices: &std::collections::HashMap<String, OpenDevice>,
        mounts_root: &std::path::Path,
    ) -> Result<std::collections::HashMap<String, PathBuf>, GraphError> {
        let mut out = std::collections::HashMap::new();
        for spec in specs {
            let device = devices
                .get(&spec.source_device)
                .ok_or_else(|| GraphError::Validation(format!("mount {} references undeclared device {}", spec.name, spec.source_device)))?;
            let target = mounts_root.join(&spec.name);
            std::fs::create_dir_all(&target).map_err(|e| GraphError::Mount(e.to_string()))?;
            self.mount_one(spec, device, &target)?;
            out.insert(spec.name.clone(), target);
        }
        Ok(out)
    }

    fn mount_one(&self, spec: &MountSpec, device: &OpenDevice, target: &std::path::Path) -> Result<(), GraphError> {
        let fstype = match spec.info_name.as_str() {
            "org.osbuild.ext4" => "ext4",
            "org.osbuild.fat" => "vfat",
            "org.osbuild.xfs" => "xfs",
            "org.osbuild.btrfs" => "btrfs",
            other => return Err(GraphError::UnknownModule { kind: "mount", name: other.to_string() }),
        };
        nix::mount::mount(
            Some(device.path.as_path()),
            target,
            Some(fstype),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| GraphError::Mount(format!("mount {} at {}: {e}", device.path.display(), target.display())))?;
        self.active.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    /// Unmount everything, most-recently-mounted first; retries lazily on failure.
    pub fn teardown(&self) {
        let mut active = self.active.lock().unwrap();
        while let Some(target) = active.pop() {
            if nix::mount::umount(&target).is_err() {
                if let Err(e) = nix::mount::umount2(&target, nix::mount::MntFlags::MNT_DETACH) {
                    warn!("failed to unmount {}: {e}", target.display());
                }
            }
        }
    }
}

impl Service for MountService {
    fn name(&self) -> &'static str {
        "mount"
    }

    fn dispatch(&self, method: &str, _args: Value, _fds: &mut FdSet) -> Result<(Value, Vec<std::os::fd::OwnedFd>), GraphError> {
        match method {
            "status" => Ok((json!({"active": self.active.lock().unwrap().len()}), Vec::new())),
            other => Err(GraphError::UnknownModule { kind: "mount-method", name: other.to_string() }),
        }
    }
}

impl Drop for MountService {
    fn drop(&mut self) {
        self.teardown();
    }
}
