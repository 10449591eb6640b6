//! Device service: opens stage-scoped kernel resources (loop devices,
//! device-mapper entries, partitions) honoring the parent chain declared in
//! the manifest, and releases them in reverse order.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{json, Value};

use crate::error::GraphError;
use crate::rpc::{FdSet, Service};
use crate::services::loopback::{open_backing_file, LoopbackService};

/// A device as materialized by the service: its node path and major/minor.
#[derive(Debug, Clone)]
pub struct OpenDevice {
    pub path: PathBuf,
    pub major: u64,
    pub minor: u64,
}

/// One declared device, as handed down from the manifest.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub info_name: String,
    pub parent: Option<String>,
    pub options: Value,
}

pub struct DeviceService {
    loopback: LoopbackService,
    /// Opened devices this stage run owns, in open order (closed in reverse).
    opened: std::sync::Mutex<Vec<String>>,
}

impl DeviceService {
    pub fn new() -> Self {
        DeviceService { loopback: LoopbackService::new(), opened: std::sync::Mutex::new(Vec::new()) }
    }

    /// Open every device in `specs`, parents before children, returning each
    /// device's materialized path/node keyed by name.
    pub fn open_all(
        &self,
        specs: &[DeviceSpec],
        dev_root: &std::path::Path,
    ) -> Result<HashMap<String, OpenDevice>, GraphError> {
        let mut by_name: HashMap<String, DeviceSpec> =
            specs.iter().map(|s| (s.name.clone(), s.clone())).collect();
        let mut opened = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for spec in specs {
            self.open_one(spec, &mut by_name, &mut opened, &mut order, dev_root)?;
        }

        *self.opened.lock().unwrap() = order;
        Ok(opened)
    }

    fn open_one(
        &self,
        spec: &DeviceSpec,
        by_name: &mut HashMap<String, DeviceSpec>,
        opened: &mut HashMap<String, OpenDevice>,
        order: &mut Vec<String>,
        dev_root: &std::path::Path,
    ) -> Result<(), GraphError> {
        if opened.contains_key(&spec.name) {
            return Ok(());
        }
        if let Some(parent) = &spec.parent {
            let parent_spec = by_name
                .get(parent)
                .cloned()
                .ok_or_else(|| GraphError::Validation(format!("device {} has missing parent {}", spec.name, parent)))?;
            self.open_one(&parent_spec, by_name, opened, order, dev_root)?;
        }

        let device = match spec.info_name.as_str() {
            "org.osbuild.loopback" => {
                let filename = spec
                    .options
                    .get("filename")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GraphError::Validation("loopback device missing filename option".into()))?;
                let backing_path = dev_root.join(filename);
                let backing = open_backing_file(&backing_path)?;
                let dir = std::fs::File::open(dev_root).map_err(|e| GraphError::Device(e.to_string()))?;
                let (devname, minor) = self.loopback.bind(backing.into(), dir.into(), 0, 0)?;
                OpenDevice { path: dev_root.join(&devname), major: 7, minor: minor as u64 }
            }
            other => return Err(GraphError::UnknownModule { kind: "device", name: other.to_string() }),
        };

        opened.insert(spec.name.clone(), device);
        order.push(spec.name.clone());
        Ok(())
    }
}

impl Default for DeviceService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for DeviceService {
    fn name(&self) -> &'static str {
        "device"
    }

    fn dispatch(&self, method: &str, _args: Value, _fds: &mut FdSet) -> Result<(Value, Vec<std::os::fd::OwnedFd>), GraphError> {
        match method {
            "status" => Ok((json!({"opened": *self.opened.lock().unwrap()}), Vec::new())),
            other => Err(GraphError::UnknownModule { kind: "device-method", name: other.to_string() }),
        }
    }
}
