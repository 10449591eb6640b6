//! Stage runner: turns one [`Pipeline`]'s uncached stage suffix into a
//! sequence of build-root invocations, producing a [`StageLogEntry`] per
//! stage and committing checkpoints (and always the pipeline's final stage)
//! back into the store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use serde_json::{json, Value};

use crate::error::GraphError;
use crate::manifest::{Pipeline, Stage};
use crate::registry::ModuleRegistry;
use crate::result::StageLogEntry;
use crate::rpc::ServiceManager;
use crate::sandbox::{BuildRoot, BuildRootSpec, BuildTreeRoot};
use crate::services::{DeviceService, DeviceSpec, InputService, MountService, MountSpec, StoreService};
use crate::store::ObjectStore;

pub struct PipelineRunner {
    store: Arc<ObjectStore>,
    stage_timeout_secs: Option<u64>,
}

impl PipelineRunner {
    pub fn new(store: Arc<ObjectStore>, stage_timeout_secs: Option<u64>) -> Self {
        PipelineRunner { store, stage_timeout_secs }
    }

    /// Run every uncached stage at the tail of `pipeline`, in order.
    /// Returns the stage log built so far either way; on failure the error
    /// names which stage failed.
    pub fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        registry: &mut ModuleRegistry,
    ) -> (Vec<StageLogEntry>, Result<(), GraphError>) {
        let mut log = Vec::new();

        let mut start = 0usize;
        let mut base_id: Option<String> = None;
        for (i, stage) in pipeline.stages.iter().enumerate().rev() {
            if self.store.contains(&stage.id) {
                start = i + 1;
                base_id = Some(stage.id.clone());
                break;
            }
        }

        if start >= pipeline.stages.len() {
            info!("pipeline {} fully cached at {}", pipeline.name, base_id.as_deref().unwrap_or(""));
            return (log, Ok(()));
        }

        let mut object = match self.store.new_object(base_id.as_deref()) {
            Ok(o) => o,
            Err(e) => return (log, Err(e)),
        };
        if let Err(e) = object.init(&self.store) {
            return (log, Err(e));
        }

        let tree_root = match &pipeline.build_ref {
            Some(build_id) => match self.store.resolve_ref(build_id) {
                Some(path) => BuildTreeRoot::Store(path),
                None => {
                    return (
                        log,
                        Err(GraphError::Validation(format!("build pipeline {build_id} has no committed tree"))),
                    )
                }
            },
            None => BuildTreeRoot::Host,
        };

        let is_last = |i: usize| i + 1 == pipeline.stages.len();

        for i in start..pipeline.stages.len() {
            if crate::cancel::requested() {
                return (log, Err(GraphError::Cancelled));
            }

            let stage = &pipeline.stages[i];
            let tree_root_ref = match &tree_root {
                BuildTreeRoot::Store(p) => BuildTreeRoot::Store(p.clone()),
                BuildTreeRoot::Host => BuildTreeRoot::Host,
            };

            match self.run_stage(stage, &object, tree_root_ref, registry) {
                Ok(entry) => {
                    let succeeded = entry.success.unwrap_or(false);
                    log.push(entry);
                    if !succeeded {
                        return (log, Err(GraphError::StageFailed { stage: stage.info_name.clone(), returncode: 1 }));
                    }
                }
                Err(e) => {
                    log.push(StageLogEntry {
                        id: stage.id.clone(),
                        stage_type: stage.info_name.clone(),
                        output: String::new(),
                        success: Some(false),
                        error: Some(json!({"message": e.to_string()})),
                    });
                    return (log, Err(e));
                }
            }

            if stage.checkpoint || is_last(i) {
                if let Err(e) = object.finalize(stage.source_epoch) {
                    return (log, Err(e));
                }
                if let Err(e) = self.store.commit(&mut object, &stage.id) {
                    return (log, Err(e));
                }
                // The just-committed object's tree now backs a published ref;
                // further stages must write into a fresh copy-on-write clone
                // rather than the published directory itself.
                if !is_last(i) {
                    object = match self.store.new_object(Some(&stage.id)) {
                        Ok(o) => o,
                        Err(e) => return (log, Err(e)),
                    };
                    if let Err(e) = object.init(&self.store) {
                        return (log, Err(e));
                    }
                }
            }
        }

        (log, Ok(()))
    }

    fn run_stage(
        &self,
        stage: &Stage,
        object: &crate::store::Object,
        tree_root: BuildTreeRoot,
        registry: &mut ModuleRegistry,
    ) -> Result<StageLogEntry, GraphError> {
        let stage_binary = registry.resolve("stage", &stage.info_name)?.to_path_buf();

        let mut services = ServiceManager::new(self.store.tmp_dir().join("run-sockets"));
        let store_service = Box::new(StoreService::new(self.store.clone()));
        let input_service = InputService::new(self.store.clone());
        let device_service = DeviceService::new();
        let mount_service = MountService::new();
        services.register(store_service)?;

        let inputs_root = self.store.tmp_dir().join(crate::store::tmp_name("inputs"));
        let mut materialized_inputs = serde_json::Map::new();
        for (name, input) in &stage.inputs {
            let target_dir = inputs_root.join(name);
            let refs: HashMap<String, Value> = input.refs.clone().into_iter().collect();
            let descriptor = input_service.map(&input.origin, &refs, &target_dir, &input.info_name)?;
            materialized_inputs.insert(name.clone(), descriptor);
        }

        let dev_specs: Vec<DeviceSpec> = stage
            .devices
            .values()
            .map(|d| DeviceSpec {
                name: d.name.clone(),
                info_name: d.info_name.clone(),
                parent: d.parent.clone(),
                options: d.options.clone(),
            })
            .collect();
        let devices_root = self.store.tmp_dir().join(crate::store::tmp_name("devices"));
        std::fs::create_dir_all(&devices_root).map_err(|e| GraphError::Device(e.to_string()))?;
        let opened_devices = device_service.open_all(&dev_specs, &devices_root)?;

        let mount_specs: Vec<MountSpec> = stage
            .mounts
            .values()
            .map(|m| MountSpec {
                name: m.name.clone(),
                info_name: m.info_name.clone(),
                source_device: m.source_device.clone(),
                target: PathBuf::from(&m.target),
                options: m.options.clone(),
            })
            .collect();
        let mounts_root = self.store.tmp_dir().join(crate::store::tmp_name("mounts"));
        let mounted = mount_service.mount_all(&mount_specs, &opened_devices, &mounts_root)?;

        let args_value = build_arguments_file(stage, &materialized_inputs, &opened_devices, &mounted);
        let args_path = self.store.tmp_dir().join(crate::store::tmp_name("arguments")).with_extension("json");
        std::fs::write(&args_path, serde_json::to_vec_pretty(&args_value).unwrap())
            .map_err(|e| GraphError::Validation(e.to_string()))?;

        let write_guard = object.write()?;
        let extra_binds = vec![
            (write_guard.path().to_path_buf(), PathBuf::from("/run/osbuild/tree")),
            (inputs_root.clone(), PathBuf::from("/run/osbuild/inputs")),
            (mounts_root.clone(), PathBuf::from("/run/osbuild/mounts")),
        ];

        let spec = BuildRootSpec {
            tree_root,
            libdirs: registry.libdirs().to_vec(),
            stage_binary,
            stage_name: stage.info_name.clone(),
            extra_binds,
            extra_capabilities: Vec::new(),
            source_epoch: stage.source_epoch,
            timeout_secs: self.stage_timeout_secs,
        };

        let build_root = BuildRoot::construct(spec, services)
            .map_err(|e| GraphError::Mount(e.to_string()))?;

        let run_result = build_root.run(&args_path)?;
        mount_service.teardown();
        drop(write_guard);

        Ok(StageLogEntry {
            id: stage.id.clone(),
            stage_type: stage.info_name.clone(),
            output: String::from_utf8_lossy(&run_result.stdout).into_owned()
                + &String::from_utf8_lossy(&run_result.stderr),
            success: Some(run_result.success()),
            error: if run_result.success() {
                None
            } else {
                Some(json!({"returncode": run_result.returncode}))
            },
        })
    }
}

/// Build the JSON arguments file per the stage invocation contract.
fn build_arguments_file(
    stage: &Stage,
    inputs: &serde_json::Map<String, Value>,
    devices: &HashMap<String, crate::services::OpenDevice>,
    mounts: &HashMap<String, PathBuf>,
) -> Value {
    let devices_json: serde_json::Map<String, Value> = devices
        .iter()
        .map(|(name, d)| {
            (
                name.clone(),
                json!({"path": d.path, "node": {"major": d.major, "minor": d.minor}}),
            )
        })
        .collect();
    let mounts_json: serde_json::Map<String, Value> =
        mounts.iter().map(|(name, path)| (name.clone(), json!({"path": path}))).collect();

    json!({
        "tree": "/run/osbuild/tree",
        "paths": {
            "devices": "/dev",
            "inputs": "/run/osbuild/inputs",
            "mounts": "/run/osbuild/mounts",
        },
        "devices": devices_json,
        "inputs": inputs,
        "mounts": mounts_json,
        "options": stage.options,
        "meta": {
            "id": stage.id,
            "source-epoch": stage.source_epoch,
        },
    })
}
