//! Manifest graph: pipelines, stages, and the inputs/devices/mounts they
//! declare, with stable content identifiers computed eagerly at load time.

mod format;

pub use format::{describe, load};

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::GraphError;
use crate::id::composite_id;

#[derive(Debug, Clone)]
pub struct Source {
    pub info_name: String,
    pub items: BTreeMap<String, Value>,
    pub options: Value,
}

#[derive(Debug, Clone)]
pub struct InputRef {
    pub name: String,
    pub info_name: String,
    pub origin: String,
    pub options: Value,
    pub refs: BTreeMap<String, Value>,
    pub id: String,
}

impl InputRef {
    fn compute_id(info_name: &str, origin: &str, options: &Value, refs: &BTreeMap<String, Value>) -> String {
        composite_id(&[
            ("info_name", Value::String(info_name.to_string())),
            ("origin", Value::String(origin.to_string())),
            ("options", options.clone()),
            ("refs", serde_json::to_value(refs).unwrap_or(Value::Null)),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct DeviceDecl {
    pub name: String,
    pub info_name: String,
    pub parent: Option<String>,
    pub options: Value,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct MountDecl {
    pub name: String,
    pub info_name: String,
    pub source_device: String,
    pub target: String,
    pub options: Value,
    pub id: String,
}

impl MountDecl {
    fn compute_id(info_name: &str, source_device_id: &str, target: &str, options: &Value) -> String {
        composite_id(&[
            ("info_name", Value::String(info_name.to_string())),
            ("source_device_id", Value::String(source_device_id.to_string())),
            ("target", Value::String(target.to_string())),
            ("options", options.clone()),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub info_name: String,
    pub options: Value,
    pub build_id: Option<String>,
    pub base_id: Option<String>,
    pub source_epoch: Option<u64>,
    pub inputs: BTreeMap<String, InputRef>,
    pub devices: BTreeMap<String, DeviceDecl>,
    pub mounts: BTreeMap<String, MountDecl>,
    pub checkpoint: bool,
    pub export: bool,
    pub id: String,
}

impl Stage {
    #[allow(clippy::too_many_arguments)]
    fn compute_id(
        info_name: &str,
        build_id: Option<&str>,
        base_id: Option<&str>,
        options: &Value,
        source_epoch: Option<u64>,
        inputs: &BTreeMap<String, InputRef>,
        mounts: &BTreeMap<String, MountDecl>,
    ) -> String {
        let input_ids: BTreeMap<String, String> =
            inputs.iter().map(|(name, input)| (name.clone(), input.id.clone())).collect();
        let mount_ids: Vec<String> = mounts.values().map(|m| m.id.clone()).collect();

        composite_id(&[
            ("info_name", Value::String(info_name.to_string())),
            ("build_id", build_id.map(Value::from).unwrap_or(Value::Null)),
            ("base_id", base_id.map(Value::from).unwrap_or(Value::Null)),
            ("options", options.clone()),
            ("source_epoch", source_epoch.map(Value::from).unwrap_or(Value::Null)),
            ("inputs", serde_json::to_value(input_ids).unwrap_or(Value::Null)),
            ("mounts", serde_json::to_value(mount_ids).unwrap_or(Value::Null)),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub runner_name: Option<String>,
    pub build_ref: Option<String>,
    pub stages: Vec<Stage>,
    pub source_epoch: Option<u64>,
}

impl Pipeline {
    /// A pipeline's id is its last stage's id; empty pipelines have none and
    /// cannot be referenced by inputs.
    pub fn id(&self) -> Option<&str> {
        self.stages.last().map(|s| s.id.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub pipelines: Vec<Pipeline>,
    pub sources: Vec<Source>,
}

impl Manifest {
    pub fn pipeline_by_name(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    pub fn pipeline_by_id(&self, target_id: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.id() == Some(target_id))
    }

    /// Resolve an export target, which may be given as a pipeline name or a
    /// bare content id, to the matching pipeline.
    pub fn resolve_export_target(&self, target: &str) -> Option<&Pipeline> {
        self.pipeline_by_name(target).or_else(|| self.pipeline_by_id(target))
    }

    /// Validate the invariants from the data model: unique names, resolvable
    /// build refs, no cycles, well-formed input/device/mount references.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.pipelines {
            if !seen.insert(p.name.as_str()) {
                return Err(GraphError::Validation(format!("duplicate pipeline name: {}", p.name)));
            }
        }

        for p in &self.pipelines {
            if let Some(build_ref) = &p.build_ref {
                if self.pipeline_by_name(build_ref).is_none() && self.pipeline_by_id(build_ref).is_none() {
                    return Err(GraphError::Validation(format!(
                        "pipeline {} has unresolvable build ref {build_ref}",
                        p.name
                    )));
                }
            }
            for stage in &p.stages {
                for device in stage.devices.values() {
                    if let Some(parent) = &device.parent {
                        if !stage.devices.contains_key(parent) {
                            return Err(GraphError::Validation(format!(
                                "device {} in pipeline {} references missing parent {parent}",
                                device.name, p.name
                            )));
                        }
                    }
                }
                for mount in stage.mounts.values() {
                    if !stage.devices.contains_key(&mount.source_device) {
                        return Err(GraphError::Validation(format!(
                            "mount {} in pipeline {} references undeclared device {}",
                            mount.name, p.name, mount.source_device
                        )));
                    }
                }
                for pipeline_ref in self.stage_input_pipeline_refs(stage) {
                    if self.pipeline_by_id(pipeline_ref).is_none()
                        && self.pipeline_by_name(pipeline_ref).is_none()
                    {
                        return Err(GraphError::Validation(format!(
                            "stage {} in pipeline {} has an input referencing unknown pipeline {pipeline_ref}",
                            stage.info_name, p.name
                        )));
                    }
                }
            }
        }

        detect_cycles(self)?;
        Ok(())
    }

    /// Every pipeline id a stage's inputs (origin=pipeline) reference.
    pub fn stage_input_pipeline_refs<'a>(&self, stage: &'a Stage) -> Vec<&'a str> {
        stage
            .inputs
            .values()
            .filter(|i| i.origin == "pipeline")
            .flat_map(|i| i.refs.keys())
            .map(String::as_str)
            .collect()
    }
}

fn detect_cycles(manifest: &Manifest) -> Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: std::collections::HashMap<&str, Mark> = std::collections::HashMap::new();

    fn visit<'a>(
        manifest: &'a Manifest,
        name: &'a str,
        marks: &mut std::collections::HashMap<&'a str, Mark>,
    ) -> Result<(), GraphError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(GraphError::Cycle(format!("pipeline graph cycle at {name}")))
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);

        let pipeline = manifest
            .pipeline_by_name(name)
            .ok_or_else(|| GraphError::Validation(format!("unknown pipeline {name}")))?;

        if let Some(build_ref) = &pipeline.build_ref {
            let parent_name = manifest
                .pipeline_by_name(build_ref)
                .or_else(|| manifest.pipeline_by_id(build_ref))
                .map(|p| p.name.as_str())
                .unwrap_or(build_ref.as_str());
            visit(manifest, parent_name, marks)?;
        }
        for stage in &pipeline.stages {
            for ref_id in manifest.stage_input_pipeline_refs(stage) {
                if let Some(parent) = manifest.pipeline_by_name(ref_id).or_else(|| manifest.pipeline_by_id(ref_id)) {
                    visit(manifest, &parent.name, marks)?;
                }
            }
        }

        marks.insert(name, Mark::Done);
        Ok(())
    }

    for p in &manifest.pipelines {
        visit(manifest, &p.name, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pipeline_id_is_last_stage_id() {
        let stage = Stage {
            info_name: "org.osbuild.testing.noop".into(),
            options: json!({}),
            build_id: None,
            base_id: None,
            source_epoch: None,
            inputs: BTreeMap::new(),
            devices: BTreeMap::new(),
            mounts: BTreeMap::new(),
            checkpoint: true,
            export: false,
            id: "abc123".into(),
        };
        let pipeline = Pipeline {
            name: "tree".into(),
            runner_name: None,
            build_ref: None,
            stages: vec![stage],
            source_epoch: None,
        };
        assert_eq!(pipeline.id(), Some("abc123"));
    }

    #[test]
    fn validate_rejects_a_pipeline_input_with_a_bogus_literal_ref() {
        let doc = json!({
            "version": "2",
            "pipelines": [{
                "name": "image",
                "stages": [{
                    "type": "org.osbuild.testing.noop",
                    "options": {},
                    "inputs": {
                        "tree": {
                            "type": "org.osbuild.tree",
                            "origin": "pipeline",
                            "references": ["not-a-real-pipeline-id"],
                        },
                    },
                }],
            }],
        });
        let err = crate::manifest::load(&doc).unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn empty_pipeline_has_no_id() {
        let pipeline = Pipeline {
            name: "noop".into(),
            runner_name: None,
            build_ref: None,
            stages: vec![],
            source_epoch: None,
        };
        assert_eq!(pipeline.id(), None);
    }
}
