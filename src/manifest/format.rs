//! v2 manifest JSON <-> [`Manifest`] conversion.
//!
//! `load` resolves `"name:"`-prefixed pipeline references to ids as it walks
//! the `pipelines` array in declared order, so a pipeline may only
//! reference pipelines that appear earlier in the manifest — the natural
//! consequence of the DAG being acyclic and declared topologically.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::{DeviceDecl, InputRef, Manifest, MountDecl, Pipeline, Source, Stage};
use crate::error::GraphError;

const NAME_PREFIX: &str = "name:";

pub fn load(doc: &Value) -> Result<Manifest, GraphError> {
    let obj = doc
        .as_object()
        .ok_or_else(|| GraphError::Validation("manifest must be a JSON object".into()))?;

    let version = obj.get("version").and_then(Value::as_str).unwrap_or("2");
    if version != "2" {
        return Err(GraphError::Validation(format!("unsupported manifest version: {version}")));
    }

    let sources = load_sources(obj.get("sources"))?;

    let mut manifest = Manifest { pipelines: Vec::new(), sources };

    let pipelines_json = obj
        .get("pipelines")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for pipeline_json in &pipelines_json {
        let pipeline = load_pipeline(pipeline_json, &manifest)?;
        manifest.pipelines.push(pipeline);
    }

    manifest.validate()?;
    Ok(manifest)
}

fn load_sources(value: Option<&Value>) -> Result<Vec<Source>, GraphError> {
    let Some(value) = value else { return Ok(Vec::new()) };
    let obj = value
        .as_object()
        .ok_or_else(|| GraphError::Validation("sources must be an object".into()))?;

    let mut out = Vec::new();
    for (info_name, spec) in obj {
        let items: BTreeMap<String, Value> = spec
            .get("items")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let options = spec.get("options").cloned().unwrap_or(Value::Null);
        out.push(Source { info_name: info_name.clone(), items, options });
    }
    Ok(out)
}

fn load_pipeline(value: &Value, manifest_so_far: &Manifest) -> Result<Pipeline, GraphError> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation("pipeline missing name".into()))?
        .to_string();
    let runner_name = value.get("runner").and_then(Value::as_str).map(str::to_string);
    let source_epoch = value.get("source-epoch").and_then(Value::as_u64);

    let build_ref = match value.get("build").and_then(Value::as_str) {
        Some(raw) => Some(resolve_pipeline_ref(raw, manifest_so_far)?),
        None => None,
    };
    let build_id = match &build_ref {
        Some(id) => Some(id.clone()),
        None => None,
    };

    let mut stages = Vec::new();
    let mut base_id: Option<String> = None;
    for stage_json in value.get("stages").and_then(Value::as_array).into_iter().flatten() {
        let stage = load_stage(stage_json, build_id.as_deref(), base_id.as_deref(), manifest_so_far)?;
        base_id = Some(stage.id.clone());
        stages.push(stage);
    }

    Ok(Pipeline { name, runner_name, build_ref, stages, source_epoch })
}

fn load_stage(
    value: &Value,
    build_id: Option<&str>,
    base_id: Option<&str>,
    manifest_so_far: &Manifest,
) -> Result<Stage, GraphError> {
    let info_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation("stage missing type".into()))?
        .to_string();
    let options = value.get("options").cloned().unwrap_or(json!({}));
    let source_epoch = value.get("source-epoch").and_then(Value::as_u64);
    let checkpoint = value.get("checkpoint").and_then(Value::as_bool).unwrap_or(false);
    let export = value.get("export").and_then(Value::as_bool).unwrap_or(false);

    let mut devices = BTreeMap::new();
    for (name, dv) in value.get("devices").and_then(Value::as_object).into_iter().flatten() {
        let device = load_device(name, dv, &devices)?;
        devices.insert(name.clone(), device);
    }

    let mut inputs = BTreeMap::new();
    for (name, iv) in value.get("inputs").and_then(Value::as_object).into_iter().flatten() {
        let input = load_input(name, iv, manifest_so_far)?;
        inputs.insert(name.clone(), input);
    }

    let mut mounts = BTreeMap::new();
    for (name, mv) in value.get("mounts").and_then(Value::as_object).into_iter().flatten() {
        let mount = load_mount(name, mv, &devices)?;
        mounts.insert(name.clone(), mount);
    }

    let id = Stage::compute_id(&info_name, build_id, base_id, &options, source_epoch, &inputs, &mounts);

    Ok(Stage {
        info_name,
        options,
        build_id: build_id.map(str::to_string),
        base_id: base_id.map(str::to_string),
        source_epoch,
        inputs,
        devices,
        mounts,
        checkpoint,
        export,
        id,
    })
}

fn load_device(name: &str, value: &Value, siblings: &BTreeMap<String, DeviceDecl>) -> Result<DeviceDecl, GraphError> {
    let info_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation(format!("device {name} missing type")))?
        .to_string();
    let parent = value.get("parent").and_then(Value::as_str).map(str::to_string);
    let options = value.get("options").cloned().unwrap_or(json!({}));

    if let Some(parent_name) = &parent {
        if !siblings.contains_key(parent_name) {
            return Err(GraphError::Validation(format!(
                "device {name} references parent {parent_name} before it is declared"
            )));
        }
    }

    let parent_id = parent.as_ref().and_then(|p| siblings.get(p)).map(|d| d.id.clone());
    let id = crate::id::composite_id(&[
        ("info_name", Value::String(info_name.clone())),
        ("parent_id", parent_id.map(Value::String).unwrap_or(Value::Null)),
        ("options", options.clone()),
    ]);

    Ok(DeviceDecl { name: name.to_string(), info_name, parent, options, id })
}

fn load_input(name: &str, value: &Value, manifest_so_far: &Manifest) -> Result<InputRef, GraphError> {
    let info_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation(format!("input {name} missing type")))?
        .to_string();
    let origin = value
        .get("origin")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation(format!("input {name} missing origin")))?
        .to_string();
    let options = value.get("options").cloned().unwrap_or(json!({}));

    let mut refs = BTreeMap::new();
    match value.get("references") {
        Some(Value::Array(items)) => {
            for item in items {
                let raw = item
                    .as_str()
                    .ok_or_else(|| GraphError::Validation(format!("input {name} has non-string reference")))?;
                let resolved = if origin == "pipeline" {
                    resolve_pipeline_ref(raw, manifest_so_far)?
                } else {
                    raw.to_string()
                };
                refs.insert(resolved, Value::Null);
            }
        }
        Some(Value::Object(map)) => {
            for (raw, descriptor) in map {
                let resolved = if origin == "pipeline" {
                    resolve_pipeline_ref(raw, manifest_so_far)?
                } else {
                    raw.clone()
                };
                refs.insert(resolved, descriptor.clone());
            }
        }
        Some(_) => {
            return Err(GraphError::Validation(format!("input {name} has malformed references")))
        }
        None => {}
    }

    let id = InputRef::compute_id(&info_name, &origin, &options, &refs);
    Ok(InputRef { name: name.to_string(), info_name, origin, options, refs, id })
}

fn load_mount(name: &str, value: &Value, devices: &BTreeMap<String, DeviceDecl>) -> Result<MountDecl, GraphError> {
    let info_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation(format!("mount {name} missing type")))?
        .to_string();
    let source_device = value
        .get("source")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation(format!("mount {name} missing source")))?
        .to_string();
    let target = value
        .get("target")
        .and_then(Value::as_str)
        .ok_or_else(|| GraphError::Validation(format!("mount {name} missing target")))?
        .to_string();
    let options = value.get("options").cloned().unwrap_or(json!({}));

    let device = devices.get(&source_device).ok_or_else(|| {
        GraphError::Validation(format!("mount {name} references undeclared device {source_device}"))
    })?;
    let id = MountDecl::compute_id(&info_name, &device.id, &target, &options);

    Ok(MountDecl { name: name.to_string(), info_name, source_device, target, options, id })
}

/// Resolve a pipeline reference: either a literal id, or a `"name:<pipeline>"`
/// reference to that pipeline's current (already-computed) id.
fn resolve_pipeline_ref(raw: &str, manifest_so_far: &Manifest) -> Result<String, GraphError> {
    if let Some(name) = raw.strip_prefix(NAME_PREFIX) {
        let pipeline = manifest_so_far
            .pipeline_by_name(name)
            .ok_or_else(|| GraphError::Validation(format!("unresolvable pipeline reference: {raw}")))?;
        pipeline
            .id()
            .map(str::to_string)
            .ok_or_else(|| GraphError::Validation(format!("pipeline {name} has no id (empty pipeline)")))
    } else {
        Ok(raw.to_string())
    }
}

/// Render a [`Manifest`] back to v2 JSON. Pipeline name references are
/// re-emitted as `"name:<pipeline>"` so `load(describe(m))` round-trips.
pub fn describe(manifest: &Manifest) -> Value {
    let mut sources = Map::new();
    for source in &manifest.sources {
        sources.insert(
            source.info_name.clone(),
            json!({
                "items": source.items,
                "options": source.options,
            }),
        );
    }

    let pipelines: Vec<Value> = manifest.pipelines.iter().map(|p| describe_pipeline(p, manifest)).collect();

    json!({
        "version": "2",
        "sources": sources,
        "pipelines": pipelines,
    })
}

fn describe_pipeline(pipeline: &Pipeline, manifest: &Manifest) -> Value {
    let build = pipeline.build_ref.as_ref().map(|id| name_ref(id, manifest));
    let stages: Vec<Value> = pipeline.stages.iter().map(|s| describe_stage(s, manifest)).collect();

    let mut obj = Map::new();
    obj.insert("name".into(), json!(pipeline.name));
    if let Some(runner) = &pipeline.runner_name {
        obj.insert("runner".into(), json!(runner));
    }
    if let Some(build) = build {
        obj.insert("build".into(), json!(build));
    }
    if let Some(epoch) = pipeline.source_epoch {
        obj.insert("source-epoch".into(), json!(epoch));
    }
    obj.insert("stages".into(), json!(stages));
    Value::Object(obj)
}

fn describe_stage(stage: &Stage, manifest: &Manifest) -> Value {
    let devices: Map<String, Value> = stage
        .devices
        .iter()
        .map(|(name, d)| {
            let mut m = Map::new();
            m.insert("type".into(), json!(d.info_name));
            if let Some(parent) = &d.parent {
                m.insert("parent".into(), json!(parent));
            }
            m.insert("options".into(), d.options.clone());
            (name.clone(), Value::Object(m))
        })
        .collect();

    let inputs: Map<String, Value> = stage
        .inputs
        .iter()
        .map(|(name, i)| {
            let refs: Map<String, Value> = i
                .refs
                .iter()
                .map(|(r, descriptor)| {
                    let key = if i.origin == "pipeline" { name_ref(r, manifest) } else { r.clone() };
                    (key, descriptor.clone())
                })
                .collect();
            let mut m = Map::new();
            m.insert("type".into(), json!(i.info_name));
            m.insert("origin".into(), json!(i.origin));
            m.insert("options".into(), i.options.clone());
            m.insert("references".into(), Value::Object(refs));
            (name.clone(), Value::Object(m))
        })
        .collect();

    let mounts: Map<String, Value> = stage
        .mounts
        .iter()
        .map(|(name, mnt)| {
            let mut m = Map::new();
            m.insert("type".into(), json!(mnt.info_name));
            m.insert("source".into(), json!(mnt.source_device));
            m.insert("target".into(), json!(mnt.target));
            m.insert("options".into(), mnt.options.clone());
            (name.clone(), Value::Object(m))
        })
        .collect();

    json!({
        "type": stage.info_name,
        "options": stage.options,
        "devices": devices,
        "inputs": inputs,
        "mounts": mounts,
    })
}

fn name_ref(id: &str, manifest: &Manifest) -> String {
    match manifest.pipeline_by_id(id) {
        Some(p) => format!("{NAME_PREFIX}{}", p.name),
        None => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_noop_manifest_loads() {
        let doc = json!({"version": "2", "pipelines": [{"name": "noop"}]});
        let manifest = load(&doc).unwrap();
        assert_eq!(manifest.pipelines.len(), 1);
        assert_eq!(manifest.pipelines[0].id(), None);
    }

    #[test]
    fn build_pipeline_dependency_resolves_by_name() {
        let doc = json!({
            "version": "2",
            "pipelines": [
                {"name": "build", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]},
                {"name": "image", "build": "name:build", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]},
            ],
        });
        let manifest = load(&doc).unwrap();
        let build_id = manifest.pipeline_by_name("build").unwrap().id().unwrap().to_string();
        let image = manifest.pipeline_by_name("image").unwrap();
        assert_eq!(image.build_ref.as_deref(), Some(build_id.as_str()));
        assert_eq!(image.stages[0].build_id.as_deref(), Some(build_id.as_str()));
    }

    #[test]
    fn describe_then_load_round_trips_ids() {
        let doc = json!({
            "version": "2",
            "pipelines": [
                {"name": "tree", "stages": [{"type": "org.osbuild.testing.noop", "options": {"one": 1}}]},
            ],
        });
        let manifest = load(&doc).unwrap();
        let redescribed = describe(&manifest);
        let reloaded = load(&redescribed).unwrap();
        assert_eq!(manifest.pipelines[0].id(), reloaded.pipelines[0].id());
    }

    #[test]
    fn mount_referencing_undeclared_device_is_rejected() {
        let doc = json!({
            "version": "2",
            "pipelines": [{
                "name": "tree",
                "stages": [{
                    "type": "org.osbuild.testing.noop",
                    "mounts": {"m": {"type": "org.osbuild.ext4", "source": "missing", "target": "/"}},
                }],
            }],
        });
        assert!(load(&doc).is_err());
    }
}
