//! Dependency-driven scheduler: turns a set of export targets into an
//! ordered, cache-aware list of pipelines to build.

use std::collections::HashSet;

use log::debug;

use crate::error::{GraphError, UnmatchedPattern};
use crate::manifest::Manifest;
use crate::store::ObjectStore;

/// Mark stages/pipelines as checkpoints by glob pattern, per spec §4.8:
/// a pipeline-name match marks its last stage (if it has any); otherwise
/// every stage whose id matches the pattern is marked. Patterns matching
/// nothing are returned so the caller can fail the build.
pub fn apply_checkpoints(manifest: &mut Manifest, patterns: &[String]) -> Vec<UnmatchedPattern> {
    let mut unmatched = Vec::new();
    for pattern in patterns {
        let mut matched = false;
        for pipeline in &mut manifest.pipelines {
            if glob_match(pattern, &pipeline.name) {
                if let Some(stage) = pipeline.stages.last_mut() {
                    stage.checkpoint = true;
                    matched = true;
                }
                continue;
            }
            for stage in &mut pipeline.stages {
                if glob_match(pattern, &stage.id) {
                    stage.checkpoint = true;
                    matched = true;
                }
            }
        }
        if !matched {
            unmatched.push(UnmatchedPattern(pattern.clone()));
        }
    }
    unmatched
}

/// Compute the ordered list of pipeline names to build for `targets`
/// (pipeline names or ids), honoring what `store` already has cached.
///
/// Reverse post-order over the pipeline DAG: push targets, pop and skip
/// cached pipelines, otherwise record-and-requeue-at-end, push the build
/// ref, then scan stages in reverse stopping at the latest cached
/// checkpoint and pushing every pipeline an uncached stage's inputs
/// reference. The recorded order is reversed at the end.
pub fn schedule(manifest: &Manifest, store: &ObjectStore, targets: &[String]) -> Result<Vec<String>, GraphError> {
    let mut stack: Vec<String> = Vec::new();
    for target in targets {
        let pipeline = manifest
            .resolve_export_target(target)
            .ok_or_else(|| GraphError::Validation(format!("unknown export target: {target}")))?;
        stack.push(pipeline.name.clone());
    }

    let mut ordered: Vec<String> = Vec::new();
    let mut queued: HashSet<String> = HashSet::new();

    while let Some(name) = stack.pop() {
        let pipeline = manifest
            .pipeline_by_name(&name)
            .ok_or_else(|| GraphError::Validation(format!("unknown pipeline: {name}")))?;

        if let Some(id) = pipeline.id() {
            if store.contains(id) {
                debug!("pipeline {name} already cached as {id}, skipping");
                continue;
            }
        }

        if queued.contains(&name) {
            ordered.retain(|n| n != &name);
        }
        ordered.push(name.clone());
        queued.insert(name.clone());

        if let Some(build_ref) = &pipeline.build_ref {
            if let Some(build_pipeline) = manifest.pipeline_by_name(build_ref).or_else(|| manifest.pipeline_by_id(build_ref)) {
                stack.push(build_pipeline.name.clone());
            }
        }

        for stage in pipeline.stages.iter().rev() {
            if store.contains(&stage.id) {
                break;
            }
            for ref_id in manifest.stage_input_pipeline_refs(stage) {
                if let Some(parent) = manifest.pipeline_by_name(ref_id).or_else(|| manifest.pipeline_by_id(ref_id)) {
                    stack.push(parent.name.clone());
                }
            }
        }
    }

    ordered.reverse();
    Ok(ordered)
}

/// Minimal `*`/`?` glob matcher; patterns are matched against the whole
/// string, not path-segment-aware (ids and pipeline names have no `/`).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn rec(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => rec(&p[1..], t) || (!t.is_empty() && rec(p, &t[1..])),
            Some(b'?') => !t.is_empty() && rec(&p[1..], &t[1..]),
            Some(&c) => t.first() == Some(&c) && rec(&p[1..], &t[1..]),
        }
    }
    rec(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(doc: serde_json::Value) -> Manifest {
        crate::manifest::load(&doc).unwrap()
    }

    #[test]
    fn glob_matches_star_and_exact() {
        assert!(glob_match("org.osbuild.*", "org.osbuild.noop"));
        assert!(glob_match("abc123", "abc123"));
        assert!(!glob_match("abc123", "abc124"));
    }

    #[test]
    fn schedule_orders_build_dependency_before_dependent() {
        let doc = json!({
            "version": "2",
            "pipelines": [
                {"name": "build", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]},
                {"name": "image", "build": "name:build", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]},
            ],
        });
        let manifest = manifest(doc);
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        let order = schedule(&manifest, &store, &["image".to_string()]).unwrap();
        assert_eq!(order, vec!["build".to_string(), "image".to_string()]);
    }

    #[test]
    fn schedule_skips_cached_pipeline() {
        let doc = json!({
            "version": "2",
            "pipelines": [{"name": "tree", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]}],
        });
        let manifest = manifest(doc);
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        let id = manifest.pipeline_by_name("tree").unwrap().id().unwrap().to_string();
        let mut obj = store.new_object(None).unwrap();
        obj.init(&store).unwrap();
        obj.finalize(None).unwrap();
        store.commit(&mut obj, &id).unwrap();

        let order = schedule(&manifest, &store, &["tree".to_string()]).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn unmatched_checkpoint_pattern_is_reported() {
        let doc = json!({
            "version": "2",
            "pipelines": [{"name": "tree", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]}],
        });
        let mut manifest = manifest(doc);
        let unmatched = apply_checkpoints(&mut manifest, &["nothing-like-this".to_string()]);
        assert_eq!(unmatched, vec![UnmatchedPattern("nothing-like-this".to_string())]);
    }

    #[test]
    fn checkpoint_by_pipeline_name_marks_last_stage() {
        let doc = json!({
            "version": "2",
            "pipelines": [{"name": "tree", "stages": [
                {"type": "org.osbuild.testing.noop", "options": {"a": 1}},
                {"type": "org.osbuild.testing.noop", "options": {"b": 2}},
            ]}],
        });
        let mut manifest = manifest(doc);
        let unmatched = apply_checkpoints(&mut manifest, &["tree".to_string()]);
        assert!(unmatched.is_empty());
        let stages = &manifest.pipelines[0].stages;
        assert!(!stages[0].checkpoint);
        assert!(stages[1].checkpoint);
    }
}
