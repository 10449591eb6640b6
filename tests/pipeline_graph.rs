//! End-to-end coverage for the manifest/scheduler/store path that doesn't
//! require a privileged sandbox (no `bwrap`, no stage binaries): the six
//! scenarios from the external-interfaces section, exercised at the level
//! of the object store and scheduler directly.

use std::collections::HashMap;
use std::sync::Arc;

use imagegraph::{manifest, scheduler, ObjectStore};
use serde_json::json;

fn temp_store() -> (tempfile::TempDir, Arc<ObjectStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ObjectStore::open(dir.path()).expect("open store");
    (dir, Arc::new(store))
}

#[test]
fn trivial_noop_pipeline_has_no_id_and_is_always_scheduled() {
    let doc = json!({"version": "2", "pipelines": [{"name": "noop"}]});
    let m = manifest::load(&doc).expect("loads");
    assert_eq!(m.pipelines.len(), 1);
    assert!(m.pipelines[0].id().is_none());

    let (_dir, store) = temp_store();
    let order = scheduler::schedule(&m, &store, &["noop".to_string()]).expect("schedules");
    assert_eq!(order, vec!["noop".to_string()]);
}

#[test]
fn single_stage_pipeline_is_skipped_once_its_id_is_cached() {
    let doc = json!({
        "version": "2",
        "pipelines": [{
            "name": "tree",
            "stages": [{"type": "org.osbuild.testing.noop", "options": {"one": 1}}],
        }],
    });
    let m = manifest::load(&doc).expect("loads");
    let tree = m.pipeline_by_name("tree").unwrap();
    let stage_id = tree.id().expect("non-empty pipeline has an id").to_string();

    let (_dir, store) = temp_store();
    let order = scheduler::schedule(&m, &store, &["tree".to_string()]).expect("schedules");
    assert_eq!(order, vec!["tree".to_string()]);

    // Simulate the runner committing the stage's object under its id.
    let mut object = store.new_object(None).expect("new object");
    object.init(&store).expect("init");
    object.finalize(None).expect("finalize");
    store.commit(&mut object, &stage_id).expect("commit");

    let order_again = scheduler::schedule(&m, &store, &["tree".to_string()]).expect("re-schedules");
    assert!(order_again.is_empty(), "cached pipeline must not be rescheduled");
}

#[test]
fn build_pipeline_dependency_orders_build_before_dependent_then_caches_both() {
    let doc = json!({
        "version": "2",
        "pipelines": [
            {"name": "build", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]},
            {"name": "image", "build": "name:build", "stages": [{"type": "org.osbuild.testing.noop", "options": {"x": 1}}]},
        ],
    });
    let m = manifest::load(&doc).expect("loads");
    let (_dir, store) = temp_store();

    let order = scheduler::schedule(&m, &store, &["image".to_string()]).expect("schedules");
    assert_eq!(order, vec!["build".to_string(), "image".to_string()]);

    for name in ["build", "image"] {
        let id = m.pipeline_by_name(name).unwrap().id().unwrap().to_string();
        let mut object = store.new_object(None).expect("new object");
        object.init(&store).expect("init");
        object.finalize(None).expect("finalize");
        store.commit(&mut object, &id).expect("commit");
    }

    let order_again = scheduler::schedule(&m, &store, &["image".to_string()]).expect("re-schedules");
    assert!(order_again.is_empty());
}

#[test]
fn export_preserves_or_drops_ownership_per_flag() {
    let (_dir, store) = temp_store();
    let mut object = store.new_object(None).expect("new object");
    object.init(&store).expect("init");
    {
        let guard = object.write().expect("write guard");
        std::fs::write(guard.path().join("foo.img"), b"artifact bytes").expect("write file");
    }
    object.finalize(None).expect("finalize");
    store.commit(&mut object, "exported-tree").expect("commit");

    let resolved = store.new_object(Some("exported-tree")).expect("resolve object");
    resolved.init(&store).expect("materialize export tree");

    let out_preserve = tempfile::tempdir().expect("outdir");
    store.export(&resolved, out_preserve.path(), true).expect("export preserve_owner");
    assert!(out_preserve.path().join("foo.img").exists());

    let out_no_preserve = tempfile::tempdir().expect("outdir");
    store.export(&resolved, out_no_preserve.path(), false).expect("export no preserve_owner");
    assert!(out_no_preserve.path().join("foo.img").exists());
}

#[test]
fn inline_source_item_is_visible_to_a_source_origin_input() {
    use imagegraph::services::InputService;

    let (_dir, store) = temp_store();
    let info_name = "org.osbuild.inline";
    let payload = b"1234";
    let checksum = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(payload);
        format!("sha256:{:x}", hasher.finalize())
    };

    let cache_dir = store.source_cache_dir(info_name);
    std::fs::create_dir_all(&cache_dir).expect("cache dir");
    std::fs::write(cache_dir.join(checksum.replace(':', "-")), payload).expect("seed cache");

    let input_service = InputService::new(store.clone());
    let mut refs = HashMap::new();
    refs.insert(checksum.clone(), json!({}));
    let target_dir = tempfile::tempdir().expect("target dir");
    input_service.map("source", &refs, target_dir.path(), info_name).expect("materialize input");

    let materialized = target_dir.path().join(checksum.replace(':', "-"));
    let bytes = std::fs::read(&materialized).expect("read materialized input");
    assert_eq!(bytes, payload);

    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let actual = format!("sha256:{:x}", hasher.finalize());
    assert_eq!(actual, checksum);
}

#[test]
fn describe_then_load_round_trips_a_multi_pipeline_manifest() {
    let doc = json!({
        "version": "2",
        "pipelines": [
            {"name": "build", "stages": [{"type": "org.osbuild.testing.noop", "options": {}}]},
            {"name": "image", "build": "name:build", "stages": [{"type": "org.osbuild.testing.noop", "options": {"x": 1}}]},
        ],
    });
    let original = manifest::load(&doc).expect("loads");
    let described = manifest::describe(&original);
    let reloaded = manifest::load(&described).expect("reloads");

    assert_eq!(original.pipelines.len(), reloaded.pipelines.len());
    for (a, b) in original.pipelines.iter().zip(reloaded.pipelines.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.id(), b.id());
    }
}
