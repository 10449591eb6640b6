//! Input service: materializes pipeline outputs or source items into a
//! stage's sandbox filesystem, yielding an opaque descriptor the stage
//! interprets privately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::error::GraphError;
use crate::rpc::{FdSet, Service};
use crate::store::ObjectStore;

pub struct InputService {
    store: Arc<ObjectStore>,
    binds: Mutex<Vec<PathBuf>>,
}

impl InputService {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        InputService { store, binds: Mutex::new(Vec::new()) }
    }

    /// `refs` maps a pipeline id (origin=pipeline) or checksum (origin=source)
    /// to its descriptor data from the manifest.
    pub fn map(
        &self,
        origin: &str,
        refs: &HashMap<String, Value>,
        target_dir: &Path,
        info_name: &str,
    ) -> Result<Value, GraphError> {
        std::fs::create_dir_all(target_dir).map_err(|e| GraphError::Validation(e.to_string()))?;

        match origin {
            "pipeline" => {
                let mut mapped = serde_json::Map::new();
                for (pipeline_id, descriptor) in refs {
                    let source = self
                        .store
                        .resolve_ref(pipeline_id)
                        .ok_or_else(|| GraphError::Validation(format!("unknown pipeline object {pipeline_id}")))?;
                    let dest = target_dir.join(pipeline_id);
                    std::fs::create_dir_all(&dest).map_err(|e| GraphError::Mount(e.to_string()))?;
                    crate::store::bind_mount(&source, &dest).map_err(|e| GraphError::Mount(e.to_string()))?;
                    self.binds.lock().unwrap().push(dest.clone());
                    mapped.insert(pipeline_id.clone(), descriptor.clone());
                }
                Ok(json!({"origin": "pipeline", "refs": mapped}))
            }
            "source" => {
                let cache_dir = self.store.source_cache_dir(info_name);
                let mut mapped = serde_json::Map::new();
                for (checksum, descriptor) in refs {
                    let src_file = cache_dir.join(checksum_filename(checksum));
                    let dest = target_dir.join(checksum_filename(checksum));
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| GraphError::Validation(e.to_string()))?;
                    }
                    if std::fs::hard_link(&src_file, &dest).is_err() {
                        std::fs::copy(&src_file, &dest)
                            .map_err(|e| GraphError::Validation(format!("linking source item {checksum}: {e}")))?;
                    }
                    mapped.insert(checksum.clone(), descriptor.clone());
                }
                Ok(json!({"origin": "source", "refs": mapped}))
            }
            other => Err(GraphError::Validation(format!("unknown input origin: {other}"))),
        }
    }
}

fn checksum_filename(checksum: &str) -> String {
    checksum.replace(':', "-")
}

impl Service for InputService {
    fn name(&self) -> &'static str {
        "input"
    }

    fn dispatch(&self, method: &str, args: Value, _fds: &mut FdSet) -> Result<(Value, Vec<std::os::fd::OwnedFd>), GraphError> {
        match method {
            "map" => {
                let origin = args.get("origin").and_then(|v| v.as_str()).unwrap_or("");
                let target_dir = args.get("target_dir").and_then(|v| v.as_str()).unwrap_or("");
                let info_name = args.get("info_name").and_then(|v| v.as_str()).unwrap_or("");
                let refs: HashMap<String, Value> = args
                    .get("refs")
                    .and_then(|v| v.as_object())
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                let reply = self.map(origin, &refs, Path::new(target_dir), info_name)?;
                Ok((reply, Vec::new()))
            }
            other => Err(GraphError::UnknownModule { kind: "input-method", name: other.to_string() }),
        }
    }
}

impl Drop for InputService {
    fn drop(&mut self) {
        for target in self.binds.lock().unwrap().drain(..) {
            let _ = crate::store::bind_unmount(&target);
        }
    }
}
