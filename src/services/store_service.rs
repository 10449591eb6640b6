//! Store service (endpoint `store`): exposes read-only tree access, a
//! private scratch area, and per-source cache lookups to the stage.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::error::GraphError;
use crate::rpc::{FdSet, Service};
use crate::store::ObjectStore;

pub struct StoreService {
    store: Arc<ObjectStore>,
    /// Mount points created by `read-tree-at`, unmounted when the service is torn down.
    binds: Mutex<Vec<PathBuf>>,
}

impl StoreService {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        StoreService { store, binds: Mutex::new(Vec::new()) }
    }

    fn read_tree(&self, args: &Value) -> Result<Value, GraphError> {
        let object_id = args
            .get("object_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GraphError::Protocol("read-tree: missing object_id".into()))?;
        let path = self
            .store
            .resolve_ref(object_id)
            .ok_or_else(|| GraphError::Validation(format!("unknown object {object_id}")))?;
        Ok(json!({"path": path.display().to_string()}))
    }

    fn read_tree_at(&self, args: &Value) -> Result<Value, GraphError> {
        let object_id = args.get("object_id").and_then(|v| v.as_str());
        let target = args.get("target").and_then(|v| v.as_str());
        let subtree = args.get("subtree").and_then(|v| v.as_str()).unwrap_or(".");
        let (object_id, target) = match (object_id, target) {
            (Some(o), Some(t)) => (o, t),
            _ => return Err(GraphError::Protocol("read-tree-at: missing object_id/target".into())),
        };
        let source_root = self
            .store
            .resolve_ref(object_id)
            .ok_or_else(|| GraphError::Validation(format!("unknown object {object_id}")))?;
        let source = source_root.join(subtree);
        let target_path = PathBuf::from(target);
        std::fs::create_dir_all(&target_path).map_err(|e| GraphError::Mount(e.to_string()))?;
        crate::store::bind_mount(&source, &target_path).map_err(|e| GraphError::Mount(e.to_string()))?;
        self.binds.lock().unwrap().push(target_path.clone());
        Ok(json!({"path": target_path.display().to_string()}))
    }

    fn mkdtemp(&self, args: &Value) -> Result<Value, GraphError> {
        let prefix = args.get("prefix").and_then(|v| v.as_str()).unwrap_or("tmp");
        let suffix = args.get("suffix").and_then(|v| v.as_str()).unwrap_or("");
        let name = format!("{}{suffix}", crate::store::tmp_name(prefix));
        let path = self.store.tmp_dir().join(name);
        std::fs::create_dir_all(&path).map_err(|e| GraphError::Validation(e.to_string()))?;
        Ok(json!({"path": path.display().to_string()}))
    }

    fn source(&self, args: &Value) -> Result<Value, GraphError> {
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GraphError::Protocol("source: missing name".into()))?;
        let path = self.store.source_cache_dir(name);
        Ok(json!({"path": path.display().to_string()}))
    }
}

impl Service for StoreService {
    fn name(&self) -> &'static str {
        "store"
    }

    fn dispatch(
        &self,
        method: &str,
        args: Value,
        _fds: &mut FdSet,
    ) -> Result<(Value, Vec<std::os::fd::OwnedFd>), GraphError> {
        let reply = match method {
            "read-tree" => self.read_tree(&args)?,
            "read-tree-at" => self.read_tree_at(&args)?,
            "mkdtemp" => self.mkdtemp(&args)?,
            "source" => self.source(&args)?,
            other => {
                return Err(GraphError::UnknownModule { kind: "store-method", name: other.to_string() })
            }
        };
        Ok((reply, Vec::new()))
    }
}

impl Drop for StoreService {
    fn drop(&mut self) {
        for target in self.binds.lock().unwrap().drain(..) {
            let _ = crate::store::bind_unmount(&target);
        }
    }
}
