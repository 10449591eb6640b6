//! Module registry: resolves a stage/input/device/mount/source `info_name`
//! to a runnable handler binary and its declared JSON-schema metadata.
//!
//! The original discovers modules by scanning a library directory for
//! files whose docstring carries a schema. Here each libdir is scanned for
//! binaries with a `<name>.meta.json` sidecar (preferred, no subprocess
//! needed to validate a manifest) or, failing that, a binary that honors
//! `--describe` (queried lazily, once, and cached).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

use crate::error::GraphError;
use crate::process::Cmd;

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleDescriptor {
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema_v1: Option<Value>,
    #[serde(default)]
    pub schema_v2: Option<Value>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

struct ModuleEntry {
    binary: PathBuf,
    descriptor: ModuleDescriptor,
}

/// Looks up modules by `info_name` across a fixed set of library
/// directories, passed in explicitly rather than discovered from an
/// ambient CWD or process-global index.
pub struct ModuleRegistry {
    libdirs: Vec<PathBuf>,
    cache: HashMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new(libdirs: Vec<PathBuf>) -> Self {
        ModuleRegistry { libdirs, cache: HashMap::new() }
    }

    pub fn libdirs(&self) -> &[PathBuf] {
        &self.libdirs
    }

    /// Locate the binary backing `info_name` of the given `kind` ("stage",
    /// "source", "input", "device", "mount"). Populates the descriptor cache
    /// on first lookup.
    pub fn resolve(&mut self, kind: &'static str, info_name: &str) -> Result<&Path, GraphError> {
        if !self.cache.contains_key(info_name) {
            let entry = self.discover(kind, info_name)?;
            self.cache.insert(info_name.to_string(), entry);
        }
        Ok(self.cache[info_name].binary.as_path())
    }

    pub fn describe(&mut self, kind: &'static str, info_name: &str) -> Result<&ModuleDescriptor, GraphError> {
        self.resolve(kind, info_name)?;
        Ok(&self.cache[info_name].descriptor)
    }

    fn discover(&self, kind: &'static str, info_name: &str) -> Result<ModuleEntry, GraphError> {
        for dir in &self.libdirs {
            let binary = dir.join(info_name);
            if !binary.is_file() {
                continue;
            }
            let descriptor = self.load_sidecar(&binary).or_else(|| self.query_describe(&binary))
                .ok_or_else(|| GraphError::Validation(format!("module {info_name} has no schema metadata")))?;
            return Ok(ModuleEntry { binary, descriptor });
        }
        Err(GraphError::UnknownModule { kind, name: info_name.to_string() })
    }

    fn load_sidecar(&self, binary: &Path) -> Option<ModuleDescriptor> {
        let sidecar = binary.with_extension("meta.json");
        let text = std::fs::read_to_string(sidecar).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn query_describe(&self, binary: &Path) -> Option<ModuleDescriptor> {
        let result = Cmd::new(binary).arg("--describe").run().ok()?;
        if !result.success() {
            return None;
        }
        serde_json::from_slice(&result.stdout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn unknown_module_reports_kind_and_name() {
        let mut registry = ModuleRegistry::new(vec![]);
        let err = registry.resolve("stage", "org.osbuild.nope").unwrap_err();
        assert!(matches!(err, GraphError::UnknownModule { kind: "stage", .. }));
    }

    #[test]
    fn sidecar_metadata_is_preferred_over_describe() {
        let dir = tempfile::TempDir::new().unwrap();
        let binary = dir.path().join("org.osbuild.testing.noop");
        std::fs::write(&binary, b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let sidecar = dir.path().join("org.osbuild.testing.noop.meta.json");
        let mut f = std::fs::File::create(&sidecar).unwrap();
        write!(f, r#"{{"summary": "does nothing"}}"#).unwrap();

        let mut registry = ModuleRegistry::new(vec![dir.path().to_path_buf()]);
        let descriptor = registry.describe("stage", "org.osbuild.testing.noop").unwrap();
        assert_eq!(descriptor.summary, "does nothing");
    }
}
