//! Process-wide configuration: store root, libdir search path, stage
//! timeout, and export ownership policy. No config-file format is
//! introduced; everything is environment-derived with sane defaults,
//! mirroring how the host-tool preflight checks resolve paths.

use std::path::PathBuf;

const ENV_STORE: &str = "IMAGEGRAPH_STORE";
const ENV_LIBDIR: &str = "IMAGEGRAPH_LIBDIR";
const ENV_STAGE_TIMEOUT: &str = "IMAGEGRAPH_STAGE_TIMEOUT_SECS";
const ENV_PRESERVE_OWNER: &str = "IMAGEGRAPH_NO_PRESERVE_OWNER";

#[derive(Debug, Clone)]
pub struct Config {
    pub store_root: PathBuf,
    pub libdirs: Vec<PathBuf>,
    pub stage_timeout_secs: Option<u64>,
    pub preserve_owner_on_export: bool,
}

impl Config {
    /// Load configuration from the environment, falling back to
    /// `~/.cache/imagegraph` for the store root when unset.
    pub fn from_env() -> Self {
        let store_root = std::env::var_os(ENV_STORE)
            .map(PathBuf::from)
            .unwrap_or_else(default_store_root);

        let libdirs = std::env::var_os(ENV_LIBDIR)
            .map(|v| std::env::split_paths(&v).collect())
            .unwrap_or_else(|| vec![PathBuf::from("/usr/lib/imagegraph")]);

        let stage_timeout_secs = std::env::var(ENV_STAGE_TIMEOUT)
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        let preserve_owner_on_export = std::env::var_os(ENV_PRESERVE_OWNER).is_none();

        Config {
            store_root,
            libdirs,
            stage_timeout_secs,
            preserve_owner_on_export,
        }
    }
}

fn default_store_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("imagegraph")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_store_root_is_under_cache_dir() {
        let root = default_store_root();
        assert!(root.ends_with("imagegraph"));
    }
}
