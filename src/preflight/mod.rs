//! Preflight checks for sandboxed builds.
//!
//! Validates that the host has the tools and kernel features a build root
//! depends on (namespaces, bind mounts, loop-control) before any pipeline
//! runs. This prevents cryptic mid-build failures from surfacing only after
//! a stage has already started.

use anyhow::{bail, Result};

use crate::process::command_exists;

/// Host tools every build root invocation needs. Each tuple is
/// (command_name, package_name) for the diagnostic message.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("bwrap", "bubblewrap"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mknod", "coreutils"),
];

/// Check that specific tools are available.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .copied()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    let msg = missing
        .iter()
        .map(|(t, p)| format!("  {} (install: {})", t, p))
        .collect::<Vec<_>>()
        .join("\n");
    bail!("missing required host tools:\n{}", msg);
}

/// Check that the host exposes a loop-control device for the Loopback service.
pub fn check_loop_control() -> Result<()> {
    if std::path::Path::new("/dev/loop-control").exists() {
        Ok(())
    } else {
        bail!("/dev/loop-control not present; loop devices unavailable")
    }
}

/// Run every host-readiness check a build root construction will need.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    check_loop_control()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_required_tools_passes_for_present_commands() {
        let tools = &[("sh", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn check_required_tools_fails_for_missing_commands() {
        let tools = &[("definitely_not_a_real_command_xyz", "fake-package")];
        assert!(check_required_tools(tools).is_err());
    }
}
