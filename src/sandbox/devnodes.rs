//! The fixed minimal device-node set created in the sandbox's private
//! tmpfs `/dev`, so a stage never sees the host's real device nodes.

use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

struct DevNode {
    name: &'static str,
    major: u64,
    minor: u64,
}

const NODES: &[DevNode] = &[
    DevNode { name: "full", major: 1, minor: 7 },
    DevNode { name: "null", major: 1, minor: 3 },
    DevNode { name: "random", major: 1, minor: 8 },
    DevNode { name: "urandom", major: 1, minor: 9 },
    DevNode { name: "tty", major: 5, minor: 0 },
    DevNode { name: "zero", major: 1, minor: 5 },
];

pub fn create_minimal_devices(dev_dir: &Path) -> Result<()> {
    for node in NODES {
        let path = dev_dir.join(node.name);
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(node.major, node.minor),
        )
        .with_context(|| format!("mknod {}", path.display()))?;
    }
    Ok(())
}
