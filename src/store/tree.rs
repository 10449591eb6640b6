//! Filesystem primitives shared by the object store and the sandbox: atomic
//! rename-with-fallback, recursive tree copy preserving mode/owner/symlinks,
//! and content hashing.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Rename `src` to `dst`, falling back to copy+remove across filesystems (EXDEV).
pub fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) if src.is_dir() => {
            copy_dir_recursive(src, dst)?;
            fs::remove_dir_all(src)
                .with_context(|| format!("failed to remove {}", src.display()))?;
            Ok(())
        }
        Err(_) => {
            fs::copy(src, dst)
                .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Recursively copy `src` into `dst`, preserving symlinks, permission bits,
/// and ownership. Used both for copy-on-write object initialization and for
/// export to a destination directory.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    copy_dir_recursive_opt(src, dst, true)
}

/// As [`copy_dir_recursive`], but `preserve_owner` controls whether uid/gid
/// are chowned to match the source (export with `preserve_owner=false` keeps
/// the exporting process's own ownership).
pub fn copy_dir_recursive_opt(src: &Path, dst: &Path, preserve_owner: bool) -> Result<()> {
    fs::create_dir_all(dst)?;
    let meta = fs::symlink_metadata(src)?;
    apply_mode_and_owner(dst, &meta, preserve_owner)?;

    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || fs::symlink_metadata(&dst_path).is_ok() {
                let _ = fs::remove_file(&dst_path);
            }
            symlink(&target, &dst_path).with_context(|| {
                format!("failed to recreate symlink {}", dst_path.display())
            })?;
        } else if file_type.is_dir() {
            copy_dir_recursive_opt(&src_path, &dst_path, preserve_owner)?;
        } else if file_type.is_file() {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!("failed to copy {} to {}", src_path.display(), dst_path.display())
            })?;
            let meta = fs::metadata(&src_path)?;
            apply_mode_and_owner(&dst_path, &meta, preserve_owner)?;
        }
        // Sockets/FIFOs/devices: the object store never expects to carry these
        // inside a build tree; skip silently as the original implementation does.
    }

    Ok(())
}

fn apply_mode_and_owner(path: &Path, meta: &fs::Metadata, preserve_owner: bool) -> Result<()> {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(meta.permissions().mode()));
    if preserve_owner {
        let uid = meta.uid();
        let gid = meta.gid();
        // Best effort: only root can chown to an arbitrary uid/gid; ignore EPERM.
        let _ = nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        );
    }
    Ok(())
}

/// Clamp `path`'s mtime to `epoch` if it currently exceeds it. Handles files,
/// directories, and symlinks (via `lutimes`-equivalent, i.e. without
/// following the link).
pub fn clamp_mtime(path: &Path, epoch: u64) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    let mtime = meta.mtime();
    if mtime <= epoch as i64 {
        return Ok(());
    }
    let ts = nix::sys::time::TimeSpec::new(epoch as i64, 0);
    let times = [ts, ts];
    let flags = if meta.file_type().is_symlink() {
        nix::sys::stat::UtimensatFlags::NoFollowSymlink
    } else {
        nix::sys::stat::UtimensatFlags::FollowSymlink
    };
    nix::sys::stat::utimensat(
        nix::fcntl::AT_FDCWD,
        path,
        &times[0],
        &times[1],
        flags,
    )
    .with_context(|| format!("failed to clamp mtime on {}", path.display()))?;
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{n}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copy_dir_recursive_preserves_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/file.txt"), b"hi").unwrap();
        symlink("sub/file.txt", src.join("link")).unwrap();

        let dst = tmp.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("sub/file.txt")).unwrap(), b"hi");
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("sub/file.txt"));
    }

    #[test]
    fn clamp_mtime_lowers_future_timestamps() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, b"x").unwrap();
        let future = now_unix() + 100_000;
        nix::sys::stat::utimensat(
            nix::fcntl::AT_FDCWD,
            &file,
            &nix::sys::time::TimeSpec::new(future as i64, 0),
            &nix::sys::time::TimeSpec::new(future as i64, 0),
            nix::sys::stat::UtimensatFlags::FollowSymlink,
        )
        .unwrap();

        let epoch = now_unix();
        clamp_mtime(&file, epoch).unwrap();
        let meta = fs::metadata(&file).unwrap();
        assert!(meta.mtime() as u64 <= epoch);
    }
}
