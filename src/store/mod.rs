//! Content-addressed object store: copy-on-write filesystem trees with
//! atomic ref publication.
//!
//! Layout on disk, rooted at `<root>`:
//!
//! ```text
//! objects/<uuid>/            backing trees + per-object metadata sidecar
//! refs/<id>       -> ../objects/<uuid>   (symlink)
//! sources/<info>/...         per-source fetch caches
//! tmp/                       scratch dirs
//! ```
//!
//! An [`Object`] starts in [`ObjectMode::Write`], is optionally initialized
//! from a base object (copy-on-write clone), mutated in place, then
//! finalized into [`ObjectMode::Read`] and committed under a content id.
//! Reader/writer counters exist only to catch API misuse (see spec's
//! concurrency note): the store assumes a single owner thread per `Object`.

mod tree;

pub use tree::{
    atomic_rename, clamp_mtime, copy_dir_recursive, copy_dir_recursive_opt, now_unix, sha256_file,
    tmp_name,
};

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectMode {
    Write,
    Read,
}

/// A filesystem tree under construction or committed in the store.
#[derive(Debug)]
pub struct Object {
    uuid: Uuid,
    mode: Cell<ObjectMode>,
    base_id: Option<String>,
    tree_path: PathBuf,
    metadata_dir: PathBuf,
    initialized: Cell<bool>,
    readers: Cell<u32>,
    writer_active: Cell<bool>,
}

impl Object {
    pub fn tree_path(&self) -> &Path {
        &self.tree_path
    }

    pub fn mode(&self) -> ObjectMode {
        self.mode.get()
    }

    pub fn base_id(&self) -> Option<&str> {
        self.base_id.as_deref()
    }

    /// Copy the base tree into the working tree if a base was given and this
    /// hasn't already been initialized. Idempotent.
    pub fn init(&self, store: &ObjectStore) -> Result<(), GraphError> {
        if self.initialized.get() {
            return Ok(());
        }
        if let Some(base_id) = &self.base_id {
            let base_path = store.resolve_ref(base_id).ok_or_else(|| {
                GraphError::Validation(format!("base object {base_id} not found in store"))
            })?;
            // A checkpoint commit re-points this object's own base at the ref
            // it just published without relocating the backing directory, so
            // the resolved base and our tree can be the same path: skip the
            // copy rather than recurse a directory into itself.
            if base_path != self.tree_path {
                copy_dir_recursive(&base_path, &self.tree_path)
                    .map_err(|e| GraphError::Validation(e.to_string()))?;
            }
        } else {
            fs::create_dir_all(&self.tree_path)
                .map_err(|e| GraphError::Validation(e.to_string()))?;
        }
        self.initialized.set(true);
        Ok(())
    }

    /// Acquire exclusive write access to the tree. Fails if a reader is live
    /// or the object has already been finalized and committed: a published
    /// ref's backing directory must never be mutated after the fact.
    pub fn write(&self) -> Result<WriteGuard<'_>, GraphError> {
        if self.mode.get() == ObjectMode::Read {
            return Err(GraphError::ReadOnly);
        }
        if self.readers.get() > 0 {
            return Err(GraphError::BusyRead);
        }
        if self.writer_active.get() {
            return Err(GraphError::BusyWrite);
        }
        self.writer_active.set(true);
        Ok(WriteGuard { object: self })
    }

    /// Acquire a shared read view of the tree. Fails if a writer is live.
    pub fn read(&self) -> Result<ReadGuard<'_>, GraphError> {
        if self.writer_active.get() {
            return Err(GraphError::BusyWrite);
        }
        self.readers.set(self.readers.get() + 1);
        Ok(ReadGuard { object: self })
    }

    /// Bind a subtree of this object at `target`, returning the mount point.
    /// Used by the store service's `read-tree-at` and by input materialization.
    pub fn read_at(&self, target: &Path, subpath: &Path) -> Result<ReadAtGuard<'_>, GraphError> {
        let _guard = self.read()?;
        let source = self.tree_path.join(subpath);
        fs::create_dir_all(target).map_err(|e| GraphError::Mount(e.to_string()))?;
        bind_mount(&source, target).map_err(|e| GraphError::Mount(e.to_string()))?;
        Ok(ReadAtGuard {
            _read: _guard,
            target: target.to_path_buf(),
        })
    }

    /// Clamp mtimes to `source_epoch` (if set) and mark the object read-only.
    pub fn finalize(&self, source_epoch: Option<u64>) -> Result<(), GraphError> {
        if self.writer_active.get() {
            return Err(GraphError::InUse);
        }
        if let Some(epoch) = source_epoch {
            for entry in walkdir::WalkDir::new(&self.tree_path)
                .contents_first(true)
                .into_iter()
                .filter_map(std::result::Result::ok)
            {
                clamp_mtime(entry.path(), epoch)
                    .map_err(|e| GraphError::Validation(e.to_string()))?;
            }
        }
        self.mode.set(ObjectMode::Read);
        Ok(())
    }

    /// Returns true if the tree has an in-progress or completed write.
    pub fn is_writing(&self) -> bool {
        self.writer_active.get()
    }
}

/// RAII handle to a writable [`Object`] tree. Clears the writer flag on drop.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    object: &'a Object,
}

impl WriteGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.object.tree_path
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.object.writer_active.set(false);
    }
}

/// RAII handle to a read view of an [`Object`]. Decrements the reader count on drop.
pub struct ReadGuard<'a> {
    object: &'a Object,
}

impl ReadGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.object.tree_path
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.object.readers.set(self.object.readers.get().saturating_sub(1));
    }
}

/// RAII handle to a bind-mounted subtree. Unmounts on drop (best effort).
pub struct ReadAtGuard<'a> {
    _read: ReadGuard<'a>,
    target: PathBuf,
}

impl ReadAtGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.target
    }
}

impl Drop for ReadAtGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = bind_unmount(&self.target) {
            warn!("lazy unmount of {} failed: {e}", self.target.display());
        }
    }
}

pub(crate) fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        nix::mount::MsFlags::MS_BIND | nix::mount::MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("bind mount {} -> {}", source.display(), target.display()))
}

pub(crate) fn bind_unmount(target: &Path) -> Result<()> {
    nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH)
        .with_context(|| format!("umount {}", target.display()))
}

/// Summary stats over the store, for `inspect-store`.
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub object_count: u64,
    pub ref_count: u64,
    pub total_bytes: u64,
}

/// The content-addressed store root.
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn open(root: &Path) -> Result<Self> {
        let store = ObjectStore { root: root.to_path_buf() };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.objects_dir())?;
        fs::create_dir_all(self.refs_dir())?;
        fs::create_dir_all(self.sources_dir())?;
        fs::create_dir_all(self.tmp_dir())?;
        Ok(())
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.root.join("sources")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Directory where a named source's fetched items are cached.
    pub fn source_cache_dir(&self, info_name: &str) -> PathBuf {
        self.sources_dir().join(info_name)
    }

    fn ref_path(&self, id: &str) -> PathBuf {
        self.refs_dir().join(id)
    }

    /// Allocate a fresh [`Object`] in WRITE mode, optionally based on `base_id`.
    pub fn new_object(&self, base_id: Option<&str>) -> Result<Object, GraphError> {
        let uuid = Uuid::new_v4();
        let tree_path = self.objects_dir().join(uuid.to_string()).join("tree");
        let metadata_dir = self.objects_dir().join(uuid.to_string()).join("meta");
        fs::create_dir_all(&metadata_dir).map_err(|e| GraphError::Validation(e.to_string()))?;

        Ok(Object {
            uuid,
            mode: Cell::new(ObjectMode::Write),
            base_id: base_id.map(str::to_string),
            tree_path,
            metadata_dir,
            initialized: Cell::new(false),
            readers: Cell::new(0),
            writer_active: Cell::new(false),
        })
    }

    /// Resolve a committed ref to its backing tree path, if published.
    pub fn resolve_ref(&self, id: &str) -> Option<PathBuf> {
        let link = self.ref_path(id);
        let target = fs::read_link(&link).ok()?;
        let object_dir = if target.is_absolute() {
            target
        } else {
            self.refs_dir().join(target)
        };
        let tree = object_dir.join("tree");
        if tree.exists() {
            Some(tree)
        } else {
            None
        }
    }

    /// True if a committed ref with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.resolve_ref(id).is_some()
    }

    /// Atomically publish `object`'s workdir as `objects/<uuid>` and install
    /// `refs/<ref_id> -> ../objects/<uuid>`. Resets the object to a fresh
    /// READ-based-on-`ref_id` state so a subsequent `write()` re-initializes
    /// from the committed content (matching the reference implementation's
    /// re-resolve-base-after-commit behavior).
    pub fn commit(&self, object: &mut Object, ref_id: &str) -> Result<String, GraphError> {
        if object.writer_active.get() {
            return Err(GraphError::InUse);
        }

        let object_dir = self.objects_dir().join(object.uuid.to_string());
        // tree_path / metadata_dir already live under object_dir; nothing to
        // rename at the objects/ level since allocation already placed them
        // there. Install/replace the ref atomically.
        let tmp_link = self.tmp_dir().join(tree::tmp_name("ref"));
        let rel_target = Path::new("..").join("objects").join(object.uuid.to_string());
        std::os::unix::fs::symlink(&rel_target, &tmp_link)
            .map_err(|e| GraphError::Validation(e.to_string()))?;
        let dest = self.ref_path(ref_id);
        fs::create_dir_all(self.refs_dir()).map_err(|e| GraphError::Validation(e.to_string()))?;
        fs::rename(&tmp_link, &dest).map_err(|e| {
            let _ = fs::remove_file(&tmp_link);
            GraphError::Validation(e.to_string())
        })?;

        info!("committed object {} as ref {}", object.uuid, ref_id);

        object.base_id = Some(ref_id.to_string());
        object.initialized.set(false);
        object.mode.set(ObjectMode::Read);
        let _ = object_dir;
        Ok(object.uuid.to_string())
    }

    /// Copy a read view of `object` into `dst_dir`.
    pub fn export(&self, object: &Object, dst_dir: &Path, preserve_owner: bool) -> Result<(), GraphError> {
        let guard = object.read()?;
        debug!("exporting {} -> {}", guard.path().display(), dst_dir.display());
        copy_dir_recursive_opt(guard.path(), dst_dir, preserve_owner)
            .map_err(|e| GraphError::Validation(e.to_string()))
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let mut object_count = 0u64;
        let mut total_bytes = 0u64;
        if self.objects_dir().exists() {
            for entry in fs::read_dir(self.objects_dir())? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    object_count += 1;
                    for f in walkdir::WalkDir::new(entry.path()).into_iter().filter_map(Result::ok) {
                        if f.file_type().is_file() {
                            total_bytes += f.metadata().map(|m| m.len()).unwrap_or(0);
                        }
                    }
                }
            }
        }
        let ref_count = if self.refs_dir().exists() {
            fs::read_dir(self.refs_dir())?.count() as u64
        } else {
            0
        };
        Ok(StoreStatus {
            root: self.root.clone(),
            object_count,
            ref_count,
            total_bytes,
        })
    }

    /// Acquire an exclusive advisory lock scoped to `key`, for serializing
    /// concurrent commits of the same ref id across processes.
    pub fn lock(&self, key: &str) -> Result<StoreLock> {
        let dir = self.tmp_dir().join("locks");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{key}.lock"));
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(StoreLock { _file: file })
    }
}

/// RAII advisory lock released (and unlocked) on drop.
pub struct StoreLock {
    _file: fs::File,
}

/// Read-only view of the host filesystem, used as the build tree root when a
/// pipeline's `build_ref` is null ("use host tree").
pub struct HostTree {
    root: PathBuf,
}

impl HostTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        HostTree { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn read_at(&self, target: &Path, subpath: &Path) -> Result<ReadAtHostGuard, GraphError> {
        let source = self.root.join(subpath);
        fs::create_dir_all(target).map_err(|e| GraphError::Mount(e.to_string()))?;
        bind_mount(&source, target).map_err(|e| GraphError::Mount(e.to_string()))?;
        Ok(ReadAtHostGuard { target: target.to_path_buf() })
    }
}

pub struct ReadAtHostGuard {
    target: PathBuf,
}

impl ReadAtHostGuard {
    pub fn path(&self) -> &Path {
        &self.target
    }
}

impl Drop for ReadAtHostGuard {
    fn drop(&mut self) {
        if let Err(e) = bind_unmount(&self.target) {
            warn!("lazy unmount of {} failed: {e}", self.target.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ObjectStore) {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn commit_publishes_ref_atomically() {
        let (_tmp, store) = store();
        let mut obj = store.new_object(None).unwrap();
        obj.init(&store).unwrap();
        {
            let w = obj.write().unwrap();
            fs::write(w.path().join("hello.txt"), b"hi").unwrap();
        }
        obj.finalize(None).unwrap();
        let name = store.commit(&mut obj, "deadbeef").unwrap();
        assert!(!name.is_empty());
        assert!(store.contains("deadbeef"));
        let resolved = store.resolve_ref("deadbeef").unwrap();
        assert_eq!(fs::read(resolved.join("hello.txt")).unwrap(), b"hi");
    }

    #[test]
    fn write_while_reading_is_busy() {
        let (_tmp, store) = store();
        let obj = store.new_object(None).unwrap();
        obj.init(&store).unwrap();
        let _r = obj.read().unwrap();
        let err = obj.write().unwrap_err();
        assert!(matches!(err, GraphError::BusyRead));
    }

    #[test]
    fn contains_is_false_for_unknown_id() {
        let (_tmp, store) = store();
        assert!(!store.contains("0000000000000000000000000000000000000000000000000000000000000000"));
    }

    #[test]
    fn write_after_commit_is_rejected() {
        let (_tmp, store) = store();
        let mut obj = store.new_object(None).unwrap();
        obj.init(&store).unwrap();
        {
            let w = obj.write().unwrap();
            fs::write(w.path().join("hello.txt"), b"hi").unwrap();
        }
        obj.finalize(None).unwrap();
        store.commit(&mut obj, "published").unwrap();

        let err = obj.write().unwrap_err();
        assert!(matches!(err, GraphError::ReadOnly));

        // The published ref's content must be untouched by the rejected write.
        let resolved = store.resolve_ref("published").unwrap();
        assert_eq!(fs::read(resolved.join("hello.txt")).unwrap(), b"hi");
    }

    #[test]
    fn init_from_base_copies_content() {
        let (_tmp, store) = store();
        let mut base = store.new_object(None).unwrap();
        base.init(&store).unwrap();
        {
            let w = base.write().unwrap();
            fs::write(w.path().join("a"), b"base").unwrap();
        }
        base.finalize(None).unwrap();
        store.commit(&mut base, "baseid").unwrap();

        let child = store.new_object(Some("baseid")).unwrap();
        child.init(&store).unwrap();
        assert_eq!(fs::read(child.tree_path().join("a")).unwrap(), b"base");
    }
}
