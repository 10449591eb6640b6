//! Build root: the hermetic sandbox a single stage runs inside. Owns the
//! temp directories, the minimal `/dev`, the registered host-bridge
//! services, and the bubblewrap invocation that wires namespaces, bind
//! mounts, and capability restriction together.

mod caps_policy;
mod devnodes;

pub use caps_policy::default_allowed_capabilities;

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use caps::Capability;
use log::{debug, info};

use crate::error::GraphError;
use crate::rpc::ServiceManager;

/// How often the stage-watchdog loop polls the child's exit status while
/// waiting for it to finish, time out, or get cancelled.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Result of running the stage binary inside the sandbox.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub returncode: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// What to bind as the build tree root: either a committed store object or
/// the host filesystem (when a pipeline's `build_ref` is null).
pub enum BuildTreeRoot {
    Store(PathBuf),
    Host,
}

pub struct BuildRootSpec {
    pub tree_root: BuildTreeRoot,
    pub libdirs: Vec<PathBuf>,
    pub stage_binary: PathBuf,
    pub stage_name: String,
    pub extra_binds: Vec<(PathBuf, PathBuf)>,
    pub extra_capabilities: Vec<Capability>,
    pub source_epoch: Option<u64>,
    pub timeout_secs: Option<u64>,
}

/// An allocated, ready-to-run sandbox for one stage invocation.
///
/// `run_dir` is owned by the [`ServiceManager`] passed in at construction,
/// not allocated here, so a caller can register services before the build
/// root exists and have their socket paths bind-mount correctly.
pub struct BuildRoot {
    run_dir: PathBuf,
    dev_dir: tempfile::TempDir,
    var_dir: tempfile::TempDir,
    services: Arc<ServiceManager>,
    dispatcher_stop: Arc<AtomicBool>,
    dispatchers: Vec<JoinHandle<()>>,
    spec: BuildRootSpec,
}

impl BuildRoot {
    /// Step 1-3 of construction: scratch dirs, minimal `/dev`, service
    /// registration, and a background accept-and-serve thread per
    /// registered service so a stage binary dialing into its bind-mounted
    /// socket actually gets an answer.
    pub fn construct(spec: BuildRootSpec, services: ServiceManager) -> Result<Self> {
        let run_dir = services.run_dir().to_path_buf();
        std::fs::create_dir_all(&run_dir).context("allocating run dir")?;
        let dev_dir = tempfile::Builder::new()
            .prefix("imagegraph-dev-")
            .tempdir()
            .context("allocating dev dir")?;
        let var_dir = tempfile::Builder::new()
            .prefix("imagegraph-var-")
            .tempdir()
            .context("allocating var dir")?;

        nix::mount::mount(
            Some("tmpfs"),
            dev_dir.path(),
            Some("tmpfs"),
            nix::mount::MsFlags::MS_NOSUID,
            Some("mode=0755"),
        )
        .context("mounting tmpfs at dev dir")?;

        devnodes::create_minimal_devices(dev_dir.path())?;

        let services = Arc::new(services);
        let dispatcher_stop = Arc::new(AtomicBool::new(false));
        let dispatchers = services.spawn_dispatchers(&dispatcher_stop);

        info!("build root constructed: run={} dev={} var={}", run_dir.display(), dev_dir.path().display(), var_dir.path().display());

        Ok(BuildRoot { run_dir, dev_dir, var_dir, services, dispatcher_stop, dispatchers, spec })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    /// Step 4-5: invoke bwrap with the stage's arguments file bound in.
    pub fn run(&self, args_file: &Path) -> Result<RunResult, GraphError> {
        let mut cmd = Command::new("bwrap");
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        cmd.arg("--unshare-ipc").arg("--unshare-pid").arg("--unshare-net");

        match &self.spec.tree_root {
            BuildTreeRoot::Store(path) => {
                for dir in ["boot", "usr"] {
                    cmd.arg("--ro-bind").arg(path.join(dir)).arg(format!("/{dir}"));
                }
                for link in ["lib", "lib32", "lib64", "bin", "sbin"] {
                    cmd.arg("--symlink").arg(format!("usr/{link}")).arg(format!("/{link}"));
                }
            }
            BuildTreeRoot::Host => {
                for dir in ["boot", "usr"] {
                    cmd.arg("--ro-bind").arg(format!("/{dir}")).arg(format!("/{dir}"));
                }
                for link in ["lib", "lib32", "lib64", "bin", "sbin"] {
                    cmd.arg("--symlink").arg(format!("usr/{link}")).arg(format!("/{link}"));
                }
            }
        }

        cmd.arg("--bind").arg(self.dev_dir.path()).arg("/dev");
        cmd.arg("--tmpfs").arg("/dev/shm");
        cmd.arg("--dir").arg("/etc");
        cmd.arg("--tmpfs").arg("/run");
        cmd.arg("--tmpfs").arg("/tmp");
        cmd.arg("--bind").arg(self.var_dir.path()).arg("/var");
        cmd.arg("--proc").arg("/proc");
        cmd.arg("--ro-bind").arg("/sys").arg("/sys");

        for (i, libdir) in self.spec.libdirs.iter().enumerate() {
            cmd.arg("--ro-bind").arg(libdir).arg(format!("/run/osbuild/lib{i}"));
        }
        cmd.arg("--ro-bind")
            .arg(&self.spec.stage_binary)
            .arg(format!("/run/osbuild/bin/{}", self.spec.stage_name));

        for (endpoint, socket_path) in self.services.socket_paths() {
            cmd.arg("--bind").arg(&socket_path).arg(format!("/run/osbuild/api/{endpoint}"));
        }

        for (host, sandbox) in &self.spec.extra_binds {
            cmd.arg("--bind").arg(host).arg(sandbox);
        }

        cmd.arg("--ro-bind").arg(args_file).arg("/run/osbuild/arguments.json");

        cmd.env_clear();
        cmd.env("PATH", "/usr/sbin:/usr/bin");
        let libdir_path = (0..self.spec.libdirs.len())
            .map(|i| format!("/run/osbuild/lib{i}"))
            .collect::<Vec<_>>()
            .join(":");
        cmd.env("PYTHONPATH", libdir_path);
        if let Some(epoch) = self.spec.source_epoch {
            cmd.env("SOURCE_DATE_EPOCH", epoch.to_string());
        }

        let allowed = default_allowed_capabilities(&self.spec.extra_capabilities);
        apply_capability_bounding(&mut cmd, &allowed);

        cmd.arg(format!("/run/osbuild/bin/{}", self.spec.stage_name));
        cmd.arg("/run/osbuild/arguments.json");

        debug!("invoking bwrap for stage {}", self.spec.stage_name);
        let mut child = cmd.spawn().map_err(|e| GraphError::Mount(format!("spawning bwrap: {e}")))?;
        self.wait_with_watchdog(&mut child)
    }

    /// Poll the running stage child, watching for normal exit, a SIGINT
    /// (via [`crate::cancel`]), and the configured stage timeout. Output is
    /// drained only after the child actually exits or is killed, since
    /// `Child::wait`/`try_wait` don't themselves read the piped streams.
    fn wait_with_watchdog(&self, child: &mut Child) -> Result<RunResult, GraphError> {
        let deadline = self.spec.timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| GraphError::Mount(format!("waiting for bwrap: {e}")))?
            {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = std::io::Read::read_to_end(&mut out, &mut stdout);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = std::io::Read::read_to_end(&mut err, &mut stderr);
                }
                return Ok(RunResult { returncode: status.code().unwrap_or(-1), stdout, stderr });
            }

            if crate::cancel::requested() {
                kill_child(child);
                return Err(GraphError::Cancelled);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    kill_child(child);
                    return Err(GraphError::Timeout {
                        stage: self.spec.stage_name.clone(),
                        secs: self.spec.timeout_secs.unwrap_or(0),
                    });
                }
            }

            std::thread::sleep(WAIT_POLL);
        }
    }
}

fn kill_child(child: &mut Child) {
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL) {
        log::warn!("failed to kill timed-out/cancelled stage process {}: {e}", child.id());
    }
    let _ = child.wait();
}

impl Drop for BuildRoot {
    fn drop(&mut self) {
        self.dispatcher_stop.store(true, Ordering::SeqCst);
        for handle in self.dispatchers.drain(..) {
            let _ = handle.join();
        }
        if let Err(e) = nix::mount::umount2(self.dev_dir.path(), nix::mount::MntFlags::MNT_DETACH) {
            log::warn!("failed to unmount sandbox /dev tmpfs: {e}");
        }
        if let Err(e) = std::fs::remove_dir_all(&self.run_dir) {
            log::warn!("failed to remove run dir {}: {e}", self.run_dir.display());
        }
    }
}

fn apply_capability_bounding(cmd: &mut Command, allowed: &[Capability]) {
    let allowed = allowed.to_vec();
    unsafe {
        cmd.pre_exec(move || {
            let full = caps::all();
            for cap in full {
                if !allowed.contains(&cap) {
                    let _ = caps::drop(None, caps::CapSet::Bounding, cap);
                }
            }
            Ok(())
        });
    }
}

use std::os::unix::process::CommandExt;
