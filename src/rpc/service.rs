//! Service dispatch and the process-wide service registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::error::GraphError;
use crate::rpc::{FdSet, Socket};

/// How long a dispatcher thread waits on `accept` before re-checking its
/// shutdown flag.
const ACCEPT_POLL_MS: i32 = 200;

/// Implemented by each auxiliary service (store, remoteloop, input, device,
/// mount). `dispatch` handles one already-decoded request and returns a
/// reply payload plus any descriptors to send back. `Send + Sync` so a
/// [`ServiceManager`] can serve each endpoint from its own background
/// thread for the sandboxed child's lifetime.
pub trait Service: Send + Sync {
    /// The fixed endpoint name this service is bind-mounted under
    /// (`/run/osbuild/api/<name>`).
    fn name(&self) -> &'static str;

    fn dispatch(
        &self,
        method: &str,
        args: serde_json::Value,
        fds: &mut FdSet,
    ) -> Result<(serde_json::Value, Vec<std::os::fd::OwnedFd>), GraphError>;
}

/// A running service: its bound listening socket (bind-mounted into the
/// sandbox at `socket_path`) and the handler that serves requests on it.
struct RunningService {
    socket_path: PathBuf,
    listener: Socket,
    handler: Box<dyn Service>,
}

/// Owns every registered service for one build root. Services are served by
/// a dedicated accept loop per socket; torn down in LIFO order on drop.
pub struct ServiceManager {
    run_dir: PathBuf,
    services: Vec<RunningService>,
}

impl ServiceManager {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        ServiceManager {
            run_dir: run_dir.into(),
            services: Vec::new(),
        }
    }

    /// Register `service` under its fixed endpoint name, binding a real
    /// listening socket at its bind-mount path so the sandbox side has
    /// something to connect to. Fails if the name is already taken.
    pub fn register(&mut self, service: Box<dyn Service>) -> Result<PathBuf, GraphError> {
        let name = service.name();
        if self.services.iter().any(|s| s.handler.name() == name) {
            return Err(GraphError::Protocol(format!("service '{name}' already registered")));
        }
        std::fs::create_dir_all(&self.run_dir)
            .map_err(|e| GraphError::Protocol(format!("creating run dir: {e}")))?;
        let socket_path = self.run_dir.join(name);
        let listener = Socket::bind_listen(&socket_path)?;
        info!("registering service '{name}' at {}", socket_path.display());
        self.services.push(RunningService { socket_path: socket_path.clone(), listener, handler: service });
        Ok(socket_path)
    }

    /// Accept one connection on the named service's listening socket,
    /// waiting at most `timeout_ms` so a dispatcher loop can re-check its
    /// shutdown flag between waits.
    fn accept_timeout(&self, name: &str, timeout_ms: i32) -> Result<Option<Socket>, GraphError> {
        self.services
            .iter()
            .find(|s| s.handler.name() == name)
            .ok_or_else(|| GraphError::UnknownModule { kind: "service", name: name.to_string() })?
            .listener
            .accept_timeout(timeout_ms)
    }

    /// Spawn one background thread per registered service, each looping
    /// accept/dispatch on that service's socket until `stop` is set. This is
    /// what actually makes the bind-mounted sockets reachable from inside
    /// the sandbox: registering a service only binds the listener, it takes
    /// a live accept loop on the other end for a stage binary's connect to
    /// complete.
    pub fn spawn_dispatchers(self: &Arc<Self>, stop: &Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        self.services
            .iter()
            .map(|s| s.handler.name())
            .map(|name| {
                let manager = Arc::clone(self);
                let stop = Arc::clone(stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        match manager.accept_timeout(name, ACCEPT_POLL_MS) {
                            Ok(Some(peer)) => {
                                if let Err(err) = manager.handle_one(name, &peer) {
                                    warn!("service '{name}' request failed: {err}");
                                }
                            }
                            Ok(None) => continue,
                            Err(err) => {
                                warn!("service '{name}' accept failed: {err}");
                                break;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    pub fn socket_paths(&self) -> Vec<(&'static str, PathBuf)> {
        self.services
            .iter()
            .map(|s| (s.handler.name(), s.socket_path.clone()))
            .collect()
    }

    /// Serve one request-reply cycle with an already-accepted peer. Called
    /// from each service's dispatcher thread spawned by
    /// [`ServiceManager::spawn_dispatchers`].
    pub fn handle_one(&self, name: &str, peer: &Socket) -> Result<(), GraphError> {
        let service = self
            .services
            .iter()
            .find(|s| s.handler.name() == name)
            .ok_or_else(|| GraphError::UnknownModule { kind: "service", name: name.to_string() })?;

        let (request, mut fds) = peer.recv()?;
        let method = request
            .get("method")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GraphError::Protocol("missing 'method'".into()))?
            .to_string();
        let args = request.get("args").cloned().unwrap_or(serde_json::Value::Null);
        debug!("dispatching {name}.{method}");

        match service.handler.dispatch(&method, args, &mut fds) {
            Ok((reply, reply_fds)) => {
                let raw_fds: Vec<std::os::fd::RawFd> =
                    reply_fds.iter().map(std::os::fd::AsRawFd::as_raw_fd).collect();
                peer.send(&serde_json::json!({"result": reply}), &raw_fds)?;
            }
            Err(err) => {
                peer.send(
                    &serde_json::json!({
                        "method": crate::rpc::EXCEPTION_METHOD,
                        "kind": error_kind(&err),
                        "message": err.to_string(),
                    }),
                    &[],
                )?;
            }
        }
        Ok(())
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

fn error_kind(err: &GraphError) -> &'static str {
    match err {
        GraphError::Validation(_) => "validation",
        GraphError::UnknownModule { .. } => "unknown_module",
        GraphError::Cycle(_) => "cycle",
        GraphError::BusyRead => "busy_read",
        GraphError::BusyWrite => "busy_write",
        GraphError::InUse => "in_use",
        GraphError::Protocol(_) => "protocol",
        GraphError::Remote { .. } => "remote",
        GraphError::Mount(_) => "mount",
        GraphError::Device(_) => "device",
        GraphError::Loop(_) => "loop",
        GraphError::StageFailed { .. } => "stage_failed",
        GraphError::Timeout { .. } => "timeout",
        GraphError::Cancelled => "cancelled",
        GraphError::ReadOnly => "read_only",
    }
}

/// Index of [`ServiceManager`]s keyed by build-root id, for the rare case a
/// driver wants to inspect another build root's services (debugging only).
#[derive(Default)]
pub struct ServiceRegistry {
    managers: HashMap<String, PathBuf>,
}

impl ServiceRegistry {
    pub fn record(&mut self, build_root_id: &str, run_dir: PathBuf) {
        self.managers.insert(build_root_id.to_string(), run_dir);
    }

    pub fn remove(&mut self, build_root_id: &str) {
        self.managers.remove(build_root_id);
    }
}
