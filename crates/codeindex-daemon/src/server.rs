//! Unix-socket daemon server (C10).
//!
//! The bind call IS the single-daemon lock (spec §4.10): a successful
//! `bind` on `daemon.sock` means no other daemon is using it. If the
//! socket file exists but `connect` to it doesn't answer within 100 ms,
//! the server treats it as an abandoned socket from a crashed process,
//! unlinks it, and retries the bind once. Each accepted connection is
//! dispatched onto its own OS thread — thread-per-connection is adequate
//! at the expected concurrency (spec §4.10: fewer than a few hundred
//! concurrent clients) and keeps the daemon core on the same
//! OS-thread-per-task model the rest of this crate uses.

use std::io::{self};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use codeindex_core::collaborators::{Chunker, EmbeddingProvider, GitTopology};
use codeindex_core::types::CollectionKey;
use codeindex_core::watch::WatchDeps;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, ErrorPayload};
use crate::protocol::{read_frame, write_frame, Frame};
use crate::service::{CleanParams, DaemonService, IndexParams, QueryFilters};

const STALE_SOCKET_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// External collaborators the daemon needs at the RPC boundary but does not
/// implement itself (spec §1, §6): embedding, chunking, git topology.
/// Injected once at server construction as trait objects, not looked up
/// through a process-global.
pub struct Collaborators {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub chunker: Arc<dyn Chunker>,
    pub git: Arc<dyn GitTopology>,
}

/// Returned by [`Server::bind`] when another daemon already owns the
/// socket (a live peer answered the stale-socket probe).
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("daemon already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Server {
    socket_path: PathBuf,
    project_path: PathBuf,
    listener: UnixListener,
    service: Arc<DaemonService>,
    collaborators: Arc<Collaborators>,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    max_connections: usize,
}

impl Server {
    /// Binds `socket_path`, performing the stale-socket probe/cleanup
    /// sequence if a leftover file is present. `project_path` is the
    /// project this daemon serves (one socket per project, spec §3).
    pub fn bind(
        socket_path: PathBuf,
        project_path: PathBuf,
        config: DaemonConfig,
        collaborators: Collaborators,
    ) -> Result<Self, BindError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if probe_is_alive(&socket_path) {
                    return Err(BindError::AlreadyRunning(socket_path));
                }
                std::fs::remove_file(&socket_path)?;
                UnixListener::bind(&socket_path)?
            }
            Err(e) => return Err(e.into()),
        };

        let max_connections = config.max_concurrent_connections;
        let service = Arc::new(DaemonService::new(config));
        *service.state.watch_deps.lock() = Some(Arc::new(WatchDeps {
            chunker: collaborators.chunker.clone(),
            embedder: collaborators.embedder.clone(),
            git: collaborators.git.clone(),
        }));

        Ok(Self {
            socket_path,
            project_path,
            listener,
            service,
            collaborators: Arc::new(collaborators),
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            max_connections,
        })
    }

    pub fn service(&self) -> &Arc<DaemonService> {
        &self.service
    }

    /// Registers SIGINT/SIGTERM handlers that unlink the socket and call
    /// `shutdown()` through the normal termination path — never an
    /// `_exit`-style abrupt call, so the socket-unlink and cache-drop code
    /// below always runs (spec §9's fix for the original's `SystemExit`
    /// shutdown bypassing cleanup).
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let shutdown = self.shutdown.clone();
        let service = self.service.clone();
        let socket_path = self.socket_path.clone();
        std::thread::Builder::new()
            .name("codeindex-signals".into())
            .spawn(move || {
                for _ in signals.forever() {
                    shutdown.store(true, Ordering::SeqCst);
                    service.shutdown();
                    let _ = std::fs::remove_file(&socket_path);
                    std::process::exit(0);
                }
            })?;
        Ok(())
    }

    /// Polls for an idle-shutdown request raised by a per-collection
    /// `EvictionThread` (spec §9 Open Question — `EvictionThread` itself
    /// already withholds the request while a watch is active, so this side
    /// only has to act on it). The accept loop blocks on `incoming()`, so
    /// this runs on its own thread rather than interleaving with `serve`.
    pub fn spawn_idle_shutdown_watcher(&self) {
        let service = self.service.clone();
        let socket_path = self.socket_path.clone();
        let shutdown = self.shutdown.clone();
        let interval = service.state.config.eviction_check_interval();
        std::thread::Builder::new()
            .name("codeindex-idle-watch".into())
            .spawn(move || loop {
                std::thread::sleep(interval);
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if service.state.shutdown_requested() {
                    service.shutdown();
                    let _ = std::fs::remove_file(&socket_path);
                    std::process::exit(0);
                }
            })
            .expect("failed to spawn idle-shutdown watcher");
    }

    /// Accepts connections until `shutdown()` is observed, dispatching each
    /// onto its own thread. Blocks the calling thread.
    pub fn serve(&self) -> io::Result<()> {
        self.listener.set_nonblocking(false)?;
        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(s) => s,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if self.active_connections.load(Ordering::SeqCst) >= self.max_connections {
                drop(stream);
                continue;
            }

            let service = self.service.clone();
            let collaborators = self.collaborators.clone();
            let project_path = self.project_path.clone();
            let active = self.active_connections.clone();
            active.fetch_add(1, Ordering::SeqCst);

            std::thread::spawn(move || {
                handle_connection(stream, service, collaborators, project_path);
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.service.shutdown();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Connects to `socket_path` with a short timeout; a successful connect
/// means a live peer is listening (the socket is not stale).
fn probe_is_alive(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).is_ok() || {
        // A connect refusal (ECONNREFUSED) still means the file is stale;
        // only an immediate timeout-free success counts as "alive". Retry
        // once within the probe budget in case of a slow accept queue.
        std::thread::sleep(STALE_SOCKET_PROBE_TIMEOUT);
        UnixStream::connect(socket_path).is_ok()
    }
}

fn handle_connection(
    stream: UnixStream,
    service: Arc<DaemonService>,
    collaborators: Arc<Collaborators>,
    project_path: PathBuf,
) {
    let writer = match stream.try_clone() {
        Ok(w) => Arc::new(Mutex::new(w)),
        Err(_) => return,
    };
    let mut reader = stream;

    loop {
        let frame = match read_frame(&mut reader) {
            Ok(f) => f,
            Err(_) => return,
        };
        let Frame::Request { id, method, params } = frame else {
            continue;
        };

        let payload = dispatch(
            &service,
            &collaborators,
            &project_path,
            &method,
            params,
            &writer,
            id,
        );
        let response = Frame::Response { id, payload };
        let mut w = writer.lock().unwrap();
        if write_frame(&mut *w, &response).is_err() {
            return;
        }
    }
}

fn collection_key(project_path: &Path, params: &Value) -> CollectionKey {
    let collection = params
        .get("collection")
        .and_then(Value::as_str)
        .unwrap_or("default");
    CollectionKey::new(project_path, collection)
}

fn error_value(e: DaemonError) -> Value {
    serde_json::to_value(ErrorPayload::from(&e)).unwrap_or_else(|_| {
        json!({"status": "error", "message": "serialization failure"})
    })
}

fn success(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.insert("status".to_string(), json!("success"));
            Value::Object(map)
        }
        other => json!({"status": "success", "result": other}),
    }
}

/// Routes one request to the matching `DaemonService` operation. Params are
/// decoded from the generic JSON payload; malformed params surface as
/// `InvalidInput` rather than panicking the connection thread.
fn dispatch(
    service: &Arc<DaemonService>,
    collaborators: &Arc<Collaborators>,
    project_path: &Path,
    method: &str,
    params: Value,
    writer: &Arc<Mutex<UnixStream>>,
    request_id: u64,
) -> Value {
    let key = collection_key(project_path, &params);
    let run = || -> crate::Result<Value> {
        match method {
            "query" => {
                let query_text = param_str(&params, "query")?;
                let limit = param_usize(&params, "limit", 10);
                let filters: QueryFilters = params
                    .get("filters")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
                    .unwrap_or_default();
                let result = service.query(
                    &key,
                    &query_text,
                    limit,
                    &filters,
                    collaborators.embedder.as_ref(),
                )?;
                Ok(serde_json::to_value(result).unwrap())
            }
            "query_fts" => {
                let query_text = param_str(&params, "query")?;
                let opts = params
                    .get("options")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
                    .unwrap_or_default();
                let result = service.query_fts(&key, &query_text, &opts)?;
                Ok(json!({"results": result}))
            }
            "query_hybrid" => {
                let query_text = param_str(&params, "query")?;
                let limit = param_usize(&params, "limit", 10);
                let result = service.query_hybrid(
                    &key,
                    &query_text,
                    limit,
                    collaborators.embedder.as_ref(),
                )?;
                Ok(json!({"results": result}))
            }
            "query_temporal" => {
                let query_text = param_str(&params, "query")?;
                let time_range = param_str(&params, "time_range")?;
                let limit = param_usize(&params, "limit", 10);
                let result = service.query_temporal(
                    &key,
                    &query_text,
                    &time_range,
                    limit,
                    collaborators.embedder.as_ref(),
                )?;
                Ok(serde_json::to_value(result).unwrap())
            }
            "index" => {
                let index_params: IndexParams = params
                    .get("params")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
                    .unwrap_or_default();
                let writer = writer.clone();
                let progress: codeindex_core::indexing::ProgressCallback =
                    Arc::new(move |current, total, path, info, _concurrent| {
                        let frame = Frame::Progress {
                            id: request_id,
                            current,
                            total,
                            path: path.to_string(),
                            info: info.to_string(),
                        };
                        if let Ok(mut w) = writer.lock() {
                            let _ = write_frame(&mut *w, &frame);
                        }
                    });
                let stats = service.index(
                    &key,
                    index_params,
                    progress,
                    collaborators.chunker.as_ref(),
                    collaborators.embedder.as_ref(),
                )?;
                Ok(serde_json::to_value(stats).unwrap())
            }
            "clean" => {
                let clean_params: CleanParams = params
                    .get("params")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
                    .unwrap_or_default();
                service.clean(&key, clean_params)?;
                Ok(json!({}))
            }
            "clean_data" => {
                service.clean_data(&key)?;
                Ok(json!({}))
            }
            "watch_start" => {
                let root = params
                    .get("root")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| project_path.to_path_buf());
                service.watch_start(root, &key)?;
                Ok(json!({}))
            }
            "watch_stop" => {
                let stats = service.watch_stop();
                Ok(serde_json::to_value(stats).unwrap())
            }
            "watch_status" => {
                let (running, project, stats) = service.watch_status();
                Ok(json!({
                    "running": running,
                    "project": project.map(|p| p.display().to_string()),
                    "stats": stats,
                }))
            }
            "status" => Ok(serde_json::to_value(service.status(&key)).unwrap()),
            "clear_cache" => {
                service.clear_cache();
                Ok(json!({}))
            }
            "shutdown" => {
                service.shutdown();
                Ok(json!({}))
            }
            other => Err(DaemonError::Protocol(format!("unknown method: {other}"))),
        }
    };

    match run() {
        Ok(payload) => success(payload),
        Err(e) => error_value(e),
    }
}

fn param_str(params: &Value, key: &str) -> crate::Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DaemonError::InvalidInput(format!("missing param: {key}")))
}

fn param_usize(params: &Value, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeindex_core::collaborators::{Chunk, GitCliTopology};
    use codeindex_core::error::Result as IndexResult;

    struct ZeroEmbedder;
    impl EmbeddingProvider for ZeroEmbedder {
        fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimensions(&self) -> usize {
            4
        }
    }

    struct NoopChunker;
    impl Chunker for NoopChunker {
        fn chunk(&self, _path: &Path, _content: &str) -> IndexResult<Vec<Chunk>> {
            Ok(Vec::new())
        }
    }

    fn collaborators(dir: &Path) -> Collaborators {
        Collaborators {
            embedder: Arc::new(ZeroEmbedder),
            chunker: Arc::new(NoopChunker),
            git: Arc::new(GitCliTopology::new(dir)),
        }
    }

    #[test]
    fn bind_then_rebind_without_listener_cleans_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");

        let server = Server::bind(
            socket_path.clone(),
            dir.path().to_path_buf(),
            DaemonConfig::default(),
            collaborators(dir.path()),
        )
        .unwrap();
        drop(server);
        // The listener's Drop does not unlink on some platforms if the
        // process holding it never called shutdown(); simulate a crash by
        // leaving the socket file behind.
        if !socket_path.exists() {
            std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        }

        let second = Server::bind(
            socket_path.clone(),
            dir.path().to_path_buf(),
            DaemonConfig::default(),
            collaborators(dir.path()),
        );
        assert!(second.is_ok());
    }

    #[test]
    fn bind_twice_without_stale_cleanup_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");

        let first = Server::bind(
            socket_path.clone(),
            dir.path().to_path_buf(),
            DaemonConfig::default(),
            collaborators(dir.path()),
        )
        .unwrap();

        let second = Server::bind(
            socket_path.clone(),
            dir.path().to_path_buf(),
            DaemonConfig::default(),
            collaborators(dir.path()),
        );
        assert!(matches!(second, Err(BindError::AlreadyRunning(_))));
        drop(first);
    }

    #[test]
    fn dispatch_unknown_method_returns_error_payload() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(DaemonService::new(DaemonConfig::default()));
        let collaborators = Arc::new(collaborators(dir.path()));
        let (a, _b) = UnixStream::pair().unwrap();
        let writer = Arc::new(Mutex::new(a));

        let result = dispatch(
            &service,
            &collaborators,
            dir.path(),
            "not_a_method",
            json!({}),
            &writer,
            1,
        );
        assert_eq!(result["status"], "error");
    }

    #[test]
    fn dispatch_status_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(DaemonService::new(DaemonConfig::default()));
        let collaborators = Arc::new(collaborators(dir.path()));
        let (a, _b) = UnixStream::pair().unwrap();
        let writer = Arc::new(Mutex::new(a));

        let result = dispatch(
            &service,
            &collaborators,
            dir.path(),
            "status",
            json!({}),
            &writer,
            1,
        );
        assert_eq!(result["status"], "success");
    }
}
