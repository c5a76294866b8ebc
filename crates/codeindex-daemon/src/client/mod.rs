//! Client-side connect/backoff/restart-recovery/standalone-fallback engine
//! (C11).
//!
//! Deliberately synchronous (`std::os::unix::net::UnixStream`, no tokio) to
//! honor the <50ms startup budget spec §4.11 sets: the only things on the
//! hot import path are the socket, a minimal frame codec, and the terminal
//! renderer trait — never the indexing or embedding stack, which only
//! loads if the standalone path is actually taken.

mod backoff;
mod spawn;

use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use codeindex_core::collaborators::ProgressRenderer;
use codeindex_core::types::CollectionKey;

pub use backoff::RetrySchedule;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, ErrorPayload};
use crate::protocol::{read_frame, write_frame, Frame};
use crate::server::Collaborators;
use crate::standalone::Standalone;

/// Connects to (and, if needed, spawns) the per-project daemon, dispatching
/// RPCs with retry/restart/standalone-fallback per spec §4.11's connect
/// algorithm.
pub struct Client {
    socket_path: PathBuf,
    project_root: PathBuf,
    daemon_binary: PathBuf,
    config: DaemonConfig,
    collaborators: Collaborators,
    stream: Mutex<Option<UnixStream>>,
    next_id: AtomicU64,
}

impl Client {
    pub fn new(
        project_root: impl Into<PathBuf>,
        daemon_binary: impl Into<PathBuf>,
        config: DaemonConfig,
        collaborators: Collaborators,
    ) -> Self {
        let project_root = project_root.into();
        let socket_path = project_root.join(".code-indexer").join("daemon.sock");
        Self {
            socket_path,
            project_root,
            daemon_binary: daemon_binary.into(),
            config,
            collaborators,
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn default_collection(&self) -> CollectionKey {
        CollectionKey::new(self.project_root.clone(), "default")
    }

    /// Issues one request. On a mid-call connection failure, performs up to
    /// `restart_attempts_on_crash` full restart attempts (spec §4.11 step 6)
    /// before falling back to the in-process standalone path. `progress`,
    /// when given, is started before the RPC is issued (spec: "initialise
    /// the bottom-pinned live progress display before issuing the RPC").
    pub fn call(
        &self,
        method: &str,
        params: Value,
        progress: Option<&dyn ProgressRenderer>,
    ) -> crate::Result<Value> {
        if !self.config.enabled {
            return self.run_standalone(method, &params, "daemon disabled by config");
        }

        let mut attempts = 0u8;
        loop {
            match self.call_once(method, &params, progress) {
                Ok(value) => return Ok(value),
                Err(DaemonError::Io(e)) => {
                    if attempts >= self.config.restart_attempts_on_crash {
                        println!(
                            "Daemon unavailable after {} restart attempts, using standalone mode",
                            self.config.restart_attempts_on_crash
                        );
                        return self.run_standalone(method, &params, &e.to_string());
                    }
                    attempts += 1;
                    println!(
                        "Daemon connection failed, attempting restart ({attempts}/{})",
                        self.config.restart_attempts_on_crash
                    );
                    *self.stream.lock().unwrap() = None;
                    let _ = std::fs::remove_file(&self.socket_path);
                    if self.restart_and_reconnect().is_err() {
                        return self.run_standalone(method, &params, "daemon respawn failed");
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the connect algorithm's steps 3-4: spawns the daemon if the
    /// socket is absent, then connects with backoff. A no-op if already
    /// connected.
    pub fn ensure_connected(&self) -> crate::Result<()> {
        if self.stream.lock().unwrap().is_some() {
            return Ok(());
        }
        if !self.socket_path.exists() {
            spawn::spawn_detached(&self.daemon_binary, &self.project_root)?;
            spawn::wait_for_socket(&self.socket_path, Duration::from_secs(1))?;
        } else {
            println!("Daemon already running, skipping start");
        }
        let stream = self.connect_with_backoff()?;
        *self.stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    fn restart_and_reconnect(&self) -> crate::Result<()> {
        spawn::spawn_detached(&self.daemon_binary, &self.project_root)?;
        spawn::wait_for_socket(&self.socket_path, Duration::from_secs(1))?;
        let stream = self.connect_with_backoff()?;
        *self.stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    fn connect_with_backoff(&self) -> crate::Result<UnixStream> {
        let schedule = RetrySchedule::new(self.config.retry_delays_ms.clone());
        let mut last_err: Option<io::Error> = None;
        for delay in schedule.attempts() {
            match UnixStream::connect(&self.socket_path) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(delay);
                }
            }
        }
        UnixStream::connect(&self.socket_path).map_err(|e| DaemonError::Io(last_err.unwrap_or(e)))
    }

    fn call_once(
        &self,
        method: &str,
        params: &Value,
        progress: Option<&dyn ProgressRenderer>,
    ) -> crate::Result<Value> {
        self.ensure_connected()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Frame::Request {
            id,
            method: method.to_string(),
            params: params.clone(),
        };

        if let Some(renderer) = progress {
            renderer.start_bottom_display();
        }

        let mut guard = self.stream.lock().unwrap();
        let stream = guard
            .as_mut()
            .ok_or_else(|| DaemonError::Unavailable("not connected".into()))?;
        write_frame(stream, &request).map_err(DaemonError::Io)?;

        loop {
            let frame = read_frame(stream).map_err(DaemonError::Io)?;
            match frame {
                Frame::Response {
                    id: resp_id,
                    payload,
                } if resp_id == id => {
                    return decode_response(payload);
                }
                Frame::Progress {
                    id: progress_id,
                    current,
                    total,
                    path,
                    info,
                } if progress_id == id => {
                    if let Some(renderer) = progress {
                        if current == 0 && total == 0 {
                            renderer.handle_setup_message(&info);
                        } else {
                            renderer.update(current, total, &path, &info, None);
                        }
                    }
                }
                _ => continue,
            }
        }
    }

    /// The standalone path is triggered only by connectivity/spawn failures,
    /// never by a semantic error the daemon itself returned (spec §7): those
    /// already took the `Err(e)` branch in `call` before reaching here.
    fn run_standalone(&self, method: &str, params: &Value, reason: &str) -> crate::Result<Value> {
        Standalone::announce(reason);
        let standalone = Standalone::new(
            self.config.clone(),
            self.collaborators.embedder.clone(),
            self.collaborators.chunker.clone(),
            self.collaborators.git.clone(),
        );
        dispatch_standalone(&standalone, &self.project_root, method, params)
    }
}

fn decode_response(payload: Value) -> crate::Result<Value> {
    if payload.get("status").and_then(Value::as_str) == Some("error") {
        let err: ErrorPayload =
            serde_json::from_value(payload).map_err(|e| DaemonError::Protocol(e.to_string()))?;
        return Err(DaemonError::Protocol(err.message));
    }
    Ok(payload)
}

fn collection_key(project_path: &Path, params: &Value) -> CollectionKey {
    let collection = params
        .get("collection")
        .and_then(Value::as_str)
        .unwrap_or("default");
    CollectionKey::new(project_path, collection)
}

/// Mirrors `server::dispatch`'s method routing, but against the in-process
/// [`Standalone`] pipeline instead of a live daemon connection. Only the
/// read/write operations meaningful without a background watch or cache are
/// covered; `watch_*`/`status` still work since `Standalone` owns its own
/// (short-lived, process-local) `DaemonState`.
fn dispatch_standalone(
    standalone: &Standalone,
    project_path: &Path,
    method: &str,
    params: &Value,
) -> crate::Result<Value> {
    let key = collection_key(project_path, params);
    match method {
        "query" => {
            let query_text = params
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| DaemonError::InvalidInput("missing param: query".into()))?;
            let limit = params
                .get("limit")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(10);
            let filters = params
                .get("filters")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
                .unwrap_or_default();
            let response = standalone.query(&key, query_text, limit, &filters)?;
            Ok(serde_json::to_value(response).unwrap())
        }
        "query_fts" => {
            let query_text = params
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| DaemonError::InvalidInput("missing param: query".into()))?;
            let opts = params
                .get("options")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
                .unwrap_or_default();
            let results = standalone.query_fts(&key, query_text, &opts)?;
            Ok(serde_json::json!({"results": results}))
        }
        "query_hybrid" => {
            let query_text = params
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| DaemonError::InvalidInput("missing param: query".into()))?;
            let limit = params
                .get("limit")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .unwrap_or(10);
            let results = standalone.query_hybrid(&key, query_text, limit)?;
            Ok(serde_json::json!({"results": results}))
        }
        "index" => {
            let index_params = params
                .get("params")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| DaemonError::InvalidInput(e.to_string()))?
                .unwrap_or_default();
            let progress: codeindex_core::indexing::ProgressCallback =
                std::sync::Arc::new(|_, _, _, _, _| {});
            let stats = standalone.index(&key, index_params, progress)?;
            Ok(serde_json::to_value(stats).unwrap())
        }
        "watch_start" => {
            let root = params
                .get("root")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .unwrap_or_else(|| project_path.to_path_buf());
            standalone.watch_start(root, &key)?;
            Ok(serde_json::json!({}))
        }
        "status" => Ok(serde_json::to_value(standalone.status(&key)).unwrap()),
        other => Err(DaemonError::Protocol(format!(
            "unsupported standalone method: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeindex_core::collaborators::{Chunk, GitCliTopology};
    use codeindex_core::error::Result as IndexResult;

    struct ZeroEmbedder;
    impl codeindex_core::collaborators::EmbeddingProvider for ZeroEmbedder {
        fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimensions(&self) -> usize {
            4
        }
    }

    struct NoopChunker;
    impl codeindex_core::collaborators::Chunker for NoopChunker {
        fn chunk(&self, _path: &Path, _content: &str) -> IndexResult<Vec<Chunk>> {
            Ok(Vec::new())
        }
    }

    fn collaborators(dir: &Path) -> Collaborators {
        Collaborators {
            embedder: std::sync::Arc::new(ZeroEmbedder),
            chunker: std::sync::Arc::new(NoopChunker),
            git: std::sync::Arc::new(GitCliTopology::new(dir)),
        }
    }

    #[test]
    fn disabled_config_goes_straight_to_standalone() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(
            dir.path(),
            "/nonexistent/daemon-binary",
            DaemonConfig {
                enabled: false,
                ..Default::default()
            },
            collaborators(dir.path()),
        );

        let result = client.call(
            "query",
            serde_json::json!({"query": "anything", "limit": 5}),
            None,
        );

        assert!(result.is_ok());
    }

    #[test]
    fn call_against_missing_daemon_falls_back_to_standalone_after_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(
            dir.path(),
            dir.path().join("no-such-daemon-binary"),
            DaemonConfig {
                restart_attempts_on_crash: 1,
                retry_delays_ms: vec![1],
                ..Default::default()
            },
            collaborators(dir.path()),
        );

        let result = client.call(
            "query",
            serde_json::json!({"query": "anything", "limit": 5}),
            None,
        );

        assert!(result.is_ok());
    }
}
