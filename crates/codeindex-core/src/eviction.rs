//! Background TTL eviction (C6).
//!
//! Runs on its own OS thread. Every `check_interval` it snapshots the cache
//! entry's last-access time without taking the main rw-lock — a stale
//! snapshot read is fine here, it only delays eviction by up to one tick —
//! and, if expired, takes the write lock to invalidate. Holds only a weak
//! handle to the shared state so it never keeps the daemon alive on its own
//! (breaks the Service <-> EvictionThread cycle the teacher's lifecycle
//! code sidesteps with an indirect reference).

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cache::CacheEntry;

/// What the eviction thread does once an entry is confirmed expired.
pub trait EvictionSink: Send + Sync {
    fn on_evicted(&self, project_path: &std::path::Path);
    /// Called after eviction when `auto_shutdown_on_idle` is set and no
    /// watch is active. Returning normally is sufficient; the caller
    /// decides how to terminate.
    fn on_idle_shutdown_requested(&self) {}
}

pub struct EvictionConfig {
    pub check_interval: Duration,
    pub auto_shutdown_on_idle: bool,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            check_interval: crate::cache::DEFAULT_EVICTION_CHECK_INTERVAL,
            auto_shutdown_on_idle: false,
        }
    }
}

/// Handle to a running eviction thread. Dropping it does not stop the
/// thread; call [`EvictionThread::stop`] explicitly.
pub struct EvictionThread {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl EvictionThread {
    /// Spawns the background loop. `entry` and `watch_active` are observed
    /// through weak/shared handles so this thread never extends their
    /// lifetime on its own.
    pub fn spawn(
        entry: Weak<CacheEntry>,
        watch_active: Arc<std::sync::atomic::AtomicBool>,
        sink: Arc<dyn EvictionSink>,
        config: EvictionConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("codeindex-eviction".into())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(config.check_interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }

                let Some(entry) = entry.upgrade() else {
                    return;
                };
                if !entry.is_expired(Instant::now()) {
                    continue;
                }

                entry.invalidate();
                sink.on_evicted(&entry.project_path);

                // Conservative default: never auto-shutdown while a watch
                // is running, regardless of `auto_shutdown_on_idle`.
                let watch_running = watch_active.load(std::sync::atomic::Ordering::Relaxed);
                if config.auto_shutdown_on_idle && !watch_running {
                    sink.on_idle_shutdown_requested();
                }
            })
            .expect("failed to spawn eviction thread");

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictionThread {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        evictions: AtomicUsize,
        shutdown_requests: AtomicUsize,
    }

    impl EvictionSink for CountingSink {
        fn on_evicted(&self, _project_path: &std::path::Path) {
            self.evictions.fetch_add(1, Ordering::SeqCst);
        }

        fn on_idle_shutdown_requested(&self) {
            self.shutdown_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn evicts_expired_entry_on_next_tick() {
        let entry = Arc::new(CacheEntry::new(
            PathBuf::from("/tmp/p"),
            Duration::from_millis(5),
        ));
        let sink = Arc::new(CountingSink {
            evictions: AtomicUsize::new(0),
            shutdown_requests: AtomicUsize::new(0),
        });
        let watch_active = Arc::new(std::sync::atomic::AtomicBool::new(false));

        entry.read(|_, _, _| ());
        thread::sleep(Duration::from_millis(10));

        let thread = EvictionThread::spawn(
            Arc::downgrade(&entry),
            watch_active,
            sink.clone(),
            EvictionConfig {
                check_interval: Duration::from_millis(5),
                auto_shutdown_on_idle: false,
            },
        );

        thread::sleep(Duration::from_millis(50));
        thread.stop();

        assert!(sink.evictions.load(Ordering::SeqCst) >= 1);
        assert_eq!(sink.shutdown_requests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn does_not_request_shutdown_while_watch_active() {
        let entry = Arc::new(CacheEntry::new(
            PathBuf::from("/tmp/p"),
            Duration::from_millis(5),
        ));
        let sink = Arc::new(CountingSink {
            evictions: AtomicUsize::new(0),
            shutdown_requests: AtomicUsize::new(0),
        });
        let watch_active = Arc::new(std::sync::atomic::AtomicBool::new(true));

        entry.read(|_, _, _| ());
        thread::sleep(Duration::from_millis(10));

        let thread = EvictionThread::spawn(
            Arc::downgrade(&entry),
            watch_active,
            sink.clone(),
            EvictionConfig {
                check_interval: Duration::from_millis(5),
                auto_shutdown_on_idle: true,
            },
        );

        thread::sleep(Duration::from_millis(50));
        thread.stop();

        assert!(sink.evictions.load(Ordering::SeqCst) >= 1);
        assert_eq!(sink.shutdown_requests.load(Ordering::SeqCst), 0);
    }
}
