//! Hierarchical string key-value store.
//!
//! The only channel the two VMs share before the ring is live. Keys are
//! `/`-separated paths, values are strings. A watch covers a path prefix
//! and delivers the changed path (the watcher re-reads the value itself,
//! matching how store watches behave: they signal, they don't carry data).

use crate::error::{BootstrapError, Result};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One watch firing: the path that changed. A removal fires too; the
/// watcher distinguishes by re-reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
}

/// A registered watch. Dropping it unregisters (the store side notices the
/// dead channel on the next notify).
pub struct Watch {
    rx: mpsc::Receiver<WatchEvent>,
}

impl Watch {
    /// Block for the next event, up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<WatchEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drain anything already queued.
    pub fn try_next(&self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }
}

pub trait KeyStore: Send + Sync {
    fn read(&self, path: &str) -> Option<String>;
    fn write(&self, path: &str, value: &str) -> Result<()>;
    fn remove(&self, path: &str) -> Result<()>;
    /// Remove every key at or under `prefix`.
    fn remove_subtree(&self, prefix: &str) -> Result<()>;
    /// Watch `prefix`; fires for any write or removal at or under it.
    fn watch(&self, prefix: &str) -> Watch;
}

/// Poll `path` until `pred` accepts its value.
///
/// Registers the watch before the first read so a concurrent write cannot
/// fall between them.
pub fn wait_for_key<F>(
    store: &dyn KeyStore,
    path: &str,
    timeout: Duration,
    what: &'static str,
    mut pred: F,
) -> Result<String>
where
    F: FnMut(&str) -> bool,
{
    let watch = store.watch(path);
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(val) = store.read(path) {
            if pred(&val) {
                return Ok(val);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(BootstrapError::Timeout(what));
        }
        let _ = watch.wait(deadline - now);
    }
}

// ============================================================================
// In-memory store
// ============================================================================

struct MemStoreInner {
    entries: HashMap<String, String>,
    watchers: Vec<(String, mpsc::Sender<WatchEvent>)>,
}

/// In-memory `KeyStore` with working watches. Stands in for the real
/// hypervisor store in tests and the loopback rig.
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemStoreInner {
                entries: HashMap::new(),
                watchers: Vec::new(),
            }),
        }
    }

    fn notify(inner: &mut MemStoreInner, path: &str) {
        inner.watchers.retain(|(prefix, tx)| {
            if path == prefix || path.starts_with(&format!("{}/", prefix)) {
                tx.send(WatchEvent {
                    path: path.to_string(),
                })
                .is_ok()
            } else {
                true
            }
        });
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemStore {
    fn read(&self, path: &str) -> Option<String> {
        self.inner.lock().unwrap().entries.get(path).cloned()
    }

    fn write(&self, path: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(path.to_string(), value.to_string());
        Self::notify(&mut inner, path);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(path);
        Self::notify(&mut inner, path);
        Ok(())
    }

    fn remove_subtree(&self, prefix: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.as_str() == prefix || k.starts_with(&format!("{}/", prefix)))
            .cloned()
            .collect();
        for path in doomed {
            inner.entries.remove(&path);
            Self::notify(&mut inner, &path);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> Watch {
        let (tx, rx) = mpsc::channel();
        self.inner
            .lock()
            .unwrap()
            .watchers
            .push((prefix.to_string(), tx));
        Watch { rx }
    }
}

// ============================================================================
// Tests
// ============================================================================
