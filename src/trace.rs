//! Ambient tracing facility and the process-wide trace watcher
//!
//! The trace tag is a process-global property owned by an external tracing
//! facility; the loader only ever asks "is it on" and emits markers. One
//! watcher thread per process samples the tag and tells every live loader to
//! flip the filesystem's read-log parameter. Per-loader pollers would waste
//! threads on a global property.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol::timeouts;

/// External tracing facility: an on/off tag plus a marker sink.
pub trait TraceTag: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn emit(&self, marker: &str);
}

struct DisabledTag;

impl TraceTag for DisabledTag {
    fn is_enabled(&self) -> bool {
        false
    }

    fn emit(&self, _marker: &str) {}
}

fn tag_slot() -> &'static RwLock<Arc<dyn TraceTag>> {
    static SLOT: OnceLock<RwLock<Arc<dyn TraceTag>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(Arc::new(DisabledTag)))
}

/// Install the process-wide tracing facility. Defaults to disabled.
pub fn set_tag(tag: Arc<dyn TraceTag>) {
    *tag_slot().write() = tag;
}

pub fn is_enabled() -> bool {
    tag_slot().read().is_enabled()
}

pub fn emit(marker: &str) {
    tag_slot().read().emit(marker);
}

/// Implemented by loaders that mirror the trace tag into the filesystem's
/// read-log parameter.
pub trait ReadLogsListener: Send + Sync {
    fn update_read_logs_state(&self, enabled: bool);
}

struct WatcherInner {
    callbacks: Mutex<Vec<Weak<dyn ReadLogsListener>>>,
    running: AtomicBool,
}

/// Background observer of the ambient tag. Registered listeners are held
/// weakly; dead ones are dropped during notification.
pub struct TraceWatcher {
    inner: Arc<WatcherInner>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl TraceWatcher {
    pub fn new() -> Self {
        Self::with_interval(timeouts::TRACE_TAG_CHECK)
    }

    pub fn with_interval(interval: Duration) -> Self {
        let inner = Arc::new(WatcherInner {
            callbacks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });
        let thread_inner = Arc::clone(&inner);
        let checker = thread::spawn(move || {
            let mut old_trace = is_enabled();
            while thread_inner.running.load(Ordering::Relaxed) {
                let new_trace = is_enabled();
                if old_trace != new_trace {
                    thread_inner.callbacks.lock().retain(|callback| {
                        match callback.upgrade() {
                            Some(listener) => {
                                listener.update_read_logs_state(new_trace);
                                true
                            }
                            None => false,
                        }
                    });
                }
                old_trace = new_trace;
                thread::sleep(interval);
            }
        });
        TraceWatcher {
            inner,
            checker: Mutex::new(Some(checker)),
        }
    }

    pub fn register(&self, listener: Weak<dyn ReadLogsListener>) {
        self.inner.callbacks.lock().push(listener);
    }

    pub fn unregister(&self, listener: &Weak<dyn ReadLogsListener>) {
        self.inner
            .callbacks
            .lock()
            .retain(|callback| !callback.ptr_eq(listener));
    }

    /// Stop sampling and join the checker. The process-wide instance is
    /// never torn down; this exists for owned instances.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.checker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for TraceWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TraceWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The process-wide watcher, started on first use and alive until exit.
pub fn watcher() -> &'static TraceWatcher {
    static WATCHER: OnceLock<TraceWatcher> = OnceLock::new();
    WATCHER.get_or_init(TraceWatcher::new)
}
