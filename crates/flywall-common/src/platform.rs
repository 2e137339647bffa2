//! Process-wide platform handles
//!
//! The core never reaches for ambient singletons; clock and node identity
//! are threaded down explicitly from one init at the top. Swapping the
//! clock implementation is what makes test-time dilation possible.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

/// Nanosecond clock. The only time source in the core.
pub trait Clock: Send + Sync {
    /// Nanoseconds since the Unix epoch.
    fn now_ns(&self) -> u64;
}

/// Wall clock backed by `SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct TestClock {
    ns: AtomicU64,
}

impl TestClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            ns: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.ns.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}

/// Explicit context passed from the top instead of package-level state.
#[derive(Clone)]
pub struct Platform {
    pub clock: Arc<dyn Clock>,
    pub node_id: String,
}

impl Platform {
    /// Production platform on the system clock.
    pub fn system(node_id: impl Into<String>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            node_id: node_id.into(),
        }
    }

    /// Test platform; returns the clock handle for manual advancement.
    pub fn test(node_id: impl Into<String>) -> (Self, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new(1_700_000_000_000_000_000));
        (
            Self {
                clock: clock.clone(),
                node_id: node_id.into(),
            },
            clock,
        )
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Shutdown fan-out for long-lived tasks.
///
/// Loops hold a [`ShutdownHandle`] and exit promptly when signalled;
/// the pipeline polls [`ShutdownHandle::is_signalled`] between stages.
pub struct Shutdown {
    tx: watch::Sender<bool>,
    signalled: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            signalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            rx: self.tx.subscribe(),
            signalled: self.signalled.clone(),
        }
    }

    /// Signal every handle. Idempotent.
    pub fn signal(&self) {
        self.signalled.store(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ShutdownHandle {
    rx: watch::Receiver<bool>,
    signalled: Arc<AtomicBool>,
}

impl ShutdownHandle {
    #[inline]
    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Resolve when shutdown is signalled.
    pub async fn wait(&mut self) {
        if self.is_signalled() {
            return;
        }
        // Result ignored: a dropped sender also means we should stop.
        let _ = self.rx.wait_for(|v| *v).await;
    }
}
