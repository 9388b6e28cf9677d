//! Online/offline tracking with listener notification.
//!
//! Connectivity changes arrive two ways: pushed through
//! [`ConnectivityMonitor::set_online`] (the event path) and pulled by a
//! periodic probe (the poll path, which catches transitions the event path
//! misses). Either way, a detected transition notifies every subscriber; the
//! service layer subscribes a listener that kicks off queue replay when the
//! monitor comes back online.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::http::{HttpClient, HttpRequest};

/// Default interval of the connectivity poll loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Source of truth for "are we online right now".
pub trait ConnectivityProbe: Send + Sync {
    fn check<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Probe with a settable answer, for tests and for embedders that receive
/// connectivity events from their host environment.
#[derive(Debug, Default)]
pub struct StaticProbe {
    online: AtomicBool,
}

impl StaticProbe {
    pub fn online() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    pub fn offline() -> Self {
        Self {
            online: AtomicBool::new(false),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityProbe for StaticProbe {
    fn check<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        let online = self.online.load(Ordering::SeqCst);
        Box::pin(async move { online })
    }
}

/// Probe that considers the backend reachable when a lightweight request
/// completes with any response at all.
pub struct HttpProbe {
    http: Arc<dyn HttpClient>,
    url: String,
}

impl HttpProbe {
    pub fn new(http: Arc<dyn HttpClient>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

impl ConnectivityProbe for HttpProbe {
    fn check<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let request = HttpRequest::get(self.url.clone()).with_timeout_ms(2_000);
            self.http.execute(request).await.is_ok()
        })
    }
}

/// Callback invoked with the new online state on every detected transition.
pub type ConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Tracks online/offline transitions and fans them out to listeners.
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    listeners: Mutex<HashMap<u64, ConnectivityListener>>,
    next_id: AtomicU64,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(initially_online)),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The shared flag other components (the offline queue) observe.
    pub fn online_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.online)
    }

    pub fn subscribe(&self, listener: ConnectivityListener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .expect("connectivity listener lock poisoned")
            .insert(id, listener);
        SubscriptionId(id)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners
            .lock()
            .expect("connectivity listener lock poisoned")
            .remove(&id.0)
            .is_some()
    }

    /// Record an observed state. Listeners fire only on an actual transition.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            log::info!("connectivity changed: {}", if online { "online" } else { "offline" });
            self.notify(online);
        }
    }

    /// Re-check connectivity through `probe` every `interval`, catching
    /// transitions the event path missed.
    pub fn spawn_poller(
        self: Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.check().await;
                monitor.set_online(online);
            }
        })
    }

    fn notify(&self, online: bool) {
        let listeners: Vec<ConnectivityListener> = {
            let registered = self
                .listeners
                .lock()
                .expect("connectivity listener lock poisoned");
            registered.values().cloned().collect()
        };

        for listener in listeners {
            listener(online);
        }
    }
}
