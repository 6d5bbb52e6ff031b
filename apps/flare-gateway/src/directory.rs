use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use flare_proto::SessionId;
use metrics::gauge;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::ConnectionRegistry;

/// Session id -> registry map. Connections hold the strong references while
/// they are joined; the directory only keeps weak ones, so a session nobody
/// references any more disappears on the next lookup or sweep.
#[derive(Clone, Default)]
pub struct SessionDirectory {
    inner: Arc<Mutex<HashMap<SessionId, Weak<ConnectionRegistry>>>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, session_id: SessionId) -> Arc<ConnectionRegistry> {
        let mut sessions = self.inner.lock();
        if let Some(registry) = sessions.get(&session_id).and_then(Weak::upgrade) {
            return registry;
        }

        let registry = Arc::new(ConnectionRegistry::new(session_id));
        sessions.insert(session_id, Arc::downgrade(&registry));
        debug!(session_id = %session_id, "session registry created");
        registry
    }

    #[cfg(test)]
    pub fn get(&self, session_id: SessionId) -> Option<Arc<ConnectionRegistry>> {
        self.inner.lock().get(&session_id).and_then(Weak::upgrade)
    }

    /// Drops entries whose registry has been reclaimed. Returns how many went.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.inner.lock();
        let before = sessions.len();
        sessions.retain(|_, registry| registry.strong_count() > 0);
        let removed = before - sessions.len();
        gauge!("flare_gateway_sessions_tracked", sessions.len() as f64);
        removed
    }

    /// Registries that are still referenced, for enumeration.
    pub fn live_sessions(&self) -> Vec<Arc<ConnectionRegistry>> {
        self.inner
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of entries including ones not yet swept.
    pub fn tracked(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let directory = self.clone();
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let removed = directory.sweep();
                if removed > 0 {
                    debug!(removed, "pruned unreferenced sessions");
                }
            }
        })
    }
}
