//! Memory-resident wizard sessions.
//!
//! A session lives only as long as the user keeps interacting with it.
//! Idle sessions are dropped by a background sweeper; an abandoned wizard's
//! data is simply gone.

use intake_core::Wizard;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

pub struct Session {
    pub id: String,
    pub wizard: Wizard,
    last_seen: Instant,
}

impl Session {
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= ttl
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn create(&self, wizard: Wizard) -> (String, SessionHandle) {
        let id = uuid::Uuid::new_v4().to_string();
        let handle = Arc::new(Mutex::new(Session {
            id: id.clone(),
            wizard,
            last_seen: Instant::now(),
        }));
        self.sessions
            .write()
            .await
            .insert(id.clone(), handle.clone());
        (id, handle)
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop sessions idle for longer than the TTL. Sessions currently
    /// locked by a request are in use and are kept.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, handle| match handle.try_lock() {
            Ok(session) => !session.expired(now, self.ttl),
            Err(_) => true,
        });
        before - sessions.len()
    }
}

/// Periodically expire idle sessions.
pub fn spawn_sweeper(store: Arc<SessionStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = store.sweep(Instant::now()).await;
            if removed > 0 {
                tracing::info!(removed, "Expired idle wizard sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake_core::Role;

    fn wizard() -> Wizard {
        Wizard::new(Arc::new(Role::Patient.definition().unwrap()))
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (id, _) = store.create(wizard()).await;

        let handle = store.get(&id).await.unwrap();
        assert_eq!(handle.lock().await.id, id);
        assert!(store.remove(&id).await);
        assert!(store.get(&id).await.is_none());
        assert!(!store.remove(&id).await);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_sessions() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (idle, _) = store.create(wizard()).await;
        let (active, active_handle) = store.create(wizard()).await;

        let later = Instant::now() + Duration::from_secs(120);
        let _guard = active_handle.lock().await;

        assert_eq!(store.sweep(later).await, 1);
        assert!(store.get(&idle).await.is_none());
        assert!(store.get(&active).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_sessions() {
        let store = SessionStore::new(Duration::from_secs(60));
        store.create(wizard()).await;
        assert_eq!(store.sweep(Instant::now()).await, 0);
        assert_eq!(store.len().await, 1);
    }
}
