//! Session registry.
//!
//! The single synchronization domain of the orchestrator: connected
//! clients, their sessions, the per-user container records and the per-user
//! idle cleanup timers. The hub guards one instance behind a reader/writer
//! lock; everything here is plain data and lock-free helpers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::Principal;
use crate::container::PortRange;

use super::pty::PtyProcess;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying one open stream. Passed across component
/// boundaries instead of references into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// One connected stream: who it is and where its output frames go.
pub struct ClientHandle {
    pub principal: Principal,
    pub tab_id: String,
    /// Bounded queue drained by the client's write pump.
    pub sender: mpsc::Sender<Vec<u8>>,
}

/// One terminal tab session. `pty` is populated on the first resize.
pub struct Session {
    pub user_id: String,
    pub tab_id: String,
    pub container_name: String,
    pub attached: bool,
    pub pty: Option<Arc<PtyProcess>>,
}

/// Per-user container record.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub container_name: String,
    /// Known only for containers spawned this run; containers discovered at
    /// startup keep whatever range they were created with.
    pub port_range: Option<PortRange>,
}

/// All mutable orchestrator state, guarded by one lock in the hub.
#[derive(Default)]
pub struct Registry {
    pub clients: HashMap<ClientId, ClientHandle>,
    pub sessions: HashMap<ClientId, Session>,
    pub user_containers: HashMap<String, ContainerInfo>,
    pub cleanup_timers: HashMap<String, JoinHandle<()>>,
}

impl Registry {
    pub fn has_sessions_for_user(&self, user_id: &str) -> bool {
        self.sessions
            .values()
            .any(|session| session.user_id == user_id)
    }

    /// Disarm the user's idle timer if one is armed.
    pub fn cancel_cleanup_timer(&mut self, user_id: &str) {
        if let Some(timer) = self.cleanup_timers.remove(user_id) {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user_id: &str, tab_id: &str) -> Session {
        Session {
            user_id: user_id.to_string(),
            tab_id: tab_id.to_string(),
            container_name: crate::container::container_name(user_id),
            attached: false,
            pty: None,
        }
    }

    #[test]
    fn client_ids_are_unique() {
        let a = ClientId::next();
        let b = ClientId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn tracks_sessions_per_user() {
        let mut registry = Registry::default();
        assert!(!registry.has_sessions_for_user("u1"));

        registry.sessions.insert(ClientId::next(), session("u1", "1"));
        registry.sessions.insert(ClientId::next(), session("u1", "2"));
        registry.sessions.insert(ClientId::next(), session("u2", "1"));

        assert!(registry.has_sessions_for_user("u1"));
        assert!(registry.has_sessions_for_user("u2"));
        assert!(!registry.has_sessions_for_user("u3"));
    }

    #[tokio::test]
    async fn cancel_cleanup_timer_removes_entry() {
        let mut registry = Registry::default();
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        registry.cleanup_timers.insert("u1".to_string(), handle);

        registry.cancel_cleanup_timer("u1");
        assert!(!registry.cleanup_timers.contains_key("u1"));

        // Cancelling again is a no-op.
        registry.cancel_cleanup_timer("u1");
    }
}
