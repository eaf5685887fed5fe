//! Process-wide table of live sessions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::session::ClientSession;
use crate::state::SessionId;

/// Thread-safe map from [`SessionId`] to session.
///
/// Iteration works on a snapshot of `Arc`s taken under the read lock, so
/// a concurrent `unregister` never invalidates a session a visitor is
/// holding.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<ClientSession>>> {
        self.sessions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<ClientSession>>> {
        self.sessions.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert a session. Returns the previous entry with the same id.
    pub fn register(&self, session: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        self.write().insert(session.id(), session)
    }

    pub fn unregister(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.write().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Clone out every live session.
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.read().values().cloned().collect()
    }

    /// Visit every session registered at the time of the call.
    ///
    /// The lock is released before `f` runs, so `f` may itself call
    /// `register` / `unregister`.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ClientSession>),
    {
        for session in self.snapshot() {
            f(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<ClientSession> {
        Arc::new(ClientSession::new(SessionId::next(), None))
    }

    #[test]
    fn register_and_lookup() {
        let reg = SessionRegistry::new();
        let s = session();
        assert!(reg.register(Arc::clone(&s)).is_none());
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(s.id()));
        assert_eq!(reg.get(s.id()).unwrap().id(), s.id());
    }

    #[test]
    fn unregister_removes() {
        let reg = SessionRegistry::new();
        let s = session();
        reg.register(Arc::clone(&s));
        assert!(reg.unregister(s.id()).is_some());
        assert!(reg.unregister(s.id()).is_none());
        assert!(reg.is_empty());
        assert!(reg.get(s.id()).is_none());
    }

    #[test]
    fn for_each_tolerates_unregister_during_iteration() {
        let reg = SessionRegistry::new();
        let ids: Vec<_> = (0..4)
            .map(|_| {
                let s = session();
                reg.register(Arc::clone(&s));
                s.id()
            })
            .collect();

        let mut visited = 0;
        reg.for_each(|s| {
            visited += 1;
            reg.unregister(s.id());
            // The visitor still holds a live session.
            assert!(!s.is_closed());
        });
        assert_eq!(visited, ids.len());
        assert!(reg.is_empty());
    }

    #[test]
    fn concurrent_register_unregister() {
        let reg = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let s = session();
                        reg.register(Arc::clone(&s));
                        reg.for_each(|_| {});
                        reg.unregister(s.id());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(reg.is_empty());
    }
}
