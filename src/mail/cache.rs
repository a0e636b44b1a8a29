use std::collections::HashMap;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use native_tls::TlsStream;
use uuid::Uuid;

/// A logged-in IMAP session over TLS.
pub type ImapSession = imap::Session<TlsStream<TcpStream>>;

struct Entry<S> {
    session: S,
    created_at: Instant,
}

/// Bounded per-user session cache. Entries expire after `ttl` and the
/// oldest entry is displaced when the cache is full; displaced sessions
/// are handed back to the caller so it can log them out.
pub struct SessionCache<S> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<Uuid, Entry<S>>,
}

impl<S> SessionCache<S> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Whether a live, unexpired session exists for the user.
    pub fn is_fresh(&self, user: &Uuid) -> bool {
        self.entries
            .get(user)
            .map(|e| e.created_at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    pub fn get_mut(&mut self, user: &Uuid) -> Option<&mut S> {
        if !self.is_fresh(user) {
            return None;
        }
        self.entries.get_mut(user).map(|e| &mut e.session)
    }

    pub fn remove(&mut self, user: &Uuid) -> Option<S> {
        self.entries.remove(user).map(|e| e.session)
    }

    /// Inserts a session, returning any sessions displaced by the insert
    /// (a same-user replacement, plus the oldest entry when full).
    pub fn insert(&mut self, user: Uuid, session: S) -> Vec<S> {
        let mut displaced = Vec::new();

        if let Some(old) = self.entries.remove(&user) {
            displaced.push(old.session);
        }
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                if let Some(old) = self.entries.remove(&id) {
                    displaced.push(old.session);
                }
            }
        }

        self.entries.insert(
            user,
            Entry {
                session,
                created_at: Instant::now(),
            },
        );
        displaced
    }

    pub fn users(&self) -> Vec<Uuid> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_sessions() {
        let mut cache: SessionCache<String> =
            SessionCache::new(4, Duration::from_secs(60));
        let user = Uuid::new_v4();
        assert!(cache.insert(user, "session".into()).is_empty());
        assert!(cache.is_fresh(&user));
        assert_eq!(cache.get_mut(&user).map(|s| s.as_str()), Some("session"));
    }

    #[test]
    fn expired_entries_are_not_fresh() {
        let mut cache: SessionCache<String> =
            SessionCache::new(4, Duration::from_millis(0));
        let user = Uuid::new_v4();
        cache.insert(user, "session".into());
        assert!(!cache.is_fresh(&user));
        assert!(cache.get_mut(&user).is_none());
        // the stale session is still there for the caller to log out
        assert_eq!(cache.remove(&user), Some("session".into()));
    }

    #[test]
    fn capacity_displaces_the_oldest_entry() {
        let mut cache: SessionCache<String> =
            SessionCache::new(2, Duration::from_secs(60));
        let first = Uuid::new_v4();
        cache.insert(first, "a".into());
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(Uuid::new_v4(), "b".into());
        std::thread::sleep(Duration::from_millis(5));

        let displaced = cache.insert(Uuid::new_v4(), "c".into());
        assert_eq!(displaced, vec!["a".to_string()]);
        assert_eq!(cache.len(), 2);
        assert!(!cache.is_fresh(&first));
    }

    #[test]
    fn replacing_a_user_session_returns_the_old_one() {
        let mut cache: SessionCache<String> =
            SessionCache::new(2, Duration::from_secs(60));
        let user = Uuid::new_v4();
        cache.insert(user, "old".into());
        let displaced = cache.insert(user, "new".into());
        assert_eq!(displaced, vec!["old".to_string()]);
        assert_eq!(cache.get_mut(&user).map(|s| s.as_str()), Some("new"));
    }
}
