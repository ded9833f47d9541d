//! Bounded in-memory store of per-session chat histories.

use crate::agent::Conversation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

struct SessionEntry {
    conversation: Conversation,
    last_activity: Instant,
}

/// Session histories keyed by session id.
///
/// Holds at most `max_sessions` entries; storing into a full store evicts the
/// least recently active session. The lock is never held across an await.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
        }
    }

    /// A copy of the session's history, if the session exists.
    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.sessions
            .lock()
            .get(id)
            .map(|entry| entry.conversation.clone())
    }

    /// Insert or replace a session's history and mark it active.
    pub fn store(&self, id: &str, conversation: Conversation) {
        let mut sessions = self.sessions.lock();
        sessions.insert(
            id.to_string(),
            SessionEntry {
                conversation,
                last_activity: Instant::now(),
            },
        );

        while sessions.len() > self.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .filter(|(key, _)| key.as_str() != id)
                .min_by_key(|(_, entry)| entry.last_activity)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
            tracing::debug!(session = %oldest, "Evicted least recently used session");
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;

    fn conversation(text: &str) -> Conversation {
        let mut conv = Conversation::new(Some("sys"), 10);
        conv.push(ChatMessage::user(text));
        conv
    }

    #[test]
    fn store_and_get_round_trip() {
        let store = SessionStore::new(4);
        assert!(store.get("a").is_none());
        store.store("a", conversation("hi"));
        assert_eq!(store.get("a").unwrap().history(), &[ChatMessage::user("hi")]);
        assert!(store.contains("a"));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.is_empty());
    }

    #[test]
    fn cap_evicts_least_recently_active_session() {
        let store = SessionStore::new(2);
        store.store("a", conversation("1"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.store("b", conversation("2"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        // Touching "a" makes "b" the oldest.
        store.store("a", conversation("3"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        store.store("c", conversation("4"));

        assert_eq!(store.len(), 2);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }

    #[test]
    fn cap_holds_under_many_new_sessions() {
        let store = SessionStore::new(3);
        for i in 0..50 {
            store.store(&format!("s{i}"), conversation("x"));
        }
        assert_eq!(store.len(), 3);
        assert!(store.contains("s49"));
    }
}
