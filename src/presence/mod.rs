use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A user's last-known dynamic delivery endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub dynamic_url: String,
    pub last_seen: DateTime<Utc>,
}

/// Published on every check-in. The subscriber in the ingestion process
/// reacts by flushing the user's queued webhook notifications to the head
/// of their priority lane (spec's instant-flush protocol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub dynamic_url: String,
}

/// User -> dynamic-endpoint mapping with TTL. Entries self-evict lazily on
/// next access rather than via a sweep task: the registry is read far more
/// often than it grows unbounded, and spec's lifecycle note only requires
/// expiry to be observable, not proactively swept.
pub struct PresenceRegistry {
    entries: Mutex<HashMap<String, PresenceEntry>>,
    ttl: ChronoDuration,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceRegistry {
    pub fn new(ttl_seconds: i64) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: ChronoDuration::seconds(ttl_seconds),
            events: tx,
        }
    }

    /// Overwrites any existing entry and publishes a check-in event.
    pub fn set(&self, user_id: &str, dynamic_url: &str) {
        let entry = PresenceEntry {
            user_id: user_id.to_string(),
            dynamic_url: dynamic_url.to_string(),
            last_seen: Utc::now(),
        };
        self.entries
            .lock()
            .unwrap()
            .insert(user_id.to_string(), entry);

        // Best-effort: no subscribers is not an error, it just means no
        // instant-flush worker is currently listening.
        let _ = self.events.send(PresenceEvent {
            user_id: user_id.to_string(),
            dynamic_url: dynamic_url.to_string(),
        });
    }

    pub fn get(&self, user_id: &str) -> Option<PresenceEntry> {
        let mut entries = self.entries.lock().unwrap();
        let expired = match entries.get(user_id) {
            Some(e) => Utc::now() - e.last_seen > self.ttl,
            None => return None,
        };
        if expired {
            entries.remove(user_id);
            return None;
        }
        entries.get(user_id).cloned()
    }

    pub fn is_available(&self, user_id: &str) -> bool {
        self.get(user_id).is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let reg = PresenceRegistry::new(300);
        reg.set("u1", "http://r:9099/webhook");
        let entry = reg.get("u1").unwrap();
        assert_eq!(entry.dynamic_url, "http://r:9099/webhook");
        assert!(reg.is_available("u1"));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let reg = PresenceRegistry::new(0);
        reg.set("u1", "http://r:9099/webhook");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!reg.is_available("u1"));
    }

    #[tokio::test]
    async fn set_publishes_checkin_event() {
        let reg = PresenceRegistry::new(300);
        let mut rx = reg.subscribe();
        reg.set("u1", "http://r:9099/webhook");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id, "u1");
    }
}
