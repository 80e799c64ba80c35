//! In-process presence tracking.
//!
//! One hub per server holds a reference count per user (a user may hold
//! several sockets) and a broadcast channel for join/leave events. Events
//! fire only on the 0->1 and 1->0 transitions, so subscribers see each user
//! appear and disappear exactly once regardless of tab count.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    Join { user_id: String },
    Leave { user_id: String },
}

pub struct PresenceHub {
    online: Mutex<HashMap<String, usize>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            online: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Snapshot of currently online users plus a live event feed.
    ///
    /// Subscribing before reading the snapshot would race; the lock is held
    /// across both so no event can fall between them.
    pub fn subscribe(&self) -> (Vec<String>, broadcast::Receiver<PresenceEvent>) {
        let online = self.online.lock().unwrap();
        let rx = self.events.subscribe();
        let mut snapshot: Vec<String> = online.keys().cloned().collect();
        snapshot.sort();
        (snapshot, rx)
    }

    pub fn join(&self, user_id: &str) {
        let mut online = self.online.lock().unwrap();
        let count = online.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            let _ = self.events.send(PresenceEvent::Join {
                user_id: user_id.to_string(),
            });
        }
    }

    pub fn leave(&self, user_id: &str) {
        let mut online = self.online.lock().unwrap();
        match online.get_mut(user_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                online.remove(user_id);
                let _ = self.events.send(PresenceEvent::Leave {
                    user_id: user_id.to_string(),
                });
            }
            None => {}
        }
    }

    #[cfg(test)]
    fn online_count(&self, user_id: &str) -> usize {
        self.online.lock().unwrap().get(user_id).copied().unwrap_or(0)
    }
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_and_leave_broadcast_once() {
        let hub = PresenceHub::new();
        let (snapshot, mut rx) = hub.subscribe();
        assert!(snapshot.is_empty());

        hub.join("alice");
        assert_eq!(
            rx.recv().await.unwrap(),
            PresenceEvent::Join { user_id: "alice".into() }
        );

        hub.leave("alice");
        assert_eq!(
            rx.recv().await.unwrap(),
            PresenceEvent::Leave { user_id: "alice".into() }
        );
        assert_eq!(hub.online_count("alice"), 0);
    }

    #[tokio::test]
    async fn test_multiple_sockets_single_transition() {
        let hub = PresenceHub::new();
        let (_, mut rx) = hub.subscribe();

        hub.join("bob");
        hub.join("bob");
        hub.leave("bob");
        // Still one socket open, no leave event yet.
        hub.join("carol");

        assert_eq!(
            rx.recv().await.unwrap(),
            PresenceEvent::Join { user_id: "bob".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            PresenceEvent::Join { user_id: "carol".into() }
        );
        assert_eq!(hub.online_count("bob"), 1);

        hub.leave("bob");
        assert_eq!(
            rx.recv().await.unwrap(),
            PresenceEvent::Leave { user_id: "bob".into() }
        );
    }

    #[test]
    fn test_snapshot_reflects_current_set() {
        let hub = PresenceHub::new();
        hub.join("zoe");
        hub.join("adam");
        let (snapshot, _) = hub.subscribe();
        assert_eq!(snapshot, vec!["adam".to_string(), "zoe".to_string()]);
    }

    #[test]
    fn test_leave_without_join_is_ignored() {
        let hub = PresenceHub::new();
        hub.leave("ghost");
        let (snapshot, _) = hub.subscribe();
        assert!(snapshot.is_empty());
    }
}
