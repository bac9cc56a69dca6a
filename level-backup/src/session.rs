//! Editing session the scheduler reacts to.
//!
//! Tracks who joins and leaves, whether anyone joined since the last backup,
//! and when the session ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "user")]
pub enum SessionEvent {
    UserJoined(String),
    UserLeft(String),
}

/// Cheap to clone; every clone observes the same session
#[derive(Debug, Clone)]
pub struct Session {
    events: broadcast::Sender<SessionEvent>,
    activity: Arc<AtomicBool>,
    end: CancellationToken,
}

impl Session {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            activity: Arc::new(AtomicBool::new(false)),
            end: CancellationToken::new(),
        }
    }

    pub fn user_joined(&self, user: &str) {
        info!(user, "User joined");
        self.activity.store(true, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::UserJoined(user.to_string()));
    }

    pub fn user_left(&self, user: &str) {
        info!(user, "User left");
        let _ = self.events.send(SessionEvent::UserLeft(user.to_string()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether someone joined since the activity flag was last cleared
    pub fn had_activity(&self) -> bool {
        self.activity.load(Ordering::SeqCst)
    }

    pub fn clear_activity(&self) {
        self.activity.store(false, Ordering::SeqCst);
    }

    pub fn end(&self) {
        self.end.cancel();
    }

    pub fn end_token(&self) -> &CancellationToken {
        &self.end
    }

    pub fn is_ended(&self) -> bool {
        self.end.is_cancelled()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
