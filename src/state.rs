//! Shared application state passed to every handler via Axum's `State` extractor.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::config::Config;
use crate::modem::Modem;
use crate::sms::InboundMessage;

/// Shared application state for the gsmctl server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Handle to the modem I/O thread.
    pub modem: Modem,
    /// Recent inbound messages and traffic counters.
    pub inbox: Arc<InboxLog>,
    /// Broadcast channel for inbound-message events. The inbox poller
    /// publishes each newly read message here.
    pub inbox_events: broadcast::Sender<Value>,
}

/// Maximum number of recent inbound messages to retain in memory.
const MAX_RECENT_MESSAGES: usize = 50;

/// In-memory record of message traffic — atomics for the counters, a Mutex
/// only around the recent-message ring.
pub struct InboxLog {
    recent: Mutex<VecDeque<InboundMessage>>,
    pub received_total: AtomicU64,
    pub sent_total: AtomicU64,
    pub ussd_total: AtomicU64,
}

impl InboxLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT_MESSAGES)),
            received_total: AtomicU64::new(0),
            sent_total: AtomicU64::new(0),
            ussd_total: AtomicU64::new(0),
        }
    }

    /// Record one inbound message, evicting the oldest at capacity.
    pub async fn push(&self, message: InboundMessage) {
        let mut recent = self.recent.lock().await;
        if recent.len() >= MAX_RECENT_MESSAGES {
            recent.pop_front();
        }
        recent.push_back(message);
    }

    /// Recent inbound messages, newest last.
    pub async fn recent(&self) -> Vec<InboundMessage> {
        self.recent.lock().await.iter().cloned().collect()
    }
}

impl Default for InboxLog {
    fn default() -> Self {
        Self::new()
    }
}
