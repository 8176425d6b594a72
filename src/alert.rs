//! Failure alert side-channel.
//!
//! When discovery or reconnection exhausts every candidate port, the engine
//! notifies an external webhook with the diagnostic detail. Delivery is
//! fire-and-forget on a background task: a dead webhook must never block or
//! fail the modem operation that raised the alert.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::AlertConfig;

/// Cheap cloneable notifier handle. Safe to call from the blocking modem
/// I/O thread — `notify` only logs and enqueues.
#[derive(Clone)]
pub struct Alerter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl Alerter {
    /// A notifier that only logs. Used when no webhook is configured.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Raise an alert. Always logged; delivered to the webhook when one is
    /// configured.
    pub fn notify(&self, text: impl Into<String>) {
        let text = text.into();
        warn!("ALERT: {text}");
        if let Some(tx) = &self.tx {
            // A closed channel means shutdown is in progress; nothing to do.
            let _ = tx.send(text);
        }
    }
}

/// Start the delivery task and return its handle. Must be called from within
/// the tokio runtime.
pub fn spawn(cfg: &AlertConfig) -> Alerter {
    let Some(url) = cfg.webhook_url.clone() else {
        debug!("no alert webhook configured");
        return Alerter::disabled();
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        while let Some(text) = rx.recv().await {
            match client
                .post(&url)
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    debug!("alert delivered to webhook");
                }
                Ok(resp) => warn!("alert webhook answered {}", resp.status()),
                Err(e) => warn!("alert webhook delivery failed: {e}"),
            }
        }
    });

    Alerter { tx: Some(tx) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_notify_is_harmless() {
        Alerter::disabled().notify("no modem found");
    }

    #[tokio::test]
    async fn test_notify_enqueues_for_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let alerter = Alerter { tx: Some(tx) };
        alerter.notify("modem connect failed on /dev/ttyUSB2");
        assert_eq!(
            rx.recv().await.as_deref(),
            Some("modem connect failed on /dev/ttyUSB2")
        );
    }
}
