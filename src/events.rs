//! Process-wide notification bus.
//!
//! Certificate registration results and listener errors are published here
//! rather than propagated through call chains; the binary subscribes and
//! logs, embedders may subscribe for their own bookkeeping.

use tokio::sync::broadcast;

use crate::config::EVENT_BUS_CAPACITY;
use crate::dispatch::EventChannel;

/// A process-wide notification.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A domain's certificate was loaded and its context published. Carries
    /// the domain's dispatch channel so subscribers can attach handlers.
    Registered {
        domain: String,
        channel: EventChannel,
    },
    /// A certificate failed to load or parse; the domain stays unresolvable.
    CertificateError { domain: String, reason: String },
    /// A listener-level error (bind failure, accept failure, stale channel
    /// cleanup failure). The process is not terminated.
    Error(String),
}

/// Broadcast bus for [`ServerEvent`]s.
///
/// Cloneable; all clones publish to the same set of subscribers. Emitting
/// with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Subscribe to notifications emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, ignoring the no-subscriber case.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(ServerEvent::Error("nobody listening".to_string()));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(ServerEvent::CertificateError {
            domain: "a.example".to_string(),
            reason: "missing file".to_string(),
        });
        match rx.recv().await.unwrap() {
            ServerEvent::CertificateError { domain, .. } => assert_eq!(domain, "a.example"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
