//! Local relay for venues that split data across multiple origins or poll
//! REST endpoints that have no WebSocket equivalent.
//!
//! Each upstream source (a second WebSocket connection, or a REST poller)
//! publishes [`RawFrame`]s onto one [`tokio::sync::broadcast`] channel, and
//! the facade's transport for that adapter reads from the corresponding
//! receiver exactly as it would read frames from a socket, so every source
//! feeds the same decode path.

use tokio::sync::broadcast;

use crate::adapter::RawFrame;

/// Fan-in point for one adapter's auxiliary frame sources.
#[derive(Clone)]
pub struct Relay {
    sender: broadcast::Sender<RawFrame>,
}

impl Relay {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a frame from one upstream source into the relay. Silently
    /// drops if there are currently no subscribers (mirrors a loopback
    /// server denying/ignoring writes with nobody connected).
    pub fn publish(&self, frame: RawFrame) {
        let _ = self.sender.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RawFrame> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_frames_reach_subscribers() {
        let relay = Relay::new(16);
        let mut rx = relay.subscribe();

        relay.publish(RawFrame::Text("hello".into()));

        let received = rx.recv().await.unwrap();
        match received {
            RawFrame::Text(s) => assert_eq!(s, "hello"),
            _ => panic!("expected text frame"),
        }
    }

    #[tokio::test]
    async fn survives_publish_with_no_subscribers() {
        let relay = Relay::new(4);
        relay.publish(RawFrame::Text("dropped".into()));
        // No panic, no subscriber to receive it.
    }
}
