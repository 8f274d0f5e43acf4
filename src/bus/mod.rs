use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::models::NotificationContent;

/// Message shape carried on the pub/sub bus: `{type: "notification", user_id, notification}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: String,
    pub notification: BusNotification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusNotification {
    pub notification_id: String,
    pub channel: String,
    pub content: NotificationContent,
}

impl BusMessage {
    pub fn notification(user_id: &str, notification_id: &str, channel: &str, content: NotificationContent) -> Self {
        Self {
            kind: "notification".to_string(),
            user_id: user_id.to_string(),
            notification: BusNotification {
                notification_id: notification_id.to_string(),
                channel: channel.to_string(),
                content,
            },
        }
    }
}

/// Single broadcast channel for SSE fan-out. Publishers are the SSE
/// provider and the presence service; subscribers are SSE broadcaster
/// instances, one subscription per open stream.
pub struct Bus {
    sender: broadcast::Sender<BusMessage>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcasts `message` to every current subscriber. Returns the
    /// number reached; `Err` means zero subscribers were listening, which
    /// callers that need delivery (e.g. the SSE provider) should treat as
    /// a send failure rather than success.
    pub fn publish(&self, message: BusMessage) -> Result<usize, broadcast::error::SendError<BusMessage>> {
        self.sender.send(message)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = Bus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let msg = BusMessage::notification("u1", "n1", "sse", NotificationContent::default());
        assert_eq!(bus.publish(msg).unwrap(), 2);

        let m1 = rx1.recv().await.unwrap();
        let m2 = rx2.recv().await.unwrap();
        assert_eq!(m1.notification.notification_id, "n1");
        assert_eq!(m2.user_id, "u1");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_an_error() {
        let bus = Bus::new(16);
        let result = bus.publish(BusMessage::notification("u1", "n1", "sse", NotificationContent::default()));
        assert!(result.is_err());
    }
}
