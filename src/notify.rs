use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Money, Tier, TimeRange};

const CHANNEL_CAPACITY: usize = 256;

/// Events handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    ReservationConfirmed {
        reservation_id: Ulid,
        user_id: Ulid,
        court_id: Ulid,
        range: TimeRange,
        total: Money,
    },
    ReservationCancelled {
        reservation_id: Ulid,
        user_id: Ulid,
        court_id: Ulid,
    },
    ReservationCompleted {
        reservation_id: Ulid,
        user_id: Ulid,
    },
    TierUpgraded {
        user_id: Ulid,
        from: Tier,
        to: Tier,
        balance: u64,
    },
}

impl Notification {
    pub fn user_id(&self) -> Ulid {
        match self {
            Notification::ReservationConfirmed { user_id, .. }
            | Notification::ReservationCancelled { user_id, .. }
            | Notification::ReservationCompleted { user_id, .. }
            | Notification::TierUpgraded { user_id, .. } => *user_id,
        }
    }

    /// JSON payload for the delivery transport.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub: per-user channels plus one firehose for the delivery worker.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to notifications for one user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.user_id()) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification);
    }

    pub fn remove(&self, user_id: &Ulid) {
        self.channels.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);
        let mut all = hub.subscribe_all();

        let n = Notification::TierUpgraded {
            user_id: user,
            from: Tier::Beginner,
            to: Tier::Silver,
            balance: 105,
        };
        hub.send(n.clone());

        assert_eq!(rx.recv().await.unwrap(), n);
        assert_eq!(all.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn other_users_do_not_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(Notification::ReservationCompleted {
            reservation_id: Ulid::new(),
            user_id: Ulid::new(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        hub.send(Notification::ReservationCompleted {
            reservation_id: Ulid::new(),
            user_id: user,
        });
        hub.remove(&user);
    }

    #[test]
    fn json_payload_is_tagged() {
        let user = Ulid::new();
        let json = Notification::TierUpgraded {
            user_id: user,
            from: Tier::Silver,
            to: Tier::Gold,
            balance: 512,
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["kind"], "tier_upgraded");
        assert_eq!(value["user_id"], user.to_string());
        assert_eq!(value["to"], "Gold");
        assert_eq!(value["balance"], 512);
    }
}
