//! Outbound notifications.
//!
//! The engine publishes onto a broadcast channel and never calls consumers
//! directly; subscribers that fall behind lose the oldest messages.

pub mod webhook;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::scoring::ConfidenceResult;
use crate::tracker::ConvergenceState;
use crate::weights::WeightVector;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A result was appended to an entity's history.
    Scored {
        entity_id: String,
        sequence: u64,
        result: ConfidenceResult,
    },
    /// `classify` flipped an entity to Converged.
    Converged {
        entity_id: String,
        state: ConvergenceState,
    },
    WeightsUpdated {
        version: u64,
        weights: WeightVector,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Scored { .. } => "scored",
            Notification::Converged { .. } => "converged",
            Notification::WeightsUpdated { .. } => "weights_updated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, n: Notification) -> usize {
        // no subscribers is not an error
        self.tx.send(n).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let hub = NotificationHub::new(8);
        assert_eq!(
            hub.publish(Notification::WeightsUpdated {
                version: 1,
                weights: WeightVector::default()
            }),
            0
        );
        let mut rx = hub.subscribe();
        hub.publish(Notification::WeightsUpdated {
            version: 2,
            weights: WeightVector::default(),
        });
        match rx.recv().await.unwrap() {
            Notification::WeightsUpdated { version, .. } => assert_eq!(version, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let n = Notification::WeightsUpdated {
            version: 3,
            weights: WeightVector::default(),
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["type"], "weights_updated");
        assert_eq!(v["version"], 3);
    }
}
