//! Topic broker
//!
//! Pattern-addressed fan-out of device messages. Subscribers register a
//! name pattern (`*` matches one token, a trailing `**` matches the
//! rest); publishers address a concrete topic. Delivery is at-most-once:
//! a subscriber whose buffer is full loses the message.

use super::DeviceMessage;
use crate::meta::Name;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Subscriber {
    id: Uuid,
    pattern: Name,
    tx: mpsc::Sender<(Name, DeviceMessage)>,
}

/// Pattern-matching message broker.
#[derive(Clone, Default)]
pub struct TopicBroker {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

/// Live subscription handle; dropping it unsubscribes.
pub struct TopicSubscription {
    id: Uuid,
    broker: TopicBroker,
    rx: mpsc::Receiver<(Name, DeviceMessage)>,
}

impl TopicBroker {
    /// Broker with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with a pattern and a bounded per-subscriber buffer.
    pub fn subscribe(&self, pattern: Name, buffer: usize) -> TopicSubscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .expect("broker lock poisoned")
            .push(Subscriber { id, pattern, tx });
        TopicSubscription {
            id,
            broker: self.clone(),
            rx,
        }
    }

    /// Publish a message under a concrete topic. Returns how many
    /// subscribers accepted it.
    pub fn publish(&self, topic: &Name, message: &DeviceMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("broker lock poisoned");
            for subscriber in subscribers.iter() {
                if !topic.matches(&subscriber.pattern) {
                    continue;
                }
                match subscriber.tx.try_send((topic.clone(), message.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            topic = %topic,
                            pattern = %subscriber.pattern,
                            "subscriber buffer full; message dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }
        if !closed.is_empty() {
            self.remove(&closed);
        }
        delivered
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("broker lock poisoned").len()
    }

    fn remove(&self, ids: &[Uuid]) {
        self.subscribers
            .lock()
            .expect("broker lock poisoned")
            .retain(|s| !ids.contains(&s.id));
    }
}

impl TopicSubscription {
    /// Receive the next matching message.
    pub async fn recv(&mut self) -> Option<(Name, DeviceMessage)> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<(Name, DeviceMessage)> {
        self.rx.try_recv().ok()
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.broker.remove(&[self.id]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Address;
    use chrono::Utc;

    fn message(device: &str) -> DeviceMessage {
        DeviceMessage::DeviceDetached {
            source: Address::new("hub".into(), device.into()),
            timestamp: Utc::now(),
        }
    }

    fn name(text: &str) -> Name {
        Name::parse(text).unwrap()
    }

    #[tokio::test]
    async fn test_trailing_wildcard_fanout() {
        let broker = TopicBroker::new();
        let mut sub = broker.subscribe(name("sensors.**"), 8);

        broker.publish(&name("sensors.temp.1"), &message("t1"));
        broker.publish(&name("sensors.pressure"), &message("p1"));
        broker.publish(&name("actuators.motor.1"), &message("m1"));

        let (topic, _) = sub.recv().await.unwrap();
        assert_eq!(topic, name("sensors.temp.1"));
        let (topic, _) = sub.recv().await.unwrap();
        assert_eq!(topic, name("sensors.pressure"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_single_token_wildcard() {
        let broker = TopicBroker::new();
        let mut sub = broker.subscribe(name("a.*.c"), 8);
        broker.publish(&name("a.b.c"), &message("x"));
        broker.publish(&name("a.b.d"), &message("y"));
        let (topic, _) = sub.recv().await.unwrap();
        assert_eq!(topic, name("a.b.c"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_buffer_drops() {
        let broker = TopicBroker::new();
        let mut sub = broker.subscribe(name("**"), 1);
        assert_eq!(broker.publish(&name("a"), &message("a")), 1);
        // buffer full: dropped, not delivered
        assert_eq!(broker.publish(&name("b"), &message("b")), 0);
        let (topic, _) = sub.recv().await.unwrap();
        assert_eq!(topic, name("a"));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broker = TopicBroker::new();
        let sub = broker.subscribe(name("**"), 4);
        assert_eq!(broker.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
