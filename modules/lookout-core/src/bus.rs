//! In-process topic routing: a topic → subscribers table with synchronous
//! fan-out. Publishing delivers the record to every subscriber before
//! control returns; the bus never queues or copies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::record::Record;

pub const PREFIX_IN: &str = "inputs";
pub const PREFIX_OUT: &str = "output";
pub const SEPARATOR: char = '/';

pub type SubscriberFn = dyn Fn(&str, &Record) + Send + Sync;

struct Subscriber {
    label: String,
    callback: Arc<SubscriberFn>,
}

#[derive(Default)]
pub struct MessageBus {
    subscriptions: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber to a topic. Duplicates are allowed; a callback
    /// registered twice is invoked twice per publish. `label` is the
    /// subscriber's identity in logs.
    pub fn subscribe<F>(&self, topic: &str, label: impl Into<String>, callback: F)
    where
        F: Fn(&str, &Record) + Send + Sync + 'static,
    {
        let label = label.into();
        debug!(topic, subscriber = %label, "subscription");
        let mut subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        subscriptions.entry(topic.to_string()).or_default().push(Subscriber {
            label,
            callback: Arc::new(callback),
        });
    }

    /// Synchronously invoke every subscriber of `topic` in subscription
    /// order, on the caller's context. A topic with no subscribers is a
    /// silent no-op. The subscriber list is snapshotted first so callbacks
    /// may publish re-entrantly.
    pub fn publish(&self, topic: &str, record: &Record) {
        let subscribers: Vec<(String, Arc<SubscriberFn>)> = {
            let subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
            match subscriptions.get(topic) {
                Some(list) => list
                    .iter()
                    .map(|s| (s.label.clone(), Arc::clone(&s.callback)))
                    .collect(),
                None => return,
            }
        };
        debug!(topic, record = %record.debug(), subscribers = subscribers.len(), "publish");
        for (label, callback) in subscribers {
            debug!(topic, subscriber = %label, "delivering");
            callback(topic, record);
        }
    }

    /// Number of subscribers currently registered on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        subscriptions.get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn incoming_topic_for(actor: &str, entity: &str) -> String {
        format!("{PREFIX_IN}{SEPARATOR}{actor}{SEPARATOR}{entity}")
    }

    pub fn outgoing_topic_for(actor: &str, entity: &str) -> String {
        format!("{PREFIX_OUT}{SEPARATOR}{actor}{SEPARATOR}{entity}")
    }

    /// Split a message topic into `(direction, actor, entity)`. Topics have
    /// exactly three path segments.
    pub fn split_message_topic(topic: &str) -> Option<(&str, &str, &str)> {
        let mut parts = topic.split(SEPARATOR);
        let direction = parts.next()?;
        let actor = parts.next()?;
        let entity = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some((direction, actor, entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_run_in_subscription_order() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe("output/a/e", format!("sub{i}"), move |_, _| {
                seen.lock().unwrap().push(i);
            });
        }
        bus.publish("output/a/e", &Record::text("hi"));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = MessageBus::new();
        bus.publish("output/nobody/home", &Record::text("hi"));
    }

    #[test]
    fn duplicate_subscription_delivers_twice() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = Arc::clone(&count);
            bus.subscribe("inputs/a/e", "dup", move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.publish("inputs/a/e", &Record::text("hi"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callbacks_receive_the_subscribed_topic() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_cb = Arc::clone(&seen);
        bus.subscribe("output/a/e", "probe", move |topic, _| {
            *seen_cb.lock().unwrap() = topic.to_string();
        });
        bus.publish("output/a/e", &Record::text("hi"));
        assert_eq!(&*seen.lock().unwrap(), "output/a/e");
    }

    #[test]
    fn reentrant_publish_does_not_deadlock() {
        let bus = Arc::new(MessageBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_inner = Arc::clone(&hits);
        bus.subscribe("inputs/b/e", "inner", move |_, _| {
            hits_inner.fetch_add(1, Ordering::SeqCst);
        });
        let bus_fwd = Arc::clone(&bus);
        bus.subscribe("output/a/e", "forwarder", move |_, record| {
            bus_fwd.publish("inputs/b/e", record);
        });
        bus.publish("output/a/e", &Record::text("hi"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn topic_naming_and_splitting() {
        let topic = MessageBus::incoming_topic_for("rss", "feed one");
        assert_eq!(topic, "inputs/rss/feed one");
        assert_eq!(
            MessageBus::split_message_topic(&topic),
            Some(("inputs", "rss", "feed one"))
        );
        assert_eq!(MessageBus::split_message_topic("too/many/parts/here"), None);
        assert_eq!(MessageBus::split_message_topic("short"), None);
    }
}
