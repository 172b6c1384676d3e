//! Reference-counted channel registry and per-subscriber delivery queues
//!
//! The registry is the single serialization point for all subscription
//! bookkeeping: a lost decrement racing a concurrent increment would produce
//! a spurious duplicate subscribe frame, so every ref-count mutation happens
//! under one mutex.

use crate::decode::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Lifecycle of one logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Inactive,
    Subscribing,
    Active,
    Unsubscribing,
}

struct ChannelEntry {
    /// Extra params appended after the channel key in the subscribe frame.
    extra_params: Vec<String>,
    status: ChannelStatus,
    /// Live subscriber queues; the ref count is the length of this set.
    subscribers: Vec<(u64, mpsc::UnboundedSender<Value>)>,
}

/// Outcome of adding a subscriber.
pub struct Added {
    pub subscriber_id: u64,
    pub receiver: mpsc::UnboundedReceiver<Value>,
    /// True on the 0->1 ref-count transition.
    pub first: bool,
}

/// Registry of all channels on one logical endpoint.
pub struct ChannelRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    channels: HashMap<String, ChannelEntry>,
    next_subscriber_id: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                channels: HashMap::new(),
                next_subscriber_id: 0,
            }),
        }
    }

    /// Add a subscriber to `key`, creating the channel on first use.
    pub fn add(&self, key: &str, extra_params: Vec<String>) -> Added {
        let mut inner = self.inner.lock().expect("channel registry poisoned");
        inner.next_subscriber_id += 1;
        let subscriber_id = inner.next_subscriber_id;

        let (tx, rx) = mpsc::unbounded_channel();
        let entry = inner
            .channels
            .entry(key.to_string())
            .or_insert_with(|| ChannelEntry {
                extra_params,
                status: ChannelStatus::Inactive,
                subscribers: Vec::new(),
            });

        let first = entry.subscribers.is_empty();
        if first {
            entry.status = ChannelStatus::Subscribing;
        }
        entry.subscribers.push((subscriber_id, tx));

        trace!(channel = key, subscriber_id, first, "Subscriber added");
        Added {
            subscriber_id,
            receiver: rx,
            first,
        }
    }

    /// Remove a subscriber. Returns true on the 1->0 transition, in which
    /// case the channel entry is gone from the registry when this returns.
    pub fn remove(&self, key: &str, subscriber_id: u64) -> bool {
        let mut inner = self.inner.lock().expect("channel registry poisoned");
        let Some(entry) = inner.channels.get_mut(key) else {
            return false;
        };
        entry.subscribers.retain(|(id, _)| *id != subscriber_id);
        let last = entry.subscribers.is_empty();
        if last {
            entry.status = ChannelStatus::Unsubscribing;
            inner.channels.remove(key);
        }
        trace!(channel = key, subscriber_id, last, "Subscriber removed");
        last
    }

    /// Mark a channel's subscribe as in effect.
    pub fn mark_active(&self, key: &str) {
        let mut inner = self.inner.lock().expect("channel registry poisoned");
        if let Some(entry) = inner.channels.get_mut(key) {
            entry.status = ChannelStatus::Active;
        }
    }

    pub fn status(&self, key: &str) -> Option<ChannelStatus> {
        let inner = self.inner.lock().expect("channel registry poisoned");
        inner.channels.get(key).map(|e| e.status)
    }

    pub fn ref_count(&self, key: &str) -> usize {
        let inner = self.inner.lock().expect("channel registry poisoned");
        inner
            .channels
            .get(key)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    /// Deliver one envelope to every current subscriber of its channel.
    ///
    /// Returns the number of subscribers reached; 0 means the frame matched
    /// no registered channel (or only dead queues) and was dropped.
    pub fn route(&self, envelope: &Envelope) -> usize {
        let mut inner = self.inner.lock().expect("channel registry poisoned");
        let Some(entry) = inner.channels.get_mut(&envelope.channel) else {
            return 0;
        };
        // Prune queues whose receiver is gone; Drop of the Subscription
        // already removed them, this only covers abandoned receivers.
        entry
            .subscribers
            .retain(|(_, tx)| tx.send(envelope.payload.clone()).is_ok());
        entry.subscribers.len()
    }

    /// All channels with ref count > 0, for resubscription replay.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        let inner = self.inner.lock().expect("channel registry poisoned");
        inner
            .channels
            .iter()
            .filter(|(_, e)| !e.subscribers.is_empty())
            .map(|(k, e)| (k.clone(), e.extra_params.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("channel registry poisoned");
        inner.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(channel: &str, payload: Value) -> Envelope {
        Envelope {
            channel: channel.to_string(),
            payload,
        }
    }

    #[test]
    fn test_first_and_last_transitions() {
        let registry = ChannelRegistry::new();

        let a = registry.add("btcusdt@depth", vec![]);
        assert!(a.first);
        let b = registry.add("btcusdt@depth", vec![]);
        assert!(!b.first);
        assert_eq!(registry.ref_count("btcusdt@depth"), 2);

        assert!(!registry.remove("btcusdt@depth", a.subscriber_id));
        assert!(registry.remove("btcusdt@depth", b.subscriber_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_route_reaches_only_matching_channel() {
        let registry = ChannelRegistry::new();
        let mut btc = registry.add("btcusdt@depth", vec![]);
        let mut eth = registry.add("ethusdt@depth", vec![]);

        let delivered = registry.route(&envelope("btcusdt@depth", serde_json::json!({"b": "1"})));
        assert_eq!(delivered, 1);
        assert!(btc.receiver.try_recv().is_ok());
        assert!(eth.receiver.try_recv().is_err());
    }

    #[test]
    fn test_route_unknown_channel_delivers_nothing() {
        let registry = ChannelRegistry::new();
        let _sub = registry.add("btcusdt@depth", vec![]);
        assert_eq!(registry.route(&envelope("btcusdt@trade", Value::Null)), 0);
    }

    #[test]
    fn test_removed_subscriber_gets_no_more_payloads() {
        let registry = ChannelRegistry::new();
        let mut a = registry.add("ethusdt@ticker", vec![]);
        let b = registry.add("ethusdt@ticker", vec![]);

        registry.remove("ethusdt@ticker", a.subscriber_id);
        registry.route(&envelope("ethusdt@ticker", serde_json::json!({"p": "1"})));

        assert!(a.receiver.try_recv().is_err());
        assert_eq!(registry.ref_count("ethusdt@ticker"), 1);
        drop(b);
    }

    #[test]
    fn test_snapshot_lists_live_channels_with_params() {
        let registry = ChannelRegistry::new();
        let a = registry.add("btcusdt@depth", vec!["100ms".to_string()]);
        let _b = registry.add("ethusdt@trade", vec![]);
        registry.remove("btcusdt@depth", a.subscriber_id);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "ethusdt@trade");
    }

    #[test]
    fn test_status_transitions() {
        let registry = ChannelRegistry::new();
        let a = registry.add("btcusdt@depth", vec![]);
        assert_eq!(
            registry.status("btcusdt@depth"),
            Some(ChannelStatus::Subscribing)
        );
        registry.mark_active("btcusdt@depth");
        assert_eq!(
            registry.status("btcusdt@depth"),
            Some(ChannelStatus::Active)
        );
        registry.remove("btcusdt@depth", a.subscriber_id);
        assert_eq!(registry.status("btcusdt@depth"), None);
    }
}
