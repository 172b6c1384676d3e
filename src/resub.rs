//! Resubscription coordinator: replays subscriptions after reconnect
//!
//! The server forgets every subscription when the link drops. On each
//! `Connected` event this coordinator re-sends one subscribe frame per
//! channel still holding subscribers. Private endpoints replay nothing -
//! reopening the authenticated connection is the whole resubscription.

use crate::connection::{Connection, ConnectionEvent};
use crate::mux::Multiplexer;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ResubscriptionCoordinator;

impl ResubscriptionCoordinator {
    /// Spawn the replay task for one endpoint.
    pub fn spawn(
        mux: Arc<Multiplexer>,
        connection: Arc<Connection>,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Connected) => mux.replay_subscriptions(),
                    Ok(ConnectionEvent::Disconnected) => {
                        debug!("Connection down, awaiting reconnect");
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // A missed Connected signal only matters if the link
                        // is actually up; otherwise the next Connected event
                        // triggers the replay.
                        if connection.is_alive() {
                            warn!(missed, "Resubscription coordinator lagged, replaying");
                            mux.replay_subscriptions();
                        } else {
                            warn!(
                                missed,
                                "Resubscription coordinator lagged while disconnected"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Resubscription coordinator ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, EndpointKind};
    use crate::connection::StaticUrl;
    use crate::decode::{JsonDecoder, RouteTable};
    use crate::mux::tests::RecordingSink;
    use tokio::task::yield_now;

    fn mux(kind: EndpointKind, sink: Arc<RecordingSink>) -> Arc<Multiplexer> {
        Multiplexer::new(kind, sink, Arc::new(JsonDecoder::new(RouteTable::new())))
    }

    /// A spawned-but-never-connected connection handle.
    fn idle_connection() -> Arc<Connection> {
        let provider = Arc::new(StaticUrl::new("wss://stream.example.com/ws").unwrap());
        Arc::new(Connection::spawn(ConnectionConfig::default(), provider))
    }

    async fn settle() {
        for _ in 0..8 {
            yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_reconnect_replays_live_channels_only() {
        let sink = RecordingSink::new();
        let mux = mux(EndpointKind::Public, sink.clone());
        let (event_tx, event_rx) = broadcast::channel(16);
        let _task = ResubscriptionCoordinator::spawn(mux.clone(), idle_connection(), event_rx);

        let _depth = mux.subscribe("btcusdt@depth", vec![]).unwrap();
        let trade = mux.subscribe("ethusdt@trade", vec![]).unwrap();
        drop(trade); // Unsubscribed before the disconnect.

        sink.frames.lock().unwrap().clear();
        event_tx.send(ConnectionEvent::Disconnected).unwrap();
        event_tx.send(ConnectionEvent::Connected).unwrap();
        settle().await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("SUBSCRIBE"));
        assert!(sent[0].contains("btcusdt@depth"));
        assert!(!sent.iter().any(|f| f.contains("ethusdt@trade")));
    }

    #[tokio::test]
    async fn test_reconnect_with_empty_registry_sends_nothing() {
        let sink = RecordingSink::new();
        let mux = mux(EndpointKind::Public, sink.clone());
        let (event_tx, event_rx) = broadcast::channel(16);
        let _task = ResubscriptionCoordinator::spawn(mux, idle_connection(), event_rx);

        event_tx.send(ConnectionEvent::Connected).unwrap();
        settle().await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_private_endpoint_replays_nothing() {
        let sink = RecordingSink::new();
        let mux = mux(EndpointKind::Private, sink.clone());
        let (event_tx, event_rx) = broadcast::channel(16);
        let _task = ResubscriptionCoordinator::spawn(mux.clone(), idle_connection(), event_rx);

        let _sub = mux.subscribe("executionReport", vec![]).unwrap();
        event_tx.send(ConnectionEvent::Connected).unwrap();
        settle().await;
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_each_channel_replayed_once_per_reconnect() {
        let sink = RecordingSink::new();
        let mux = mux(EndpointKind::Public, sink.clone());
        let (event_tx, event_rx) = broadcast::channel(16);
        let _task = ResubscriptionCoordinator::spawn(mux.clone(), idle_connection(), event_rx);

        // Two subscribers, one channel: still one replay frame.
        let _a = mux.subscribe("btcusdt@depth", vec![]).unwrap();
        let _b = mux.subscribe("btcusdt@depth", vec![]).unwrap();

        sink.frames.lock().unwrap().clear();
        event_tx.send(ConnectionEvent::Connected).unwrap();
        settle().await;
        assert_eq!(sink.sent().len(), 1);

        sink.frames.lock().unwrap().clear();
        event_tx.send(ConnectionEvent::Connected).unwrap();
        settle().await;
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_lagged_events_do_not_replay_on_dead_link() {
        let sink = RecordingSink::new();
        let mux = mux(EndpointKind::Public, sink.clone());
        let _sub = mux.subscribe("btcusdt@depth", vec![]).unwrap();
        sink.frames.lock().unwrap().clear();

        // Overflow a capacity-1 channel before the coordinator runs, so its
        // first recv returns Lagged. The link never came up, so no frames.
        let (event_tx, event_rx) = broadcast::channel(1);
        for _ in 0..4 {
            event_tx.send(ConnectionEvent::Disconnected).unwrap();
        }
        let _task = ResubscriptionCoordinator::spawn(mux, idle_connection(), event_rx);
        settle().await;
        assert!(sink.sent().is_empty());
    }
}
