//! Channel multiplexer: many logical subscriptions over one connection
//!
//! Subscribing bumps a ref count and, on the 0->1 transition of a public
//! channel, sends exactly one SUBSCRIBE control frame. Dropping the returned
//! [`Subscription`] is the mirror image: synchronous removal from the
//! subscriber set, and a fire-and-forget UNSUBSCRIBE on 1->0. Private
//! endpoints send no control frames at all - the authenticated connection
//! itself is the subscription - but reuse the same ref-counting and routing.

use crate::channel::ChannelRegistry;
use crate::config::EndpointKind;
use crate::connection::{ConnectionError, FrameSink};
use crate::decode::{DecodeError, FrameDecoder};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Control frame could not be serialized: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// Subscribe/unsubscribe control frame, public-endpoint protocol.
#[derive(Debug, Serialize)]
pub struct ControlFrame {
    pub method: &'static str,
    pub params: Vec<String>,
    pub id: u64,
}

impl ControlFrame {
    fn subscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params,
            id,
        }
    }

    fn unsubscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: "UNSUBSCRIBE",
            params,
            id,
        }
    }
}

/// One caller's live event stream for a channel.
///
/// Dropping the subscription cancels it: no payload is delivered after drop
/// returns, even though an unsubscribe frame may still be in flight.
pub struct Subscription {
    key: String,
    subscriber_id: u64,
    receiver: mpsc::UnboundedReceiver<Value>,
    mux: Arc<Multiplexer>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next decoded payload routed to this channel, in wire order.
    /// Returns None once the subscription is dead.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mux.release(&self.key, self.subscriber_id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("subscriber_id", &self.subscriber_id)
            .finish_non_exhaustive()
    }
}

/// Multiplexer for one logical endpoint.
pub struct Multiplexer {
    kind: EndpointKind,
    registry: ChannelRegistry,
    sink: Arc<dyn FrameSink>,
    decoder: Arc<dyn FrameDecoder>,
    next_frame_id: AtomicU64,
    // Held across every ref-count transition and the enqueue of its control
    // frame, so wire order matches transition order.
    control: Mutex<()>,
}

impl Multiplexer {
    pub fn new(
        kind: EndpointKind,
        sink: Arc<dyn FrameSink>,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            registry: ChannelRegistry::new(),
            sink,
            decoder,
            next_frame_id: AtomicU64::new(1),
            control: Mutex::new(()),
        })
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Subscribe to a channel. `extra_params` are appended after the channel
    /// key in the control frame, for venues whose streams take arguments.
    pub fn subscribe(
        self: &Arc<Self>,
        key: &str,
        extra_params: Vec<String>,
    ) -> Result<Subscription, MuxError> {
        let _order = self.control.lock().expect("control lock poisoned");
        let added = self.registry.add(key, extra_params.clone());

        if added.first {
            match self.kind {
                EndpointKind::Public => {
                    if let Err(e) = self.send_subscribe(key, &extra_params) {
                        // A frame we cannot even serialize fails this call;
                        // the ref count is rolled back so a later subscriber
                        // retriggers the 0->1 transition.
                        self.registry.remove(key, added.subscriber_id);
                        return Err(e);
                    }
                }
                EndpointKind::Private => {
                    // Implicit subscription: the open connection carries all
                    // private events, nothing to send.
                    self.registry.mark_active(key);
                }
            }
        }

        Ok(Subscription {
            key: key.to_string(),
            subscriber_id: added.subscriber_id,
            receiver: added.receiver,
            mux: self.clone(),
        })
    }

    /// Replay one subscribe frame per channel still holding subscribers.
    /// Called by the resubscription coordinator on reconnect. No-op for
    /// private endpoints, where reopening the connection is the replay.
    pub(crate) fn replay_subscriptions(&self) {
        if self.kind != EndpointKind::Public {
            return;
        }
        let _order = self.control.lock().expect("control lock poisoned");
        let channels = self.registry.snapshot();
        if channels.is_empty() {
            debug!("No channels to replay");
            return;
        }
        info!(count = channels.len(), "Replaying subscriptions");
        for (key, extra_params) in channels {
            if let Err(e) = self.send_subscribe(&key, &extra_params) {
                warn!(channel = %key, "Failed to replay subscription: {}", e);
            }
        }
    }

    /// Send one SUBSCRIBE frame for a channel. Callers hold the control lock.
    fn send_subscribe(&self, key: &str, extra_params: &[String]) -> Result<(), MuxError> {
        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let frame = ControlFrame::subscribe(subscription_params(key, extra_params), id);
        let text = serde_json::to_string(&frame)?;
        match self.sink.send_text(text) {
            Ok(()) => {
                self.registry.mark_active(key);
                debug!(channel = key, id, "Subscribe frame sent");
            }
            Err(ConnectionError::NotConnected) => {
                // Replayed by the resubscription coordinator once the link
                // comes up.
                debug!(channel = key, "Link down, subscribe deferred to replay");
            }
            Err(e) => {
                warn!(channel = key, "Failed to send subscribe frame: {}", e);
            }
        }
        Ok(())
    }

    /// 1->0 path, called from Subscription::drop. Fire-and-forget.
    fn release(&self, key: &str, subscriber_id: u64) {
        let _order = self.control.lock().expect("control lock poisoned");
        let last = self.registry.remove(key, subscriber_id);
        if !last || self.kind != EndpointKind::Public {
            return;
        }

        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let frame = ControlFrame::unsubscribe(vec![key.to_string()], id);
        match serde_json::to_string(&frame) {
            Ok(text) => match self.sink.send_text(text) {
                Ok(()) => debug!(channel = key, id, "Unsubscribe frame sent"),
                Err(ConnectionError::NotConnected) => {
                    // The channel is gone from the registry, so a reconnect
                    // will simply not replay it.
                    debug!(channel = key, "Link down, unsubscribe skipped");
                }
                Err(e) => warn!(channel = key, "Failed to send unsubscribe frame: {}", e),
            },
            Err(e) => warn!(channel = key, "Failed to serialize unsubscribe frame: {}", e),
        }
    }

    /// Decode one raw inbound frame and deliver it to its channel.
    pub fn route_frame(&self, raw: &str) {
        match self.decoder.decode(raw) {
            Ok(envelope) => {
                let delivered = self.registry.route(&envelope);
                if delivered == 0 {
                    debug!(channel = %envelope.channel, "Frame matched no active channel, dropped");
                }
            }
            Err(DecodeError::Unroutable(event_type)) => {
                // Heartbeats and venue control frames land here.
                debug!(?event_type, "Unroutable frame dropped");
            }
            Err(e) => {
                warn!("Failed to decode frame: {}", e);
            }
        }
    }

    /// Drain a connection's raw-frame broadcast into the router. One pump
    /// task per endpoint keeps per-channel delivery in wire order.
    pub fn spawn_pump(self: &Arc<Self>, frames: broadcast::Receiver<String>) -> JoinHandle<()> {
        let mux = self.clone();
        tokio::spawn(async move {
            let mut frames = BroadcastStream::new(frames);
            while let Some(item) = frames.next().await {
                match item {
                    Ok(raw) => mux.route_frame(&raw),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(missed, "Frame pump lagged, frames lost");
                    }
                }
            }
            debug!("Frame pump ended");
        })
    }

    pub(crate) fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }
}

/// `params` for a subscribe frame: the channel key, then any stream args.
fn subscription_params(key: &str, extra_params: &[String]) -> Vec<String> {
    let mut params = Vec::with_capacity(1 + extra_params.len());
    params.push(key.to_string());
    params.extend(extra_params.iter().cloned());
    params
}
