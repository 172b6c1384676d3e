//! Frame decoding: turning one raw inbound frame into a routable envelope
//!
//! The core never understands venue payloads. It only needs a channel key to
//! route by, extracted with one of two deterministic rules tried in order:
//! an explicit `"stream"` wrapper field, or an `"e"` event-type discriminator
//! mapped through a per-venue [`RouteTable`].

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotAnObject,
    #[error("No routing rule matched frame (event type: {0:?})")]
    Unroutable(Option<String>),
    #[error("Event type {0} requires an instrument field but none was present")]
    MissingInstrument(String),
}

/// One decoded inbound frame: a resolved channel key plus its payload.
///
/// Transient - built per frame, cloned into subscriber queues, never stored.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel: String,
    pub payload: Value,
}

/// Decodes a raw inbound frame into an [`Envelope`].
///
/// Implemented by [`JsonDecoder`] for the common wrapped/discriminated JSON
/// shapes; venues with bespoke framing supply their own implementation.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, raw: &str) -> Result<Envelope, DecodeError>;
}

/// How a discriminated (flat) event maps back to a channel key.
#[derive(Debug, Clone)]
struct RouteRule {
    /// Stream name callers subscribe with (e.g. "depth", "ticker").
    stream: String,
    /// Whether the channel key embeds the instrument from the `"s"` field,
    /// producing `<instrument>@<stream>`.
    keyed_by_symbol: bool,
}

/// Discriminator-to-channel-key mapping for flat event frames.
///
/// This is per-venue configuration data, validated against the venue's event
/// catalog, not hard-coded branching.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: HashMap<String, RouteRule>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule: frames with `"e": event_type` route to `stream`,
    /// re-keyed as `<instrument>@<stream>` when `keyed_by_symbol` is set.
    pub fn with_rule(
        mut self,
        event_type: impl Into<String>,
        stream: impl Into<String>,
        keyed_by_symbol: bool,
    ) -> Self {
        self.rules.insert(
            event_type.into(),
            RouteRule {
                stream: stream.into(),
                keyed_by_symbol,
            },
        );
        self
    }

    fn get(&self, event_type: &str) -> Option<&RouteRule> {
        self.rules.get(event_type)
    }
}

/// Default decoder for JSON venues supporting both envelope shapes:
///
/// - wrapped: `{"stream": "<channelKey>", "data": {...}}`
/// - flat: `{"e": "<eventType>", "s": "<instrument>", ...}`
pub struct JsonDecoder {
    routes: RouteTable,
}

impl JsonDecoder {
    pub fn new(routes: RouteTable) -> Self {
        Self { routes }
    }
}

impl FrameDecoder for JsonDecoder {
    fn decode(&self, raw: &str) -> Result<Envelope, DecodeError> {
        let value: Value = serde_json::from_str(raw)?;
        let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

        // Rule 1: explicit envelope wrapper. The stream field is the channel
        // key verbatim; payload is the "data" field when present.
        if let Some(stream) = obj.get("stream").and_then(|v| v.as_str()) {
            let channel = stream.to_string();
            let payload = obj.get("data").cloned().unwrap_or_else(|| value.clone());
            return Ok(Envelope { channel, payload });
        }

        // Rule 2: event-type discriminator mapped through the route table.
        if let Some(event_type) = obj.get("e").and_then(|v| v.as_str()) {
            let rule = self
                .routes
                .get(event_type)
                .ok_or_else(|| DecodeError::Unroutable(Some(event_type.to_string())))?;

            let channel = if rule.keyed_by_symbol {
                let symbol = obj
                    .get("s")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| DecodeError::MissingInstrument(event_type.to_string()))?;
                // Subscriptions use lowercase instrument names; flat events
                // carry them uppercase.
                format!("{}@{}", symbol.to_lowercase(), rule.stream)
            } else {
                rule.stream.clone()
            };

            return Ok(Envelope {
                channel,
                payload: value,
            });
        }

        // Heartbeats and venue control frames land here; callers drop them.
        Err(DecodeError::Unroutable(None))
    }
}
