//! streammux: a venue-agnostic multiplexed streaming client core
//!
//! One physical WebSocket per logical endpoint, many independent
//! ref-counted channel subscriptions over it. The crate hides connection
//! loss (reconnect with backoff plus subscription replay), control-frame
//! bookkeeping, and - for private endpoints - the lifecycle of a
//! server-issued session credential renewed out of band.
//!
//! Venue specifics stay outside: a [`decode::FrameDecoder`] turns raw frames
//! into routable envelopes, and a [`session::CredentialProvider`] wraps the
//! venue's token REST calls.

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod decode;
pub mod logging;
pub mod mux;
pub mod resub;
pub mod session;

pub use client::{ClientError, PrivateEndpointConfig, PublicEndpointConfig, StreamClient};
pub use config::{ConnectionConfig, CredentialConfig, EndpointKind};
pub use connection::{Connection, ConnectionError, ConnectionEvent, ConnectionState};
pub use decode::{DecodeError, Envelope, FrameDecoder, JsonDecoder, RouteTable};
pub use mux::{Multiplexer, MuxError, Subscription};
pub use session::{
    CredentialError, CredentialProvider, CredentialStatus, SessionManager, SessionToken,
};
