//! Owning client: wires endpoints, the session watchdog, and teardown
//!
//! One [`StreamClient`] holds up to two logical endpoints: a public one
//! (control-frame subscriptions) and a private one (credential-authenticated,
//! implicit subscriptions). Each endpoint gets its own connection task, frame
//! pump, and resubscription coordinator. The private endpoint additionally
//! gets a watchdog that recycles the connection whenever the session
//! credential is invalidated - the invalidation event, not the transport, is
//! the authoritative teardown trigger.

use crate::config::{ConnectionConfig, CredentialConfig, EndpointKind};
use crate::connection::{Connection, ConnectionError, StaticUrl};
use crate::decode::FrameDecoder;
use crate::mux::{Multiplexer, MuxError, Subscription};
use crate::resub::ResubscriptionCoordinator;
use crate::session::{CredentialError, CredentialProvider, SessionManager, SessionUrl};
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),
    #[error("Endpoint not configured: {0}")]
    NotConfigured(&'static str),
}

/// Public endpoint configuration.
#[derive(Debug, Clone)]
pub struct PublicEndpointConfig {
    pub url: String,
    pub connection: ConnectionConfig,
}

/// Private endpoint configuration. The dial URL is `base_url` plus the live
/// session token.
#[derive(Debug, Clone)]
pub struct PrivateEndpointConfig {
    pub base_url: String,
    pub connection: ConnectionConfig,
    pub credential: CredentialConfig,
}

struct Endpoint {
    connection: Arc<Connection>,
    mux: Arc<Multiplexer>,
    pump: JoinHandle<()>,
    resub: JoinHandle<()>,
}

impl Endpoint {
    fn build(
        kind: EndpointKind,
        connection: Arc<Connection>,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Self {
        let mux = Multiplexer::new(kind, connection.clone(), decoder);
        let pump = mux.spawn_pump(connection.frames());
        let resub =
            ResubscriptionCoordinator::spawn(mux.clone(), connection.clone(), connection.events());
        Self {
            connection,
            mux,
            pump,
            resub,
        }
    }

    fn shutdown(&self) {
        let _ = self.connection.disconnect();
        self.pump.abort();
        self.resub.abort();
    }
}

struct PrivateEndpoint {
    endpoint: Endpoint,
    session: Arc<SessionManager>,
    watchdog: Option<JoinHandle<()>>,
}

/// Multiplexed streaming client for one venue.
pub struct StreamClient {
    decoder: Arc<dyn FrameDecoder>,
    public: Option<Endpoint>,
    private: Option<PrivateEndpoint>,
    started: bool,
}

impl StreamClient {
    pub fn new(decoder: Arc<dyn FrameDecoder>) -> Self {
        Self {
            decoder,
            public: None,
            private: None,
            started: false,
        }
    }

    /// Attach a public market-data endpoint.
    pub fn with_public(mut self, config: PublicEndpointConfig) -> Result<Self, ClientError> {
        let provider = Arc::new(StaticUrl::new(&config.url)?);
        let connection = Arc::new(Connection::spawn(config.connection, provider));
        self.public = Some(Endpoint::build(
            EndpointKind::Public,
            connection,
            self.decoder.clone(),
        ));
        Ok(self)
    }

    /// Attach a private account-data endpoint backed by a credential provider.
    pub fn with_private(
        mut self,
        config: PrivateEndpointConfig,
        provider: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ClientError> {
        let session = Arc::new(SessionManager::new(provider, config.credential));
        let url_provider = Arc::new(SessionUrl::new(&config.base_url, session.clone())?);
        let connection = Arc::new(Connection::spawn(config.connection, url_provider));
        self.private = Some(PrivateEndpoint {
            endpoint: Endpoint::build(EndpointKind::Private, connection, self.decoder.clone()),
            session,
            watchdog: None,
        });
        Ok(self)
    }

    /// Bring every configured endpoint up. For the private endpoint this
    /// acquires the session credential first, then connects, then arms the
    /// invalidation watchdog.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if let Some(public) = &self.public {
            public.connection.connect().await?;
            info!("Public endpoint connected");
        }

        if let Some(private) = &mut self.private {
            private.session.acquire().await?;
            private.endpoint.connection.connect().await?;
            info!("Private endpoint connected");

            let watchdog = tokio::spawn(session_watchdog(
                private.session.clone(),
                private.endpoint.connection.clone(),
                private.session.invalidations(),
            ));
            private.watchdog = Some(watchdog);
        }

        self.started = true;
        Ok(())
    }

    /// Subscribe to a public channel.
    pub fn subscribe(
        &self,
        key: &str,
        extra_params: Vec<String>,
    ) -> Result<Subscription, ClientError> {
        let endpoint = self
            .public
            .as_ref()
            .ok_or(ClientError::NotConfigured("public"))?;
        Ok(endpoint.mux.subscribe(key, extra_params)?)
    }

    /// Subscribe to a private channel. No control frame is sent; the stream
    /// yields every private event routed to `key`.
    pub fn subscribe_private(&self, key: &str) -> Result<Subscription, ClientError> {
        let private = self
            .private
            .as_ref()
            .ok_or(ClientError::NotConfigured("private"))?;
        Ok(private.endpoint.mux.subscribe(key, Vec::new())?)
    }

    pub fn public_alive(&self) -> bool {
        self.public
            .as_ref()
            .map(|e| e.connection.is_alive())
            .unwrap_or(false)
    }

    pub fn private_alive(&self) -> bool {
        self.private
            .as_ref()
            .map(|p| p.endpoint.connection.is_alive())
            .unwrap_or(false)
    }

    /// Tear everything down: disconnect, release the credential, stop tasks.
    pub async fn stop(&mut self) {
        info!("Stopping stream client");

        if let Some(public) = &self.public {
            public.shutdown();
        }
        if let Some(private) = &mut self.private {
            if let Some(watchdog) = private.watchdog.take() {
                watchdog.abort();
            }
            private.endpoint.shutdown();
            private.session.release().await;
        }

        self.started = false;
        info!("Stream client stopped");
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if self.started {
            warn!("StreamClient dropped without calling stop()");
        }
    }
}

/// Recycle the private connection whenever the credential is invalidated:
/// tear the link down, release the stale token, re-acquire with backoff,
/// reconnect. The fresh URL picks up the new token automatically.
async fn session_watchdog(
    session: Arc<SessionManager>,
    connection: Arc<Connection>,
    mut invalidations: tokio::sync::broadcast::Receiver<()>,
) {
    while invalidations.recv().await.is_ok() {
        warn!("Session credential invalidated, recycling private connection");
        let _ = connection.disconnect();
        session.release().await;

        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };
        loop {
            match session.acquire().await {
                Ok(_) => break,
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    warn!(?delay, "Credential re-acquisition failed: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if connection.request_connect().is_err() {
            warn!("Private connection task gone, watchdog exiting");
            return;
        }
        info!("Private connection recycled with fresh credential");
    }
}
