//! Session credential manager for private streams
//!
//! Private endpoints authenticate with a server-issued, time-limited token
//! (a listen key, in venue parlance) that is created over REST, kept alive on
//! a timer, and embedded in the connection URL. The manager owns that
//! lifecycle: acquire starts the renewal task, a failed renewal invalidates
//! the credential and broadcasts the fact, release always tears down locally
//! even when the close call fails.
//!
//! Invalidation never reconnects anything by itself. The owning client
//! observes the event and tears the private connection down, because a stale
//! URL must not be dialed again and the venue does not reliably kill
//! connections whose token expired.

use crate::config::CredentialConfig;
use crate::connection::{ConnectionError, UrlProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Token create failed: {0}")]
    Create(String),
    #[error("Token keep-alive failed: {0}")]
    KeepAlive(String),
    #[error("Token close failed: {0}")]
    Close(String),
    #[error("Credential call timed out")]
    Timeout,
    #[error("No valid credential")]
    NotValid,
}

/// A freshly issued session token, as returned by the collaborator REST API.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub value: String,
    pub ttl: Duration,
}

/// Credential lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Uninitialized,
    Valid,
    Renewing,
    Expired,
    Invalid,
}

/// The out-of-scope REST collaborator: create / keep-alive / close a token.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn create_token(&self) -> Result<SessionToken, CredentialError>;
    async fn keep_alive(&self, value: &str) -> Result<(), CredentialError>;
    async fn close_token(&self, value: &str) -> Result<(), CredentialError>;
}

struct CredentialState {
    value: Option<String>,
    issued_at: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
    status: CredentialStatus,
}

/// Owns one session credential and its renewal task.
pub struct SessionManager {
    provider: Arc<dyn CredentialProvider>,
    config: CredentialConfig,
    state: Arc<Mutex<CredentialState>>,
    invalidation_tx: broadcast::Sender<()>,
    renewal_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn CredentialProvider>, config: CredentialConfig) -> Self {
        let (invalidation_tx, _) = broadcast::channel(4);
        Self {
            provider,
            config,
            state: Arc::new(Mutex::new(CredentialState {
                value: None,
                issued_at: None,
                ttl: None,
                status: CredentialStatus::Uninitialized,
            })),
            invalidation_tx,
            renewal_task: Mutex::new(None),
        }
    }

    /// Create a token and start the renewal task.
    ///
    /// Replaces any previous credential; the old renewal task is stopped
    /// first so background timers never leak across reconnects.
    pub async fn acquire(&self) -> Result<String, CredentialError> {
        self.stop_renewal();

        let token = tokio::time::timeout(self.config.call_timeout, self.provider.create_token())
            .await
            .map_err(|_| CredentialError::Timeout)??;

        let renewal_interval = self.effective_renewal_interval(token.ttl);
        {
            let mut state = self.state.lock().expect("credential state poisoned");
            state.value = Some(token.value.clone());
            state.issued_at = Some(Utc::now());
            state.ttl = Some(token.ttl);
            state.status = CredentialStatus::Valid;
        }
        info!(ttl = ?token.ttl, ?renewal_interval, "Session credential acquired");

        let task = tokio::spawn(renewal_task(
            self.provider.clone(),
            self.state.clone(),
            self.invalidation_tx.clone(),
            token.value.clone(),
            renewal_interval,
            token.ttl,
            self.config.call_timeout,
        ));
        *self.renewal_task.lock().expect("renewal task poisoned") = Some(task);

        Ok(token.value)
    }

    /// Best-effort token close; always ends Uninitialized.
    pub async fn release(&self) {
        self.stop_renewal();

        let value = {
            let mut state = self.state.lock().expect("credential state poisoned");
            let value = state.value.take();
            state.issued_at = None;
            state.ttl = None;
            state.status = CredentialStatus::Uninitialized;
            value
        };

        if let Some(value) = value {
            match tokio::time::timeout(self.config.call_timeout, self.provider.close_token(&value))
                .await
            {
                Ok(Ok(())) => debug!("Session credential closed"),
                Ok(Err(e)) => warn!("Ignoring token close failure: {}", e),
                Err(_) => warn!("Ignoring token close timeout"),
            }
        }
    }

    /// Current token value, while the credential is usable.
    pub fn current_value(&self) -> Option<String> {
        let state = self.state.lock().expect("credential state poisoned");
        match state.status {
            CredentialStatus::Valid | CredentialStatus::Renewing => state.value.clone(),
            _ => None,
        }
    }

    pub fn status(&self) -> CredentialStatus {
        self.state
            .lock()
            .expect("credential state poisoned")
            .status
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .expect("credential state poisoned")
            .issued_at
    }

    /// Receiver of invalidation events. One event per failed renewal cycle.
    pub fn invalidations(&self) -> broadcast::Receiver<()> {
        self.invalidation_tx.subscribe()
    }

    /// Keep `renewal_interval < ttl` with room for at least one attempt: a
    /// configured interval at or beyond the ttl is clamped to half of it.
    fn effective_renewal_interval(&self, ttl: Duration) -> Duration {
        let configured = self.config.renewal_interval;
        if configured + self.config.call_timeout >= ttl {
            let clamped = ttl / 2;
            warn!(
                ?configured,
                ?ttl,
                ?clamped,
                "Renewal interval leaves no margin before ttl, clamping"
            );
            clamped
        } else {
            configured
        }
    }

    fn stop_renewal(&self) {
        if let Some(task) = self
            .renewal_task
            .lock()
            .expect("renewal task poisoned")
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

/// Background renewal loop. Runs off the I/O path; a failed or timed-out
/// keep-alive invalidates the credential and stops the loop.
async fn renewal_task(
    provider: Arc<dyn CredentialProvider>,
    state: Arc<Mutex<CredentialState>>,
    invalidation_tx: broadcast::Sender<()>,
    value: String,
    renewal_interval: Duration,
    ttl: Duration,
    call_timeout: Duration,
) {
    let mut unrenewed_for = Duration::ZERO;
    loop {
        tokio::time::sleep(renewal_interval).await;
        unrenewed_for += renewal_interval;

        if unrenewed_for >= ttl {
            // Should not happen with a clamped interval; treat it as expiry
            // rather than keep-alive a token the venue already dropped.
            warn!("Session credential ttl elapsed without a renewal");
            invalidate(&state, &invalidation_tx, CredentialStatus::Expired);
            return;
        }

        {
            let mut s = state.lock().expect("credential state poisoned");
            s.status = CredentialStatus::Renewing;
        }
        debug!("Renewing session credential");

        match tokio::time::timeout(call_timeout, provider.keep_alive(&value)).await {
            Ok(Ok(())) => {
                let mut s = state.lock().expect("credential state poisoned");
                s.status = CredentialStatus::Valid;
                unrenewed_for = Duration::ZERO;
                debug!("Session credential renewed");
            }
            Ok(Err(e)) => {
                warn!("Session credential renewal failed: {}", e);
                invalidate(&state, &invalidation_tx, CredentialStatus::Invalid);
                return;
            }
            Err(_) => {
                warn!("Session credential renewal timed out");
                invalidate(&state, &invalidation_tx, CredentialStatus::Invalid);
                return;
            }
        }
    }
}

fn invalidate(
    state: &Mutex<CredentialState>,
    invalidation_tx: &broadcast::Sender<()>,
    status: CredentialStatus,
) {
    {
        let mut s = state.lock().expect("credential state poisoned");
        s.status = status;
    }
    if invalidation_tx.send(()).is_err() {
        debug!("Credential invalidated with no observers");
    }
}

/// URL provider for private endpoints: base URL plus the live token value.
///
/// Fails when the credential is not usable, so a stale token never reaches
/// the transport.
pub struct SessionUrl {
    base: Url,
    session: Arc<SessionManager>,
}

impl SessionUrl {
    pub fn new(base: &str, session: Arc<SessionManager>) -> Result<Self, ConnectionError> {
        Ok(Self {
            base: Url::parse(base)?,
            session,
        })
    }
}

#[async_trait]
impl UrlProvider for SessionUrl {
    async fn url(&self) -> Result<Url, ConnectionError> {
        let value = self.session.current_value().ok_or_else(|| {
            ConnectionError::UrlUnavailable("no valid session credential".to_string())
        })?;
        let joined = format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            value
        );
        Ok(Url::parse(&joined)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockProvider {
        keep_alive_calls: AtomicUsize,
        close_calls: AtomicUsize,
        fail_keep_alive: AtomicBool,
        fail_close: AtomicBool,
        ttl: Duration,
    }

    impl MockProvider {
        fn new(ttl: Duration) -> Self {
            Self {
                keep_alive_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
                fail_keep_alive: AtomicBool::new(false),
                fail_close: AtomicBool::new(false),
                ttl,
            }
        }
    }

    #[async_trait]
    impl CredentialProvider for MockProvider {
        async fn create_token(&self) -> Result<SessionToken, CredentialError> {
            Ok(SessionToken {
                value: "tok-abc123".to_string(),
                ttl: self.ttl,
            })
        }

        async fn keep_alive(&self, _value: &str) -> Result<(), CredentialError> {
            self.keep_alive_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_keep_alive.load(Ordering::SeqCst) {
                Err(CredentialError::KeepAlive("boom".to_string()))
            } else {
                Ok(())
            }
        }

        async fn close_token(&self, _value: &str) -> Result<(), CredentialError> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_close.load(Ordering::SeqCst) {
                Err(CredentialError::Close("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn manager(provider: Arc<MockProvider>, renewal_interval: Duration) -> SessionManager {
        SessionManager::new(
            provider,
            CredentialConfig {
                renewal_interval,
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_stores_valid_credential() {
        let provider = Arc::new(MockProvider::new(Duration::from_secs(3600)));
        let session = manager(provider, Duration::from_secs(60));

        let value = session.acquire().await.unwrap();
        assert_eq!(value, "tok-abc123");
        assert_eq!(session.status(), CredentialStatus::Valid);
        assert_eq!(session.current_value().as_deref(), Some("tok-abc123"));
        assert!(session.issued_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_fires_on_interval_and_rearms() {
        let provider = Arc::new(MockProvider::new(Duration::from_secs(3600)));
        let session = manager(provider.clone(), Duration::from_secs(60));
        session.acquire().await.unwrap();

        // Nothing before the interval elapses.
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(provider.keep_alive_calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(provider.keep_alive_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), CredentialStatus::Valid);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.keep_alive_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_invalidates_and_stops() {
        let provider = Arc::new(MockProvider::new(Duration::from_secs(3600)));
        let session = manager(provider.clone(), Duration::from_secs(60));
        let mut invalidations = session.invalidations();
        session.acquire().await.unwrap();

        provider.fail_keep_alive.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(session.status(), CredentialStatus::Invalid);
        assert!(session.current_value().is_none());
        invalidations.try_recv().unwrap();

        // Renewal scheduling is cancelled after invalidation.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(provider.keep_alive_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_interval_clamped_below_ttl() {
        // Configured interval exceeds the ttl; the manager must still renew
        // before the token would expire.
        let provider = Arc::new(MockProvider::new(Duration::from_secs(60)));
        let session = manager(provider.clone(), Duration::from_secs(3600));
        session.acquire().await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(provider.keep_alive_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), CredentialStatus::Valid);
    }

    #[tokio::test]
    async fn test_release_is_best_effort() {
        let provider = Arc::new(MockProvider::new(Duration::from_secs(3600)));
        provider.fail_close.store(true, Ordering::SeqCst);
        let session = manager(provider.clone(), Duration::from_secs(60));
        session.acquire().await.unwrap();

        session.release().await;
        assert_eq!(provider.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), CredentialStatus::Uninitialized);
        assert!(session.current_value().is_none());
    }

    #[tokio::test]
    async fn test_session_url_embeds_token() {
        let provider = Arc::new(MockProvider::new(Duration::from_secs(3600)));
        let session = Arc::new(manager(provider, Duration::from_secs(60)));
        session.acquire().await.unwrap();

        let url_provider = SessionUrl::new("wss://stream.example.com/ws", session.clone()).unwrap();
        let url = url_provider.url().await.unwrap();
        assert_eq!(url.as_str(), "wss://stream.example.com/ws/tok-abc123");

        session.release().await;
        assert!(matches!(
            url_provider.url().await.unwrap_err(),
            ConnectionError::UrlUnavailable(_)
        ));
    }
}
