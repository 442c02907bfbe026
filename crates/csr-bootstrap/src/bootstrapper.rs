//! Certificate bootstrap state machine
//!
//! One session per request key walks `Idle -> Requesting -> Polling` and ends
//! in `Issued` or `Failed`. A session is guarded by an async mutex so a second
//! caller for the same key waits for the in-flight attempt instead of
//! submitting another CSR.
//!
//! An issued identity is only handed out again while its certificate is
//! still valid. Sessions nobody has touched for `session_ttl` are evicted
//! whenever another session is looked up.

use crate::csr_trait::CsrClient;
use crate::error::{BootstrapError, StoreError};
use crate::identity::{ClientIdentity, IdentityRequest, SigningRequest};
use crate::store::MemoryStore;
use chrono::Utc;
use rcgen::KeyPair;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polling limits for certificate bootstrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Delay between two polls of the CSR
    pub poll_interval: Duration,
    /// Deadline measured from CSR submission
    pub timeout: Duration,
    /// Longest a single `bootstrap` call keeps polling before yielding
    pub poll_window: Duration,
    /// Idle time after which an unused session is evicted
    pub session_ttl: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            poll_window: Duration::from_secs(30),
            session_ttl: Duration::from_secs(600),
        }
    }
}

/// Where a bootstrap session currently is
#[derive(Debug, Clone)]
pub enum BootstrapState {
    /// Nothing requested yet
    Idle,
    /// Key generated, CSR being submitted
    Requesting,
    /// CSR submitted, waiting for the signer
    Polling {
        /// Name of the submitted CSR object
        csr_name: String,
        /// When the CSR was submitted
        submitted_at: Instant,
        /// Polls made so far
        polls: u32,
    },
    /// A valid certificate was issued
    Issued(ClientIdentity),
    /// The session ended without a certificate
    Failed(String),
}

/// Result of one `bootstrap` call
#[derive(Debug, Clone)]
pub enum BootstrapOutcome {
    /// The identity is ready
    Issued(ClientIdentity),
    /// The CSR is still pending; call again after `retry_after`
    Pending {
        /// Suggested delay before the next call
        retry_after: Duration,
    },
}

struct Session {
    state: BootstrapState,
    store: MemoryStore,
}

impl Session {
    fn new() -> Self {
        Self {
            state: BootstrapState::Idle,
            store: MemoryStore::new(),
        }
    }
}

type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

struct SessionEntry {
    handle: SessionHandle,
    last_used: Instant,
}

/// Obtains client identities through a CSR API, one session per request key
pub struct CertificateBootstrapper {
    config: BootstrapConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl CertificateBootstrapper {
    /// Create a bootstrapper with the given polling limits
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Polling limits in use
    pub fn config(&self) -> BootstrapConfig {
        self.config
    }

    /// Obtain a client identity for `request`
    ///
    /// Submits a CSR on the first call for a key, then polls until the
    /// certificate is issued, the deadline passes, the polling window closes
    /// (`Pending`), or `cancel` fires. A pending or cancelled session keeps its
    /// CSR so the next call resumes polling without resubmitting.
    pub async fn bootstrap(
        &self,
        request: &IdentityRequest,
        client: &dyn CsrClient,
        cancel: &CancellationToken,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let handle = self.session(&request.key);
        let mut session = tokio::select! {
            _ = cancel.cancelled() => return Err(BootstrapError::Cancelled(request.key.clone())),
            guard = handle.lock() => guard,
        };
        let window_start = Instant::now();

        match &session.state {
            BootstrapState::Issued(identity) if identity.not_after() > Utc::now() => {
                return Ok(BootstrapOutcome::Issued(identity.clone()));
            }
            BootstrapState::Issued(identity) => {
                info!(
                    "Issued certificate for {} expired at {}, requesting a new one",
                    request.key,
                    identity.not_after()
                );
                session.state = BootstrapState::Idle;
                session.store.clear();
            }
            BootstrapState::Failed(reason) => {
                // Another caller finished this session with a failure while we waited
                return Err(BootstrapError::failed(&request.key, reason));
            }
            BootstrapState::Idle | BootstrapState::Requesting | BootstrapState::Polling { .. } => {}
        }

        if !matches!(session.state, BootstrapState::Polling { .. }) {
            session.state = BootstrapState::Requesting;
            match self.request_certificate(request, client, &session.store).await {
                Ok(csr_name) => {
                    session.state = BootstrapState::Polling {
                        csr_name,
                        submitted_at: Instant::now(),
                        polls: 0,
                    };
                }
                Err(e) => {
                    self.fail(request, &mut session, &e);
                    return Err(e);
                }
            }
        }

        let result = self.poll(request, client, &mut session, cancel, window_start).await;
        if let Err(e) = &result {
            if !matches!(e, BootstrapError::Cancelled(_)) {
                self.fail(request, &mut session, e);
            }
        }
        result
    }

    /// Drop the session for `key`, forgetting any pending CSR or issued identity
    pub fn release(&self, key: &str) {
        if self.lock_sessions().remove(key).is_some() {
            debug!("Released bootstrap session {}", key);
        }
    }

    /// Current state of the session for `key`, if one exists
    ///
    /// Waits while a `bootstrap` call for the key is in flight.
    pub async fn state(&self, key: &str) -> Option<BootstrapState> {
        let handle = self
            .lock_sessions()
            .get(key)
            .map(|entry| entry.handle.clone())?;
        let session = handle.lock().await;
        Some(session.state.clone())
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    fn session(&self, key: &str) -> SessionHandle {
        let mut sessions = self.lock_sessions();
        let ttl = self.config.session_ttl;
        sessions.retain(|other, entry| {
            // A handle held elsewhere belongs to a call still in flight
            let keep = other == key
                || Arc::strong_count(&entry.handle) > 1
                || entry.last_used.elapsed() < ttl;
            if !keep {
                debug!("Evicting idle bootstrap session {}", other);
            }
            keep
        });

        let entry = sessions
            .entry(key.to_string())
            .or_insert_with(|| SessionEntry {
                handle: Arc::new(tokio::sync::Mutex::new(Session::new())),
                last_used: Instant::now(),
            });
        entry.last_used = Instant::now();
        entry.handle.clone()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the session failed and unregister it so the next call starts fresh
    fn fail(&self, request: &IdentityRequest, session: &mut Session, error: &BootstrapError) {
        warn!("Certificate bootstrap for {} failed: {}", request.key, error);
        session.state = BootstrapState::Failed(error.to_string());
        session.store.clear();
        self.release(&request.key);
    }

    async fn request_certificate(
        &self,
        request: &IdentityRequest,
        client: &dyn CsrClient,
        store: &MemoryStore,
    ) -> Result<String, BootstrapError> {
        let key_pair = KeyPair::generate().map_err(|e| BootstrapError::failed(&request.key, e))?;
        let signing_request =
            SigningRequest::new(request, &key_pair).map_err(|e| BootstrapError::failed(&request.key, e))?;
        store.set_private_key(key_pair.serialize_pem());

        let csr_name = client
            .submit(&signing_request)
            .await
            .map_err(|e| BootstrapError::failed(&request.key, e))?;
        info!(
            "Submitted CSR {} for {} ({})",
            csr_name, request.key, request.common_name
        );
        Ok(csr_name)
    }

    async fn poll(
        &self,
        request: &IdentityRequest,
        client: &dyn CsrClient,
        session: &mut Session,
        cancel: &CancellationToken,
        window_start: Instant,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let (csr_name, submitted_at) = match &session.state {
            BootstrapState::Polling {
                csr_name,
                submitted_at,
                ..
            } => (csr_name.clone(), *submitted_at),
            other => {
                return Err(BootstrapError::failed(
                    &request.key,
                    format!("cannot poll from state {:?}", other),
                ));
            }
        };

        loop {
            if cancel.is_cancelled() {
                return Err(BootstrapError::Cancelled(request.key.clone()));
            }

            if let BootstrapState::Polling { polls, .. } = &mut session.state {
                *polls += 1;
            }
            let issued = client
                .issued_certificate(&csr_name)
                .await
                .map_err(|e| BootstrapError::failed(&request.key, e))?;
            if let Some(certificate_pem) = issued {
                session.store.update_certificate(certificate_pem);
            }

            match session.store.current() {
                Ok(identity) => {
                    info!(
                        "Certificate for {} issued (CSR {}, expires {})",
                        request.key,
                        csr_name,
                        identity.not_after()
                    );
                    session.state = BootstrapState::Issued(identity.clone());
                    return Ok(BootstrapOutcome::Issued(identity));
                }
                Err(StoreError::NoCertKey) => {
                    debug!("CSR {} for {} not issued yet", csr_name, request.key);
                }
                Err(e) => return Err(BootstrapError::failed(&request.key, e)),
            }

            let remaining = self.config.timeout.saturating_sub(submitted_at.elapsed());
            if remaining.is_zero() {
                return Err(BootstrapError::Timeout {
                    key: request.key.clone(),
                    timeout_secs: self.config.timeout.as_secs(),
                });
            }
            let wait = self.config.poll_interval.min(remaining);
            if window_start.elapsed() + wait > self.config.poll_window {
                return Ok(BootstrapOutcome::Pending { retry_after: wait });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BootstrapError::Cancelled(request.key.clone()));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
