//! In-memory certificate store
//!
//! Holds the private key generated for a pending CSR and the certificate once
//! the signer issues it. Nothing is ever written to disk.

use crate::error::StoreError;
use crate::identity::ClientIdentity;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct StoredPair {
    private_key_pem: Option<String>,
    certificate_pem: Option<String>,
}

/// Memory-only store for one node's certificate/key pair
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoredPair>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoredPair> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember the private key of a freshly generated CSR
    ///
    /// Any previously stored certificate belongs to an older key and is dropped.
    pub fn set_private_key(&self, private_key_pem: String) {
        let mut pair = self.lock();
        pair.private_key_pem = Some(private_key_pem);
        pair.certificate_pem = None;
    }

    /// Record the certificate issued for the stored key
    pub fn update_certificate(&self, certificate_pem: String) {
        self.lock().certificate_pem = Some(certificate_pem);
    }

    /// The current identity, if a valid one is available
    pub fn current(&self) -> Result<ClientIdentity, StoreError> {
        let pair = self.lock();
        match (&pair.certificate_pem, &pair.private_key_pem) {
            (Some(cert), Some(key)) => ClientIdentity::from_pem(cert, key),
            _ => Err(StoreError::NoCertKey),
        }
    }

    /// Forget the key and certificate
    pub fn clear(&self) {
        *self.lock() = StoredPair::default();
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pair = self.lock();
        f.debug_struct("MemoryStore")
            .field("has_private_key", &pair.private_key_pem.is_some())
            .field("has_certificate", &pair.certificate_pem.is_some())
            .finish()
    }
}
