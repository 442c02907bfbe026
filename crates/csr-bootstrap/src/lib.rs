//! Kubelet Client Certificate Bootstrap
//!
//! Obtains a signed client identity for a simulated node through the
//! Kubernetes `certificates.k8s.io/v1` CSR API, authenticating with a
//! bootstrap credential only.
//!
//! # Example
//!
//! ```no_run
//! use csr_bootstrap::{BootstrapConfig, BootstrapOutcome, CertificateBootstrapper, IdentityRequest, KubeCsrClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(bootstrap_client: kube::Client) -> Result<(), Box<dyn std::error::Error>> {
//! let bootstrapper = CertificateBootstrapper::new(BootstrapConfig::default());
//! let csr_client = KubeCsrClient::new(bootstrap_client);
//! let request = IdentityRequest::for_node("default", "km-1");
//!
//! match bootstrapper.bootstrap(&request, &csr_client, &CancellationToken::new()).await? {
//!     BootstrapOutcome::Issued(identity) => println!("issued {}", identity.common_name()),
//!     BootstrapOutcome::Pending { retry_after } => println!("retry in {:?}", retry_after),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Single-flight**: at most one CSR in flight per request key
//! - **Bounded polling**: an overall deadline plus a per-call polling window
//! - **Cancellation**: waits stop as soon as the caller's token is cancelled

pub mod bootstrapper;
pub mod client;
pub mod error;
pub mod identity;
pub mod store;
#[path = "trait.rs"]
pub mod csr_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use bootstrapper::{BootstrapConfig, BootstrapOutcome, BootstrapState, CertificateBootstrapper};
pub use client::KubeCsrClient;
pub use csr_trait::CsrClient;
pub use error::{BootstrapError, CsrError, StoreError};
pub use identity::{ClientIdentity, IdentityRequest, SigningRequest, KUBELET_CLIENT_SIGNER};
pub use store::MemoryStore;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockCsrClient;
