//! `artifact-client` builds the HTTP transport used to talk to an artifact
//! repository service: certificate trust, mutual TLS, Kerberos, timeouts,
//! proxies and a bounded retry loop with cancellation.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use artifact_client::prelude::{
//!     Credentials, ServiceClient, ServiceConfig, ServiceDetails, StorageService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let details = ServiceDetails::new("https://artifacts.example.com/artifactory/")?
//!         .with_credentials(Credentials::access_token("token"));
//!     let config = ServiceConfig::builder(details)
//!         .http_retries(3)
//!         .http_retry_wait_millis(500)
//!         .overall_request_timeout(Duration::from_secs(60))
//!         .build()?;
//!
//!     let storage = StorageService::new(ServiceClient::build(&config).await?);
//!     let info = storage.storage_info().await?;
//!     println!("binaries={}", info.binaries_summary.binaries_count);
//!     Ok(())
//! }
//! ```
//!
//! # Retry semantics
//!
//! - `retries = N` allows at most `N + 1` attempts.
//! - 429, 5xx, dial, read and timeout failures are retried; other 4xx and
//!   certificate failures are not.
//! - Cancelling the context stops the loop during an attempt or a wait.
//! - Up to ten redirects are followed; each hop has its own retry budget.
//!   `Authorization` and `Cookie` are dropped when a hop changes origin.

mod client;
mod config;
mod context;
mod error;
pub mod kerberos;
mod metrics;
mod proxy;
mod redirect;
mod request;
mod response;
mod retry;
mod secret;
mod service;
mod storage;
mod tls;
mod transport;
mod util;

pub use crate::client::HttpClient;
pub use crate::config::{
    ClientCertificatePaths, ClientConfiguration, ClientConfigurationBuilder, DEFAULT_RETRIES,
    DEFAULT_RETRY_WAIT, TransportDefaults,
};
pub use crate::context::CancellationContext;
pub use crate::error::{CancelReason, Error, ErrorCode, ErrorKind, TransportErrorKind};
pub use crate::kerberos::{KerberosClient, KerberosLogin, KerberosSettings, KinitLogin};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::proxy::{ProxyEndpoint, ProxySettings};
pub use crate::redirect::RedirectPolicy;
pub use crate::request::ExecuteRequest;
pub use crate::response::HttpResponse;
pub use crate::retry::{Backoff, RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::secret::Secret;
pub use crate::service::{
    Credentials, DEFAULT_THREADS, Dispatched, KerberosSettingsFile, ServiceClient, ServiceConfig,
    ServiceConfigBuilder, ServiceDetails, ServiceSettings,
};
pub use crate::storage::{
    BinariesSummary, FileList, FileListEntry, FileListParams, FileStoreSummary, FolderInfo,
    FolderInfoChild, RepositorySummary, StorageInfo, StorageService,
};
pub use crate::tls::{ClientIdentity, RootStore, load_certificates_dir};
pub use crate::transport::{
    HttpTransport, TransportFailure, TransportFuture, TransportKind, TransportSummary,
};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Backoff, CancellationContext, ClientConfiguration, ClientMetricsSnapshot, Credentials,
        Dispatched, Error, ErrorCode, ErrorKind, ExecuteRequest, HttpClient, HttpResponse,
        HttpTransport, KerberosSettings, RedirectPolicy, Result, RetryPolicy, RootStore,
        ServiceClient, ServiceConfig, ServiceDetails, ServiceSettings, StorageService,
        TransportErrorKind, TransportFailure, TransportSummary,
    };
}

#[cfg(test)]
mod tests;
