use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Uri;
use http::header::HeaderValue;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::spnego::{GssapiTokenSource, NegotiateTokenSource};
use super::{KerberosClient, LoginCredential, LoginFuture, LoginRequest, Principal};
use crate::error::Error;
use crate::util::truncate_body;

const DEFAULT_KINIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Logs in by running the system `kinit` against a private credential cache,
/// then mints a `Negotiate` token from that cache for every request.
#[derive(Clone, Debug)]
pub struct KinitLogin {
    program: PathBuf,
    timeout: Duration,
    tokens: Arc<dyn NegotiateTokenSource>,
}

impl Default for KinitLogin {
    fn default() -> Self {
        Self {
            program: PathBuf::from("kinit"),
            timeout: DEFAULT_KINIT_TIMEOUT,
            tokens: Arc::new(GssapiTokenSource::new()),
        }
    }
}

impl KinitLogin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token_source(mut self, tokens: Arc<dyn NegotiateTokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    async fn run(&self, request: LoginRequest<'_>) -> crate::Result<Arc<dyn KerberosClient>> {
        let principal = request.principal.clone();
        let login_error = |message: String| Error::KerberosLogin {
            principal: principal.to_string(),
            message,
        };

        let cache_dir = tempfile::Builder::new()
            .prefix("artifact-client-krb5")
            .tempdir()
            .map_err(|source| login_error(format!("failed to create credential cache: {source}")))?;
        let cache_path = cache_dir.path().join("ccache");

        let mut command = Command::new(&self.program);
        command
            .env("KRB5_CONFIG", request.config.path())
            .env("KRB5CCNAME", format!("FILE:{}", cache_path.display()))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let password = match request.credential {
            LoginCredential::Keytab(keytab) => {
                command
                    .arg("-k")
                    .arg("-t")
                    .arg(keytab.path())
                    .stdin(Stdio::null());
                None
            }
            LoginCredential::Password(password) => {
                command.stdin(Stdio::piped());
                Some(password)
            }
        };
        command.arg(principal.to_string());

        debug!(program = %self.program.display(), principal = %principal, "running kinit");
        let mut child = command.spawn().map_err(|source| {
            login_error(format!(
                "failed to run {}: {source}",
                self.program.display()
            ))
        })?;

        if let (Some(password), Some(mut stdin)) = (password, child.stdin.take()) {
            let mut line = password.expose().as_bytes().to_vec();
            line.push(b'\n');
            // kinit may exit before reading; the exit status tells what happened.
            if let Err(source) = stdin.write_all(&line).await {
                debug!(error = %source, "kinit closed stdin early");
            }
            zeroize::Zeroize::zeroize(&mut line);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| login_error(format!("kinit timed out after {:?}", self.timeout)))?
            .map_err(|source| login_error(format!("failed to wait for kinit: {source}")))?;

        if !output.status.success() {
            let stderr = truncate_body(&output.stderr);
            let stderr = stderr.trim();
            return Err(login_error(if stderr.is_empty() {
                format!("kinit exited with {}", output.status)
            } else {
                stderr.to_owned()
            }));
        }

        Ok(Arc::new(CredentialCacheClient {
            principal,
            cache_path,
            tokens: Arc::clone(&self.tokens),
            _cache_dir: cache_dir,
        }))
    }
}

impl super::KerberosLogin for KinitLogin {
    fn login<'a>(&'a self, request: LoginRequest<'a>) -> LoginFuture<'a> {
        Box::pin(self.run(request))
    }
}

/// Session backed by a `kinit`-populated credential cache.
///
/// Each request to `host` carries a fresh SPNEGO token for `HTTP@host`. When
/// no token can be minted the request goes out without one and the failure
/// is logged. The cache is removed when the client is dropped.
#[derive(Debug)]
pub struct CredentialCacheClient {
    principal: Principal,
    cache_path: PathBuf,
    tokens: Arc<dyn NegotiateTokenSource>,
    _cache_dir: TempDir,
}

impl CredentialCacheClient {
    pub fn credential_cache(&self) -> &Path {
        &self.cache_path
    }

    /// Value for the `KRB5CCNAME` environment variable.
    pub fn krb5ccname(&self) -> String {
        format!("FILE:{}", self.cache_path.display())
    }
}

impl KerberosClient for CredentialCacheClient {
    fn principal(&self) -> &Principal {
        &self.principal
    }

    fn authorization(&self, uri: &Uri) -> Option<HeaderValue> {
        let service = format!("HTTP@{}", uri.host()?);
        let token = match self.tokens.initial_token(&self.krb5ccname(), &service) {
            Ok(token) => token,
            Err(error) => {
                warn!(service = %service, error = %error, "could not mint negotiate token");
                return None;
            }
        };
        let mut value = HeaderValue::from_str(&format!("Negotiate {}", BASE64.encode(token))).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}
