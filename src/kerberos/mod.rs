//! Kerberos negotiation performed once while a client is built.
//!
//! Negotiation is skipped unless a configuration file and a credential are
//! both present. Once enabled, a missing or malformed `krb5.conf`, an
//! unreadable keytab or a failed login aborts the build.

mod keytab;
mod kinit;
mod krb5conf;
mod spnego;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use http::Uri;
use http::header::HeaderValue;
use tracing::debug;

use crate::error::Error;
use crate::secret::Secret;

pub use keytab::{Keytab, KeytabEntry};
pub use kinit::{CredentialCacheClient, KinitLogin};
pub use krb5conf::{Krb5Config, ProfileValue};
pub use spnego::{GssapiTokenSource, NegotiateTokenSource};

/// `name@REALM`, or just `name` until the realm is known.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Principal {
    name: String,
    realm: Option<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>, realm: Option<String>) -> Self {
        Self {
            name: name.into(),
            realm: realm.filter(|realm| !realm.is_empty()),
        }
    }

    /// Splits `name@REALM`; a realm passed separately wins over one embedded in `text`.
    pub fn parse(text: &str, realm: Option<&str>) -> Self {
        let (name, embedded) = match text.rsplit_once('@') {
            Some((name, embedded)) => (name, Some(embedded)),
            None => (text, None),
        };
        let realm = realm
            .filter(|realm| !realm.is_empty())
            .or(embedded)
            .map(ToOwned::to_owned);
        Self::new(name, realm)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    fn with_default_realm(&self, default_realm: Option<&str>) -> Self {
        match (&self.realm, default_realm) {
            (None, Some(realm)) => Self::new(self.name.clone(), Some(realm.to_owned())),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.realm {
            Some(realm) => write!(formatter, "{}@{realm}", self.name),
            None => formatter.write_str(&self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KerberosCredential {
    Password(Secret),
    Keytab(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KerberosDetails {
    config_path: PathBuf,
    principal: Principal,
    credential: KerberosCredential,
}

impl KerberosDetails {
    pub fn new(
        config_path: impl Into<PathBuf>,
        principal: Principal,
        credential: KerberosCredential,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            principal,
            credential,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn credential(&self) -> &KerberosCredential {
        &self.credential
    }
}

/// Whether Kerberos takes part in client construction at all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum KerberosSettings {
    #[default]
    Disabled,
    Enabled(KerberosDetails),
}

impl KerberosSettings {
    /// Builds settings from loosely specified inputs where an empty string
    /// means "not set".
    ///
    /// Disabled unless `config_path` is set and at least one credential is.
    /// Supplying both a password and a keytab is rejected.
    pub fn from_parts(
        config_path: &str,
        username: &str,
        realm: &str,
        password: &str,
        keytab_path: &str,
    ) -> crate::Result<Self> {
        let config_path = config_path.trim();
        let keytab_path = keytab_path.trim();
        if config_path.is_empty() || (password.is_empty() && keytab_path.is_empty()) {
            return Ok(Self::Disabled);
        }

        let principal = Principal::parse(username.trim(), Some(realm.trim()));
        if principal.name().is_empty() {
            return Err(Error::InvalidConfiguration {
                field: "kerberos.username",
                message: "a username is required when kerberos is configured".to_owned(),
            });
        }

        let credential = match (password.is_empty(), keytab_path.is_empty()) {
            (false, false) => {
                return Err(Error::AmbiguousKerberosCredential {
                    principal: principal.to_string(),
                });
            }
            (false, true) => KerberosCredential::Password(Secret::new(password)),
            _ => KerberosCredential::Keytab(PathBuf::from(keytab_path)),
        };

        Ok(Self::Enabled(KerberosDetails::new(
            config_path,
            principal,
            credential,
        )))
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }
}

/// An authenticated Kerberos session held for the lifetime of a client.
///
/// Ticket renewal is up to the implementation.
pub trait KerberosClient: Send + Sync + fmt::Debug {
    fn principal(&self) -> &Principal;

    /// Value for the `Authorization` header of a request to `uri`, if this
    /// client mints one. Called once per attempt on the blocking pool, so it
    /// may contact the KDC.
    fn authorization(&self, uri: &Uri) -> Option<HeaderValue>;
}

/// Inputs to a login, already validated and loaded from disk.
#[derive(Debug)]
pub struct LoginRequest<'a> {
    pub principal: &'a Principal,
    pub config: &'a Krb5Config,
    pub credential: LoginCredential<'a>,
}

#[derive(Debug)]
pub enum LoginCredential<'a> {
    Password(&'a Secret),
    Keytab(&'a Keytab),
}

pub type LoginFuture<'a> =
    Pin<Box<dyn Future<Output = crate::Result<Arc<dyn KerberosClient>>> + Send + 'a>>;

/// Performs the ticket-granting login.
pub trait KerberosLogin: Send + Sync + fmt::Debug {
    fn login<'a>(&'a self, request: LoginRequest<'a>) -> LoginFuture<'a>;
}

pub(crate) async fn negotiate(
    settings: &KerberosSettings,
    login: &dyn KerberosLogin,
) -> crate::Result<Option<Arc<dyn KerberosClient>>> {
    let KerberosSettings::Enabled(details) = settings else {
        debug!("kerberos not configured, skipping negotiation");
        return Ok(None);
    };

    debug!(config = %details.config_path.display(), "loading kerberos configuration");
    let config = Krb5Config::load(&details.config_path)?;
    let principal = details
        .principal
        .with_default_realm(config.default_realm());
    if principal.realm().is_none() {
        return Err(Error::KerberosLogin {
            principal: principal.to_string(),
            message: "no realm given and krb5.conf has no default_realm".to_owned(),
        });
    }

    let keytab;
    let mut principal = principal;
    let credential = match &details.credential {
        KerberosCredential::Password(password) => LoginCredential::Password(password),
        KerberosCredential::Keytab(path) => {
            keytab = Keytab::load(path)?;
            let Some(entry) = keytab.entry_for(&principal.to_string()) else {
                return Err(Error::KerberosLogin {
                    principal: principal.to_string(),
                    message: format!("keytab {} has no entry for the principal", path.display()),
                });
            };
            // kinit looks the key up under the keytab's own spelling of the realm.
            principal = Principal::new(principal.name(), Some(entry.realm.clone()));
            LoginCredential::Keytab(&keytab)
        }
    };

    debug!(principal = %principal, "authenticating with kerberos");
    let client = login
        .login(LoginRequest {
            principal: &principal,
            config: &config,
            credential,
        })
        .await?;
    debug!(principal = %client.principal(), "kerberos authentication succeeded");
    Ok(Some(client))
}
