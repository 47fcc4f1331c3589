#![forbid(unsafe_code)]

use std::sync::Arc;

use poem::http::{header::WWW_AUTHENTICATE, StatusCode};
use poem::web::headers::{authorization::Basic, Authorization, HeaderMapExt};
use poem::{Endpoint, IntoResponse, Middleware, Request, Response};

use log::{debug, info, warn};

use crate::utils::config::{AuthConfig, BasicUser, TrustedHeaderConfig};
use crate::utils::iwa_utils::hash_hex_secret;

// ***************************************************************************
//                          Constants and Enums
// ***************************************************************************
/// Paths that are only dispatched when a principal has been established.
pub const PROTECTED_PATHS: &[&str] = &["/auth"];

pub const BASIC_METHOD: &str = "Basic";

const DENIED_MSG: &str = "Authorization has been denied for this request.";

// ***************************************************************************
//                               Principal
// ***************************************************************************
/// The authenticated caller, stored as request data by [`HostAuth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub method: String,
}

impl Principal {
    pub fn new(name: impl Into<String>, method: impl Into<String>) -> Self {
        Self { name: name.into(), method: method.into() }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthnOutcome {
    Authenticated(Principal),
    /// The request carries nothing this authenticator understands.
    NoCredentials,
    /// Credentials were presented but are not acceptable.
    Rejected(String),
}

// ***************************************************************************
//                             Authenticators
// ***************************************************************************
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, req: &Request) -> AuthnOutcome;

    /// Value for a `WWW-Authenticate` header, if this scheme issues one.
    fn challenge(&self) -> Option<String>;
}

// ---------------------------------------------------------------------------
// TrustedHeaderAuthenticator:
// ---------------------------------------------------------------------------
/** Accepts the identity that a front end (IIS, Apache mod_auth_gssapi, ...)
 * established with Negotiate or Kerberos and forwarded in request headers.
 * Only enable this when clients cannot reach the server directly.
 */
pub struct TrustedHeaderAuthenticator {
    config: TrustedHeaderConfig,
}

impl TrustedHeaderAuthenticator {
    pub fn new(config: TrustedHeaderConfig) -> Self {
        Self { config }
    }
}

impl Authenticator for TrustedHeaderAuthenticator {
    fn authenticate(&self, req: &Request) -> AuthnOutcome {
        let user = match req.headers().get(self.config.user_header.as_str()) {
            Some(v) => match v.to_str() {
                Ok(s) => s.trim(),
                Err(e) => return AuthnOutcome::Rejected(
                    format!("invalid {} header: {}", self.config.user_header, e)),
            },
            None => return AuthnOutcome::NoCredentials,
        };
        if user.is_empty() {
            return AuthnOutcome::NoCredentials;
        }

        let method = req
            .headers()
            .get(self.config.method_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.config.default_method.as_str());

        AuthnOutcome::Authenticated(Principal::new(user, method))
    }

    fn challenge(&self) -> Option<String> {
        Some(self.config.default_method.clone())
    }
}

// ---------------------------------------------------------------------------
// BasicAuthenticator:
// ---------------------------------------------------------------------------
/** HTTP Basic authentication against users configured in iwa.toml.  Only the
 * hash of each secret is configured.
 */
pub struct BasicAuthenticator {
    realm: String,
    users: Vec<BasicUser>,
}

impl BasicAuthenticator {
    pub fn new(realm: &str, users: Vec<BasicUser>) -> Self {
        Self { realm: realm.to_string(), users }
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate(&self, req: &Request) -> AuthnOutcome {
        let Some(creds) = req.headers().typed_get::<Authorization<Basic>>() else {
            return AuthnOutcome::NoCredentials;
        };

        let user = match self.users.iter().find(|u| u.name == creds.username()) {
            Some(u) => u,
            None => return AuthnOutcome::Rejected(format!("unknown user {}", creds.username())),
        };

        if hash_hex_secret(creds.password()) == user.secret_hash.to_lowercase() {
            AuthnOutcome::Authenticated(Principal::new(user.name.clone(), BASIC_METHOD))
        } else {
            AuthnOutcome::Rejected(format!("invalid secret given for {}", user.name))
        }
    }

    fn challenge(&self) -> Option<String> {
        Some(format!("{} realm=\"{}\"", BASIC_METHOD, self.realm))
    }
}

// ***************************************************************************
//                              HostAuth Middleware
// ***************************************************************************
/// Resolves the caller's principal before routing and turns anonymous
/// requests to [`PROTECTED_PATHS`] away with 401.
#[derive(Clone)]
pub struct HostAuth {
    authenticators: Arc<Vec<Box<dyn Authenticator>>>,
}

impl HostAuth {
    pub fn new(authenticators: Vec<Box<dyn Authenticator>>) -> Self {
        Self { authenticators: Arc::new(authenticators) }
    }

    // ---------------------------------------------------------------------------
    // from_config:
    // ---------------------------------------------------------------------------
    /** The trusted header authenticator, when configured, is consulted before
     * Basic authentication.
     */
    pub fn from_config(config: &AuthConfig, realm: &str) -> Self {
        let mut authenticators: Vec<Box<dyn Authenticator>> = Vec::new();
        if let Some(trusted) = &config.trusted_header {
            info!("Trusting identities from header {}.", trusted.user_header);
            authenticators.push(Box::new(TrustedHeaderAuthenticator::new(trusted.clone())));
        }
        if !config.users.is_empty() {
            info!("Basic authentication enabled for {} user(s).", config.users.len());
            authenticators.push(Box::new(BasicAuthenticator::new(realm, config.users.clone())));
        }
        if authenticators.is_empty() {
            warn!("No authentication configured, protected paths will always answer 401.");
        }
        Self::new(authenticators)
    }
}

impl<E: Endpoint> Middleware<E> for HostAuth {
    type Output = HostAuthEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        HostAuthEndpoint { inner: ep, authenticators: self.authenticators.clone() }
    }
}

pub struct HostAuthEndpoint<E> {
    inner: E,
    authenticators: Arc<Vec<Box<dyn Authenticator>>>,
}

impl<E> HostAuthEndpoint<E> {
    fn resolve(&self, req: &Request) -> Option<Principal> {
        for authenticator in self.authenticators.iter() {
            match authenticator.authenticate(req) {
                AuthnOutcome::Authenticated(p) => return Some(p),
                AuthnOutcome::NoCredentials => (),
                AuthnOutcome::Rejected(reason) => {
                    warn!("Authentication rejected for {}: {}", req.uri().path(), reason);
                }
            }
        }
        None
    }

    fn denied(&self) -> Response {
        let mut builder = Response::builder().status(StatusCode::UNAUTHORIZED);
        for challenge in self.authenticators.iter().filter_map(|a| a.challenge()) {
            builder = builder.header(WWW_AUTHENTICATE, challenge);
        }
        builder.body(DENIED_MSG)
    }
}

impl<E: Endpoint> Endpoint for HostAuthEndpoint<E> {
    type Output = Response;

    async fn call(&self, mut req: Request) -> poem::Result<Self::Output> {
        match self.resolve(&req) {
            Some(principal) => {
                debug!("Request to {} authenticated as {:?}.", req.uri().path(), principal);
                req.set_data(principal);
            }
            None if PROTECTED_PATHS.contains(&req.uri().path()) => {
                return Ok(self.denied());
            }
            None => (),
        }
        self.inner.call(req).await.map(IntoResponse::into_response)
    }
}
