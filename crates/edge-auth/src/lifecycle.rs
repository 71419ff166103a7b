//! Session Lifecycle Controller.
//!
//! Decides, per request, whether the browser's session is usable and what
//! cookies to send back. States:
//!
//! ```text
//! Anonymous ──check──▶ PendingAuth ──complete_sign_in──▶ Authenticated
//!                                                          │   ▲
//!                                         check (Expired)  ▼   │ complete_refresh
//!                                                        Refreshing
//! any ──sign_out──▶ SignedOut
//! ```
//!
//! Verification failures never escape as errors: they become a [`Decision`].
//! The one exception is a callback that does not belong to the pending
//! sign-in, which is returned as a [`Rejection`].

use std::fmt;
use std::sync::Arc;

use edge_auth_config::EdgeConfig;
use serde::Serialize;

use crate::cookie::{CookieEntry, HeaderValues, set_cookie_headers};
use crate::jwks::{JwksFetcher, KeyResolver};
use crate::jwt::{TokenVerifier, VerifyOptions};
use crate::pkce::{AuthState, LoginChallenge, logout_url};
use crate::session::{self, NONCE_COOKIE, PKCE_COOKIE, SessionRecord, TokenResponse};
use crate::{Error, Result};

/// The parts of an HTTP request the engine reads.
#[derive(Debug, Clone, Default)]
pub struct EdgeRequest {
    /// Lower-cased header name to every value received.
    pub headers: HeaderValues,
    /// Path and query as requested.
    pub uri: String,
}

impl EdgeRequest {
    /// A request for `uri` with no headers.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            headers: HeaderValues::new(),
            uri: uri.into(),
        }
    }

    /// Append a header value; the name is lower-cased.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// The `host` header.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get("host")
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|h| !h.is_empty())
    }

    fn require_host(&self) -> Result<&str> {
        self.host()
            .ok_or_else(|| Error::Request("missing host header".to_string()))
    }

    /// Host without port, used as the default cookie domain.
    fn cookie_domain(&self) -> &str {
        let host = self.host().unwrap_or_default();
        if host.starts_with('[') {
            // Bracketed IPv6 literal, optionally followed by a port.
            return host.find(']').map_or(host, |end| &host[..=end]);
        }
        host.rsplit_once(':').map_or(host, |(name, _)| name)
    }
}

/// Where a browser session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No usable session.
    Anonymous,
    /// Sent to the identity provider; nonce and verifier are in cookies.
    PendingAuth,
    /// Valid id token.
    Authenticated,
    /// Id token expired; waiting for a refresh grant.
    Refreshing,
    /// Signed out; every session cookie is expired.
    SignedOut,
}

/// What the HTTP boundary should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Pass the request through.
    Allow,
    /// The session is unusable: clear it and start a new sign-in.
    RedirectToLogin(LoginChallenge),
    /// No session: start a sign-in.
    RedirectToIdentityProvider(LoginChallenge),
    /// Exchange the session's refresh token and call
    /// [`LifecycleController::complete_refresh`].
    RefreshTokens,
    /// Expire every session cookie.
    ClearSession,
}

impl Decision {
    fn label(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::RedirectToLogin(_) => "redirect_to_login",
            Decision::RedirectToIdentityProvider(_) => "redirect_to_identity_provider",
            Decision::RefreshTokens => "refresh_tokens",
            Decision::ClearSession => "clear_session",
        }
    }
}

/// Result of one lifecycle step.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// State after this step.
    pub state: SessionState,
    /// What to do with the request.
    pub decision: Decision,
    /// Cookies to set, in order.
    pub cookies: Vec<CookieEntry>,
    /// Session after this step.
    pub session: SessionRecord,
    /// Redirect target, when the decision implies one.
    pub location: Option<String>,
}

impl Outcome {
    /// `("set-cookie", value)` pairs for the response.
    pub fn set_cookie_headers(&self) -> Vec<(String, String)> {
        set_cookie_headers(&self.cookies)
    }
}

/// A sign-in callback refused outright.
#[derive(Debug)]
pub struct Rejection {
    /// Why the callback was refused.
    pub error: Error,
    /// Response that clears the pending sign-in.
    pub fallback: Box<Outcome>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sign-in rejected: {}", self.error)
    }
}

impl std::error::Error for Rejection {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Drives sessions through their lifecycle for one client.
pub struct LifecycleController<F> {
    config: Arc<EdgeConfig>,
    verifier: TokenVerifier<F>,
}

#[cfg(feature = "fetch-reqwest")]
impl LifecycleController<crate::jwks::HttpJwksFetcher> {
    /// A controller fetching keys from the configured JWKS URI.
    pub fn from_config(config: EdgeConfig) -> Result<Self> {
        let fetcher = crate::jwks::HttpJwksFetcher::new(config.jwks_uri.clone())?;
        let resolver = KeyResolver::with_cooldown(fetcher, config.key_fetch_cooldown());
        Ok(Self::new(Arc::new(config), Arc::new(resolver)))
    }
}

impl<F: JwksFetcher> LifecycleController<F> {
    /// A controller sharing `resolver`'s key cache.
    pub fn new(config: Arc<EdgeConfig>, resolver: Arc<KeyResolver<F>>) -> Self {
        let opts = VerifyOptions {
            issuer: config.issuer.clone(),
            audience: config.client_id.clone(),
        };
        Self {
            verifier: TokenVerifier::new(resolver, opts),
            config,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    /// The token verifier.
    pub fn verifier(&self) -> &TokenVerifier<F> {
        &self.verifier
    }

    /// Every header the response to `outcome` carries: the configured
    /// security headers under lower-cased names, then one `set-cookie` per
    /// cookie.
    pub fn response_headers(&self, outcome: &Outcome) -> Vec<(String, String)> {
        self.config
            .http_headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .chain(outcome.set_cookie_headers())
            .collect()
    }

    /// Decide an ordinary request.
    ///
    /// # Errors
    ///
    /// `Error::Request` if a redirect is needed and the request has no host.
    pub async fn check(&self, request: &EdgeRequest) -> Result<Outcome> {
        let session = session::decode(&request.headers, &self.config.client_id);

        let outcome = if session.is_anonymous() {
            self.start_sign_in(request, Vec::new(), false)?
        } else {
            let verified = match session.id_token.as_deref() {
                Some(token) => self.verifier.verify(token).await.map(|_| ()),
                None => Err(Error::Parse("session has no id token".to_string())),
            };
            match verified {
                Ok(()) => Outcome {
                    state: SessionState::Authenticated,
                    decision: Decision::Allow,
                    cookies: Vec::new(),
                    session,
                    location: None,
                },
                Err(Error::Expired) if session.refresh_token.is_some() => Outcome {
                    state: SessionState::Refreshing,
                    decision: Decision::RefreshTokens,
                    cookies: Vec::new(),
                    session,
                    location: None,
                },
                Err(e) => {
                    log_verification_failure(&e, "Session rejected");
                    let mut cookies = self.clear(&session, request)?;
                    cookies.retain(|c| c.name != NONCE_COOKIE && c.name != PKCE_COOKIE);
                    self.start_sign_in(request, cookies, true)?
                }
            }
        };

        tracing::debug!(
            target: "edge_auth.lifecycle",
            state = ?outcome.state,
            decision = outcome.decision.label(),
            uri = %request.uri,
            "Request checked"
        );
        Ok(outcome)
    }

    /// Finish a sign-in: `state` is the callback's `state` parameter and
    /// `tokens` the token endpoint's response to the code exchange.
    ///
    /// # Errors
    ///
    /// A [`Rejection`] with `Error::NonceMismatch` if the callback does not
    /// belong to the sign-in recorded in the request's cookies, or with the
    /// verification error if the id token is not acceptable.
    pub async fn complete_sign_in(
        &self,
        request: &EdgeRequest,
        state: &str,
        tokens: TokenResponse,
    ) -> std::result::Result<Outcome, Rejection> {
        let pending = session::decode(&request.headers, &self.config.client_id);
        let reject = |error: Error| self.reject(&pending, request, error);

        let auth_state = AuthState::decode(state).map_err(reject)?;
        let nonce = match (&pending.nonce, &pending.pkce_verifier) {
            (Some(nonce), Some(_)) if *nonce == auth_state.nonce => nonce,
            _ => return Err(reject(Error::NonceMismatch)),
        };

        let claims = self
            .verifier
            .verify(&tokens.id_token)
            .await
            .map_err(reject)?;
        if claims.nonce() != Some(nonce.as_str()) {
            return Err(reject(Error::NonceMismatch));
        }

        let record = SessionRecord::from_tokens(tokens, &self.config.oauth_scopes);
        let cookies = self.encode(&record, request).map_err(reject)?;

        tracing::info!(
            target: "edge_auth.lifecycle",
            username = record.username.as_deref().unwrap_or_default(),
            "Sign-in completed"
        );
        Ok(Outcome {
            state: SessionState::Authenticated,
            decision: Decision::Allow,
            cookies,
            session: record,
            location: Some(auth_state.requested_uri),
        })
    }

    /// Finish a refresh started by [`Decision::RefreshTokens`].
    ///
    /// A failed grant or an unacceptable new id token signs the user out
    /// locally. A response without a refresh token keeps the stored one.
    ///
    /// # Errors
    ///
    /// Only if the new session cannot be encoded.
    pub async fn complete_refresh<E: fmt::Display>(
        &self,
        request: &EdgeRequest,
        result: std::result::Result<TokenResponse, E>,
    ) -> Result<Outcome> {
        let current = session::decode(&request.headers, &self.config.client_id);

        let mut tokens = match result {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(
                    target: "edge_auth.lifecycle",
                    error = %e,
                    "Token refresh failed"
                );
                return self.anonymous(&current, request);
            }
        };

        if let Err(e) = self.verifier.verify(&tokens.id_token).await {
            log_verification_failure(&e, "Refreshed id token rejected");
            return self.anonymous(&current, request);
        }

        let scopes = if current.scopes.is_empty() {
            &self.config.oauth_scopes
        } else {
            &current.scopes
        };
        if tokens.refresh_token.is_none() {
            tokens.refresh_token.clone_from(&current.refresh_token);
        }
        let record = SessionRecord::from_tokens(tokens, scopes);
        let cookies = self.encode(&record, request)?;

        tracing::debug!(target: "edge_auth.lifecycle", "Session refreshed");
        Ok(Outcome {
            state: SessionState::Authenticated,
            decision: Decision::Allow,
            cookies,
            session: record,
            location: None,
        })
    }

    /// Sign out from any state and send the browser to the identity
    /// provider's logout endpoint.
    ///
    /// # Errors
    ///
    /// `Error::Request` if the request has no host.
    pub fn sign_out(&self, request: &EdgeRequest) -> Result<Outcome> {
        let current = session::decode(&request.headers, &self.config.client_id);
        let location = logout_url(&self.config, request.require_host()?)?;
        let cookies = self.clear(&current, request)?;

        tracing::info!(
            target: "edge_auth.lifecycle",
            cookies = cookies.len(),
            "Signed out"
        );
        Ok(Outcome {
            state: SessionState::SignedOut,
            decision: Decision::ClearSession,
            cookies,
            session: SessionRecord::default(),
            location: Some(location.into()),
        })
    }

    fn start_sign_in(
        &self,
        request: &EdgeRequest,
        mut cookies: Vec<CookieEntry>,
        clearing: bool,
    ) -> Result<Outcome> {
        let host = request.require_host()?;
        let challenge = LoginChallenge::generate(request.uri.clone());
        let location = challenge.authorize_url(&self.config, host)?;
        let pending = SessionRecord::pending(&challenge.nonce, &challenge.pkce_verifier);
        cookies.extend(self.encode(&pending, request)?);

        let decision = if clearing {
            Decision::RedirectToLogin(challenge)
        } else {
            Decision::RedirectToIdentityProvider(challenge)
        };
        Ok(Outcome {
            state: SessionState::PendingAuth,
            decision,
            cookies,
            session: pending,
            location: Some(location.into()),
        })
    }

    fn anonymous(&self, current: &SessionRecord, request: &EdgeRequest) -> Result<Outcome> {
        Ok(Outcome {
            state: SessionState::Anonymous,
            decision: Decision::ClearSession,
            cookies: self.clear(current, request)?,
            session: SessionRecord::default(),
            location: None,
        })
    }

    fn reject(&self, pending: &SessionRecord, request: &EdgeRequest, error: Error) -> Rejection {
        match &error {
            Error::NonceMismatch => tracing::warn!(
                target: "edge_auth.lifecycle",
                uri = %request.uri,
                "Sign-in callback does not match the pending sign-in"
            ),
            other => log_verification_failure(other, "Sign-in callback rejected"),
        }
        let cookies = self.clear(pending, request).unwrap_or_else(|e| {
            tracing::warn!(
                target: "edge_auth.lifecycle",
                error = %e,
                "Cannot encode cookies clearing the rejected sign-in"
            );
            Vec::new()
        });
        Rejection {
            error,
            fallback: Box::new(Outcome {
                state: SessionState::Anonymous,
                decision: Decision::ClearSession,
                cookies,
                session: SessionRecord::default(),
                location: None,
            }),
        }
    }

    fn encode(&self, record: &SessionRecord, request: &EdgeRequest) -> Result<Vec<CookieEntry>> {
        session::encode(
            record,
            &self.config.client_id,
            request.cookie_domain(),
            &self.config.cookie_settings,
            false,
        )
    }

    fn clear(&self, record: &SessionRecord, request: &EdgeRequest) -> Result<Vec<CookieEntry>> {
        session::encode(
            record,
            &self.config.client_id,
            request.cookie_domain(),
            &self.config.cookie_settings,
            true,
        )
    }
}

fn log_verification_failure(error: &Error, message: &str) {
    if matches!(error, Error::Fetch(_)) {
        tracing::warn!(
            target: "edge_auth.lifecycle",
            kind = error.kind(),
            error = %error,
            "{message}"
        );
    } else {
        tracing::info!(
            target: "edge_auth.lifecycle",
            kind = error.kind(),
            error = %error,
            "{message}"
        );
    }
}
