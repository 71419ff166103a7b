//! Sign-in challenge: nonce, PKCE verifier/challenge and the `state` parameter.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use edge_auth_config::EdgeConfig;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{Error, Result};

const NONCE_LENGTH: usize = 32;
const PKCE_VERIFIER_LENGTH: usize = 64;

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `BASE64URL(SHA-256(verifier))`, the `S256` code challenge.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Contents of the OAuth `state` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    /// Nonce of the sign-in attempt.
    pub nonce: String,
    /// Where to send the user once signed in.
    pub requested_uri: String,
}

impl AuthState {
    /// `BASE64URL(JSON)`.
    pub fn encode(&self) -> String {
        // Serializing two strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Inverse of [`AuthState::encode`].
    pub fn decode(state: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(state.trim_end_matches('='))
            .map_err(|e| Error::Parse(format!("state is not base64url: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Parse(format!("invalid state: {e}")))
    }
}

/// A fresh sign-in attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginChallenge {
    /// Anti-replay nonce, also stored in a cookie.
    pub nonce: String,
    /// PKCE code verifier, stored in a cookie for the code exchange.
    pub pkce_verifier: String,
    /// `S256` challenge derived from the verifier.
    pub code_challenge: String,
    /// Where to send the user once signed in.
    pub requested_uri: String,
}

impl std::fmt::Debug for LoginChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginChallenge")
            .field("nonce", &self.nonce)
            .field("pkce_verifier", &"[REDACTED]")
            .field("code_challenge", &self.code_challenge)
            .field("requested_uri", &self.requested_uri)
            .finish()
    }
}

impl LoginChallenge {
    /// Generate a new nonce and PKCE verifier.
    pub fn generate(requested_uri: impl Into<String>) -> Self {
        let pkce_verifier = random_token(PKCE_VERIFIER_LENGTH);
        Self {
            nonce: random_token(NONCE_LENGTH),
            code_challenge: code_challenge(&pkce_verifier),
            pkce_verifier,
            requested_uri: requested_uri.into(),
        }
    }

    /// The `state` parameter for this attempt.
    pub fn state(&self) -> String {
        AuthState {
            nonce: self.nonce.clone(),
            requested_uri: self.requested_uri.clone(),
        }
        .encode()
    }

    /// The identity provider's authorize URL for this attempt.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the configured auth domain does not form a URL.
    pub fn authorize_url(&self, config: &EdgeConfig, host: &str) -> Result<Url> {
        let mut url = hosted_ui_url(config, "/oauth2/authorize")?;
        url.query_pairs_mut()
            .append_pair(
                "redirect_uri",
                &format!("https://{host}{}", config.redirect_path_sign_in),
            )
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("state", &self.state())
            .append_pair("scope", &config.oauth_scopes.join(" "))
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &self.code_challenge)
            .append_pair("nonce", &self.nonce);
        Ok(url)
    }
}

/// The identity provider's logout URL, returning to the sign-out path on `host`.
pub fn logout_url(config: &EdgeConfig, host: &str) -> Result<Url> {
    let mut url = hosted_ui_url(config, "/logout")?;
    url.query_pairs_mut()
        .append_pair(
            "logout_uri",
            &format!("https://{host}{}", config.redirect_path_sign_out),
        )
        .append_pair("client_id", &config.client_id);
    Ok(url)
}

fn hosted_ui_url(config: &EdgeConfig, path: &str) -> Result<Url> {
    Url::parse(&format!("https://{}{path}", config.auth_domain)).map_err(|e| {
        Error::Config(edge_auth_config::ConfigError::Validation(format!(
            "invalid auth domain {}: {e}",
            config.auth_domain
        )))
    })
}
