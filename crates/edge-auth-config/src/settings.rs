//! Edge configuration: the identity provider, client, redirect paths and
//! cookie policy one deployment runs with.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, CookieAttributes, Result, SameSite};

/// Default cooldown before a failed key lookup may hit the JWKS endpoint again.
pub const DEFAULT_KEY_FETCH_COOLDOWN_SECONDS: u64 = 30;

const DEFAULT_REDIRECT_PATH_SIGN_IN: &str = "/parseauth";
const DEFAULT_REDIRECT_PATH_SIGN_OUT: &str = "/";
const DEFAULT_SCOPES: [&str; 5] = [
    "phone",
    "email",
    "profile",
    "openid",
    "aws.cognito.signin.user.admin",
];

/// Cookie attribute policy per token class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieSettings {
    /// Applied to the id token, `LastAuthUser` and `userData` cookies.
    #[serde(default = "default_cookie_attributes")]
    pub id_token: CookieAttributes,

    /// Applied to the access token, scopes and hosted-UI marker cookies.
    #[serde(default = "default_cookie_attributes")]
    pub access_token: CookieAttributes,

    /// Applied to the refresh token cookie.
    #[serde(default = "default_cookie_attributes")]
    pub refresh_token: CookieAttributes,

    /// Applied to the nonce and PKCE verifier cookies.
    #[serde(default = "default_cookie_attributes")]
    pub nonce: CookieAttributes,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            id_token: default_cookie_attributes(),
            access_token: default_cookie_attributes(),
            refresh_token: default_cookie_attributes(),
            nonce: default_cookie_attributes(),
        }
    }
}

fn default_cookie_attributes() -> CookieAttributes {
    CookieAttributes {
        path: Some("/".to_string()),
        secure: true,
        http_only: true,
        same_site: Some(SameSite::Lax),
        ..CookieAttributes::default()
    }
}

/// Validated edge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeConfig {
    /// OAuth client id; also the expected `aud` of id tokens.
    pub client_id: String,

    /// Expected `iss` of id tokens.
    pub issuer: String,

    /// Where the issuer publishes its signing keys.
    pub jwks_uri: String,

    /// Hosted-UI domain serving `/oauth2/authorize` and `/logout`.
    pub auth_domain: String,

    /// Path the identity provider redirects back to after sign-in.
    pub redirect_path_sign_in: String,

    /// Path the identity provider redirects back to after sign-out.
    pub redirect_path_sign_out: String,

    /// Scopes requested at sign-in, in order.
    pub oauth_scopes: Vec<String>,

    /// Cookie attribute policy per token class.
    pub cookie_settings: CookieSettings,

    /// Cooldown, in seconds, between key-set retrievals for unknown keys.
    pub key_fetch_cooldown_seconds: u64,

    /// Security headers (HSTS, CSP, ...) added to every response the engine
    /// produces, keyed by header name.
    pub http_headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    user_pool_id: Option<String>,
    client_id: String,
    issuer: Option<String>,
    jwks_uri: Option<String>,
    cognito_auth_domain: String,
    #[serde(default = "default_sign_in_path")]
    redirect_path_sign_in: String,
    #[serde(default = "default_sign_out_path")]
    redirect_path_sign_out: String,
    #[serde(default = "default_scopes")]
    oauth_scopes: Vec<String>,
    #[serde(default)]
    cookie_settings: CookieSettings,
    #[serde(default = "default_cooldown")]
    key_fetch_cooldown_seconds: u64,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
}

fn default_sign_in_path() -> String {
    DEFAULT_REDIRECT_PATH_SIGN_IN.to_string()
}

fn default_sign_out_path() -> String {
    DEFAULT_REDIRECT_PATH_SIGN_OUT.to_string()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(ToString::to_string).collect()
}

fn default_cooldown() -> u64 {
    DEFAULT_KEY_FETCH_COOLDOWN_SECONDS
}

impl TryFrom<RawConfig> for EdgeConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let issuer = match (raw.issuer, raw.user_pool_id.as_deref()) {
            (Some(issuer), _) => issuer.trim_end_matches('/').to_string(),
            (None, Some(pool)) => issuer_for_user_pool(pool)?,
            (None, None) => {
                return Err(ConfigError::Validation(
                    "either issuer or userPoolId must be set".to_string(),
                ));
            }
        };
        let jwks_uri = raw
            .jwks_uri
            .unwrap_or_else(|| format!("{issuer}/.well-known/jwks.json"));

        let config = EdgeConfig {
            client_id: raw.client_id,
            issuer,
            jwks_uri,
            auth_domain: raw.cognito_auth_domain,
            redirect_path_sign_in: raw.redirect_path_sign_in,
            redirect_path_sign_out: raw.redirect_path_sign_out,
            oauth_scopes: raw.oauth_scopes,
            cookie_settings: raw.cookie_settings,
            key_fetch_cooldown_seconds: raw.key_fetch_cooldown_seconds,
            http_headers: raw.http_headers,
        };
        config.validate()?;
        Ok(config)
    }
}

impl EdgeConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        raw.try_into()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        raw.try_into()
    }

    /// Cooldown between key-set retrievals for unknown keys.
    pub fn key_fetch_cooldown(&self) -> Duration {
        Duration::from_secs(self.key_fetch_cooldown_seconds)
    }

    /// Check the constraints the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Validation("clientId is required".to_string()));
        }
        if !self.issuer.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "issuer must be an https URL, got {}",
                self.issuer
            )));
        }
        if !self.jwks_uri.starts_with("https://") && !self.jwks_uri.starts_with("http://") {
            return Err(ConfigError::Validation(format!(
                "jwksUri must be an http(s) URL, got {}",
                self.jwks_uri
            )));
        }
        if self.auth_domain.trim().is_empty() || self.auth_domain.contains('/') {
            return Err(ConfigError::Validation(
                "cognitoAuthDomain must be a bare host name".to_string(),
            ));
        }
        for (name, path) in [
            ("redirectPathSignIn", &self.redirect_path_sign_in),
            ("redirectPathSignOut", &self.redirect_path_sign_out),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "{name} must start with '/', got {path}"
                )));
            }
        }
        if self.oauth_scopes.is_empty() {
            return Err(ConfigError::Validation(
                "oauthScopes must not be empty".to_string(),
            ));
        }
        for (name, value) in &self.http_headers {
            let name_ok = !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
            if !name_ok || value.contains(['\r', '\n']) {
                return Err(ConfigError::Validation(format!(
                    "httpHeaders entry {name:?} is not a valid header"
                )));
            }
        }
        Ok(())
    }
}

/// Derive the issuer URL of a Cognito user pool (`<region>_<id>`).
pub fn issuer_for_user_pool(user_pool_id: &str) -> Result<String> {
    let (region, id) = user_pool_id.split_once('_').ok_or_else(|| {
        ConfigError::Validation(format!("malformed userPoolId: {user_pool_id}"))
    })?;

    let region_ok = region.split('-').count() >= 3
        && region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !region_ok || id.is_empty() {
        return Err(ConfigError::Validation(format!(
            "malformed userPoolId: {user_pool_id}"
        )));
    }

    Ok(format!(
        "https://cognito-idp.{region}.amazonaws.com/{user_pool_id}"
    ))
}

/// Load configuration from a file: `.json` is read as JSON, anything else as TOML.
pub fn load_config_from_file(path: &Path) -> Result<EdgeConfig> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config = if is_json {
        EdgeConfig::from_json_str(&content)?
    } else {
        EdgeConfig::from_toml_str(&content)?
    };

    tracing::debug!(
        target: "edge_auth.config",
        path = %path.display(),
        issuer = %config.issuer,
        client_id = %config.client_id,
        "Configuration loaded"
    );
    Ok(config)
}
