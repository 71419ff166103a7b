//! edge-auth-config
//!
//! Configuration for the edge authentication engine: identity provider
//! endpoints, client id, redirect paths, requested scopes and the
//! `Set-Cookie` attribute policy applied to each class of session cookie.
//!
//! Configuration can be read from the JSON shape used by existing
//! deployments (`userPoolId`, `clientId`, `cookieSettings`, ...) or from a
//! TOML file with the same keys.

#![forbid(unsafe_code)]

mod cookie_policy;
mod error;
mod settings;

pub use cookie_policy::{CookieAttributes, SameSite};
pub use error::{ConfigError, Result};
pub use settings::{
    CookieSettings, DEFAULT_KEY_FETCH_COOLDOWN_SECONDS, EdgeConfig, issuer_for_user_pool,
    load_config_from_file,
};
