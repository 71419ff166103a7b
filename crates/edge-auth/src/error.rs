//! Error types.

use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Token is not a well-formed compact JWS, or its header/claims are incomplete.
    #[error("malformed JWT: {0}")]
    Parse(String),

    /// No signing key is available for the token's `kid`.
    #[error("no signing key for kid {0:?}")]
    UnknownKey(String),

    /// Signature does not verify under the resolved key.
    #[error("JWT signature is invalid")]
    SignatureInvalid,

    /// `exp` is not in the future.
    #[error("JWT has expired")]
    Expired,

    /// `iss` is not the configured issuer.
    #[error("issuer mismatch: expected {expected}, got {found}")]
    IssuerMismatch {
        /// Configured issuer.
        expected: String,
        /// Issuer found in the token.
        found: String,
    },

    /// `aud` does not contain the configured audience.
    #[error("audience mismatch: expected {expected}")]
    AudienceMismatch {
        /// Configured audience.
        expected: String,
    },

    /// Callback does not belong to the sign-in attempt recorded in cookies.
    #[error("nonce does not match the pending sign-in")]
    NonceMismatch,

    /// The key set could not be fetched or parsed.
    #[error("JWKS fetch failed: {0}")]
    Fetch(String),

    /// The key set does not contain a usable key with this id.
    #[error("key {0:?} not found in JWKS")]
    KeyNotFound(String),

    /// A session cannot be turned into cookies.
    #[error("cannot encode session: {0}")]
    Session(String),

    /// The request lacks something the operation needs.
    #[error("bad request: {0}")]
    Request(String),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] edge_auth_config::ConfigError),
}

impl Error {
    /// Stable label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Parse(_) => "parse_error",
            Error::UnknownKey(_) => "unknown_key",
            Error::SignatureInvalid => "signature_invalid",
            Error::Expired => "expired",
            Error::IssuerMismatch { .. } => "issuer_mismatch",
            Error::AudienceMismatch { .. } => "audience_mismatch",
            Error::NonceMismatch => "nonce_mismatch",
            Error::Fetch(_) => "fetch_error",
            Error::KeyNotFound(_) => "key_not_found",
            Error::Session(_) => "session_error",
            Error::Request(_) => "bad_request",
            Error::Config(_) => "config_error",
        }
    }
}

#[cfg(feature = "fetch-reqwest")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Fetch(e.to_string())
    }
}
