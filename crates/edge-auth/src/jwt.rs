//! JWT verification against the resolved signing keys.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jwks::{JwksFetcher, KeyResolver};
use crate::{Error, Result};

/// Tokens larger than this are rejected before any decoding.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Claim carrying the identity provider's username.
pub const USERNAME_CLAIM: &str = "cognito:username";

/// `aud` claim: a single audience or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "client"`
    Single(String),
    /// `"aud": ["client", ...]`
    Many(Vec<String>),
}

impl Audience {
    /// True if `audience` is among the token's audiences.
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(a) => a == audience,
            Audience::Many(all) => all.iter().any(|a| a == audience),
        }
    }
}

/// Claims of an id token. Missing required claims fail parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// `iss`
    #[serde(rename = "iss")]
    pub issuer: String,

    /// `aud`
    #[serde(rename = "aud")]
    pub audience: Audience,

    /// `sub`
    #[serde(rename = "sub")]
    pub subject: String,

    /// `exp`, seconds since the Unix epoch.
    #[serde(rename = "exp")]
    pub expires_at: u64,

    /// `iat`, seconds since the Unix epoch.
    #[serde(rename = "iat")]
    pub issued_at: u64,

    /// Every other claim.
    #[serde(flatten)]
    pub custom_claims: BTreeMap<String, Value>,
}

impl JwtClaims {
    fn custom_str(&self, key: &str) -> Option<&str> {
        self.custom_claims.get(key).and_then(Value::as_str)
    }

    /// The identity provider's username (`cognito:username`).
    pub fn username(&self) -> Option<&str> {
        self.custom_str(USERNAME_CLAIM)
    }

    /// `email`
    pub fn email(&self) -> Option<&str> {
        self.custom_str("email")
    }

    /// `nonce`
    pub fn nonce(&self) -> Option<&str> {
        self.custom_str("nonce")
    }
}

/// A parsed but unverified compact JWS.
#[derive(Debug, Clone)]
pub struct UnverifiedJwt {
    /// Header.
    pub header: Header,
    /// Claims.
    pub claims: JwtClaims,
}

impl UnverifiedJwt {
    /// Split and decode a compact JWS without checking its signature.
    ///
    /// # Errors
    ///
    /// `Error::Parse` if the token is oversized, is not three base64url
    /// segments, or its header/claims are not the expected JSON.
    pub fn parse(token: &str) -> Result<Self> {
        if token.len() > MAX_JWT_SIZE_BYTES {
            return Err(Error::Parse(format!(
                "token is {} bytes, limit is {MAX_JWT_SIZE_BYTES}",
                token.len()
            )));
        }

        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Parse("expected three dot-separated segments".to_string()));
        };
        if signature.is_empty() {
            return Err(Error::Parse("missing signature segment".to_string()));
        }

        let header_bytes = decode_segment(header, "header")?;
        let payload_bytes = decode_segment(payload, "payload")?;
        decode_segment(signature, "signature")?;

        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| Error::Parse(format!("invalid header: {e}")))?;
        let claims: JwtClaims = serde_json::from_slice(&payload_bytes)
            .map_err(|e| Error::Parse(format!("invalid claims: {e}")))?;

        Ok(Self { header, claims })
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::Parse(format!("{what} is not base64url: {e}")))
}

/// Options for token verification.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Expected issuer (`iss`), compared exactly.
    pub issuer: String,

    /// Expected audience (`aud`).
    pub audience: String,
}

/// Verifies id tokens: key lookup, signature, expiry, issuer and audience.
pub struct TokenVerifier<F> {
    resolver: Arc<KeyResolver<F>>,
    opts: VerifyOptions,
}

impl<F: JwksFetcher> TokenVerifier<F> {
    /// Create a verifier sharing `resolver`'s key cache.
    pub fn new(resolver: Arc<KeyResolver<F>>, opts: VerifyOptions) -> Self {
        Self { resolver, opts }
    }

    /// The verification options.
    pub fn options(&self) -> &VerifyOptions {
        &self.opts
    }

    /// Verify `token` against the current time.
    pub async fn verify(&self, token: &str) -> Result<JwtClaims> {
        self.verify_at(token, now_epoch_secs()).await
    }

    /// Verify `token` as of `now` (seconds since the Unix epoch).
    ///
    /// An expired token is reported as `Error::Expired` whether or not its
    /// signature is valid; everything else requires a valid signature first.
    pub async fn verify_at(&self, token: &str, now: u64) -> Result<JwtClaims> {
        let result = self.verify_inner(token, now).await;
        if let Err(e) = &result {
            tracing::debug!(
                target: "edge_auth.jwt",
                kind = e.kind(),
                error = %e,
                "Token rejected"
            );
        }
        result
    }

    async fn verify_inner(&self, token: &str, now: u64) -> Result<JwtClaims> {
        let parsed = UnverifiedJwt::parse(token)?;

        let kid = parsed
            .header
            .kid
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Parse("header has no kid".to_string()))?;

        let key = self.resolver.get_key(kid).await.map_err(|e| match e {
            Error::KeyNotFound(kid) => Error::UnknownKey(kid),
            other => other,
        })?;

        if parsed.claims.expires_at <= now {
            return Err(Error::Expired);
        }

        if parsed.header.alg != key.algorithm() {
            tracing::warn!(
                target: "edge_auth.jwt",
                kid = %kid,
                header_alg = ?parsed.header.alg,
                key_alg = ?key.algorithm(),
                "Token algorithm does not match its key"
            );
            return Err(Error::SignatureInvalid);
        }

        // exp was checked above against the caller's clock; iss/aud are
        // checked below so each mismatch is reported distinctly.
        let mut validation = Validation::new(key.algorithm());
        validation.leeway = 0;
        validation.validate_exp = false;
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<JwtClaims>(token, key.decoding_key(), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => Error::SignatureInvalid,
                _ => Error::Parse(e.to_string()),
            })?;
        let claims = data.claims;

        if claims.issuer != self.opts.issuer {
            return Err(Error::IssuerMismatch {
                expected: self.opts.issuer.clone(),
                found: claims.issuer,
            });
        }

        if !claims.audience.contains(&self.opts.audience) {
            return Err(Error::AudienceMismatch {
                expected: self.opts.audience.clone(),
            });
        }

        Ok(claims)
    }
}

pub(crate) fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
