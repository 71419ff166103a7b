//! edge-auth
//!
//! Stateless session engine for authenticating requests at a CDN edge
//! against a Cognito user pool. All session state lives in browser cookies
//! named the way the Amplify JS SDK names them.
//!
//! - **Key resolution**: signing keys fetched from the issuer's JWKS, cached per `kid`
//! - **Token verification**: signature with the key's own algorithm, then `exp`/`iss`/`aud`
//! - **Session codec**: `Cookie` headers to a [`SessionRecord`] and back to `Set-Cookie` entries
//! - **Lifecycle**: per-request [`Decision`]s for sign-in, refresh and sign-out
//!
//! ## Quick start
//! ```no_run
//! use std::path::Path;
//!
//! use edge_auth::{Decision, EdgeRequest, LifecycleController, load_config_from_file};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config_from_file(Path::new("edge-auth.toml"))?;
//! let controller = LifecycleController::from_config(config)?;
//!
//! let request = EdgeRequest::new("/reports")
//!     .with_header("host", "d111.cloudfront.net")
//!     .with_header("cookie", "CognitoIdentityServiceProvider.abc123.LastAuthUser=alice");
//! let outcome = controller.check(&request).await?;
//!
//! if outcome.decision != Decision::Allow {
//!     for (name, value) in outcome.set_cookie_headers() {
//!         println!("{name}: {value}");
//!     }
//!     println!("location: {:?}", outcome.location);
//! }
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

mod cookie;
mod error;
mod jwks;
mod jwt;
mod lifecycle;
mod pkce;
pub mod session;

#[cfg(test)]
mod test_support;

pub use cookie::{
    CookieAttributes, CookieEntry, HeaderValues, SameSite, parse_cookie_headers,
    set_cookie_headers,
};
pub use edge_auth_config::{CookieSettings, EdgeConfig, load_config_from_file};
pub use error::{Error, Result};
#[cfg(feature = "fetch-reqwest")]
pub use jwks::HttpJwksFetcher;
pub use jwks::{Jwk, JwksFetcher, JwksSet, KeyFamily, KeyResolver, SigningKey, StaticJwks};
pub use jwt::{
    Audience, JwtClaims, MAX_JWT_SIZE_BYTES, TokenVerifier, USERNAME_CLAIM, UnverifiedJwt,
    VerifyOptions,
};
pub use lifecycle::{Decision, EdgeRequest, LifecycleController, Outcome, Rejection, SessionState};
pub use pkce::{AuthState, LoginChallenge, code_challenge, logout_url};
pub use session::{SessionRecord, TokenResponse};
