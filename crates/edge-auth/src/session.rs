//! Session Codec: request cookies to [`SessionRecord`] and back.
//!
//! Cookie names follow the Amplify JS convention byte for byte:
//!
//! ```text
//! CognitoIdentityServiceProvider.<clientId>.LastAuthUser
//! CognitoIdentityServiceProvider.<clientId>.<username>.idToken
//! CognitoIdentityServiceProvider.<clientId>.<username>.accessToken
//! CognitoIdentityServiceProvider.<clientId>.<username>.refreshToken
//! CognitoIdentityServiceProvider.<clientId>.<username>.tokenScopesString
//! CognitoIdentityServiceProvider.<clientId>.<username>.userData
//! ```
//!
//! Every name is built through [`CookieNames`]; nothing else in the crate
//! formats them.

use std::fmt;

use edge_auth_config::{CookieAttributes, CookieSettings};
use serde::{Deserialize, Serialize};

use crate::cookie::{CookieEntry, HeaderValues, parse_cookie_headers};
use crate::jwt::{JwtClaims, UnverifiedJwt};
use crate::{Error, Result};

/// Namespace shared by every SDK cookie.
pub const COOKIE_PREFIX: &str = "CognitoIdentityServiceProvider";

/// Nonce of the pending sign-in.
pub const NONCE_COOKIE: &str = "spa-auth-edge-nonce";

/// PKCE verifier of the pending sign-in.
pub const PKCE_COOKIE: &str = "spa-auth-edge-pkce";

/// Marker telling the SDK the session came from the hosted UI.
pub const HOSTED_UI_COOKIE: &str = "amplify-signin-with-hostedUI";

/// Per-user cookie fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    /// `idToken`
    IdToken,
    /// `accessToken`
    AccessToken,
    /// `refreshToken`
    RefreshToken,
    /// `tokenScopesString`
    TokenScopesString,
    /// `userData`
    UserData,
}

impl UserField {
    /// Name suffix as written on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            UserField::IdToken => "idToken",
            UserField::AccessToken => "accessToken",
            UserField::RefreshToken => "refreshToken",
            UserField::TokenScopesString => "tokenScopesString",
            UserField::UserData => "userData",
        }
    }
}

/// Cookie names for one client id.
#[derive(Debug, Clone, Copy)]
pub struct CookieNames<'a> {
    client_id: &'a str,
}

impl<'a> CookieNames<'a> {
    /// Names scoped to `client_id`.
    pub fn new(client_id: &'a str) -> Self {
        Self { client_id }
    }

    /// `<prefix>.<clientId>.LastAuthUser`
    pub fn last_auth_user(&self) -> String {
        format!("{COOKIE_PREFIX}.{}.LastAuthUser", self.client_id)
    }

    /// `<prefix>.<clientId>.<username>.<field>`
    pub fn user(&self, username: &str, field: UserField) -> String {
        format!(
            "{COOKIE_PREFIX}.{}.{username}.{}",
            self.client_id,
            field.as_str()
        )
    }
}

/// Everything one browser session carries in cookies.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Active username (`LastAuthUser`).
    pub username: Option<String>,
    /// Id token.
    pub id_token: Option<String>,
    /// Access token.
    pub access_token: Option<String>,
    /// Refresh token.
    pub refresh_token: Option<String>,
    /// Granted scopes, in order.
    pub scopes: Vec<String>,
    /// Nonce of a pending sign-in.
    pub nonce: Option<String>,
    /// PKCE verifier of a pending sign-in.
    pub pkce_verifier: Option<String>,
}

impl SessionRecord {
    /// A session waiting for the identity provider's callback.
    pub fn pending(nonce: impl Into<String>, pkce_verifier: impl Into<String>) -> Self {
        Self {
            nonce: Some(nonce.into()),
            pkce_verifier: Some(pkce_verifier.into()),
            ..Self::default()
        }
    }

    /// A session built from freshly issued tokens.
    ///
    /// The username is read from the id token when possible; the codec
    /// derives it again when encoding.
    pub fn from_tokens(tokens: TokenResponse, scopes: &[String]) -> Self {
        let username = UnverifiedJwt::parse(&tokens.id_token)
            .ok()
            .and_then(|jwt| jwt.claims.username().map(str::to_string));
        Self {
            username,
            id_token: Some(tokens.id_token),
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token,
            scopes: scopes.to_vec(),
            nonce: None,
            pkce_verifier: None,
        }
    }

    /// True if no token is present.
    pub fn is_anonymous(&self) -> bool {
        self.id_token.is_none() && self.access_token.is_none() && self.refresh_token.is_none()
    }

    /// True if a sign-in is in flight (nonce and verifier both present).
    pub fn has_pending_auth(&self) -> bool {
        self.nonce.is_some() && self.pkce_verifier.is_some()
    }
}

fn redacted(value: Option<&String>) -> Option<&'static str> {
    value.map(|_| "[REDACTED]")
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("username", &self.username)
            .field("id_token", &redacted(self.id_token.as_ref()))
            .field("access_token", &redacted(self.access_token.as_ref()))
            .field("refresh_token", &redacted(self.refresh_token.as_ref()))
            .field("scopes", &self.scopes)
            .field("nonce", &self.nonce)
            .field("pkce_verifier", &redacted(self.pkce_verifier.as_ref()))
            .finish()
    }
}

/// Body of a token endpoint response.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    /// `id_token`
    pub id_token: String,
    /// `access_token`
    pub access_token: String,
    /// `refresh_token`; omitted on some refresh grants.
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("id_token", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &redacted(self.refresh_token.as_ref()))
            .finish()
    }
}

/// Read the session carried by the request's `cookie` headers.
///
/// Never fails: missing or empty cookies leave the field absent.
pub fn decode(headers: &HeaderValues, client_id: &str) -> SessionRecord {
    let mut cookies = parse_cookie_headers(headers);
    let mut take = |name: &str| cookies.remove(name).filter(|v| !v.is_empty());
    let names = CookieNames::new(client_id);

    let mut record = SessionRecord {
        nonce: take(NONCE_COOKIE),
        pkce_verifier: take(PKCE_COOKIE),
        ..SessionRecord::default()
    };

    let Some(username) = take(&names.last_auth_user()) else {
        return record;
    };

    record.id_token = take(&names.user(&username, UserField::IdToken));
    record.access_token = take(&names.user(&username, UserField::AccessToken));
    record.refresh_token = take(&names.user(&username, UserField::RefreshToken));
    record.scopes = take(&names.user(&username, UserField::TokenScopesString))
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    record.username = Some(username);

    tracing::debug!(
        target: "edge_auth.session",
        has_id_token = record.id_token.is_some(),
        has_refresh_token = record.refresh_token.is_some(),
        pending_auth = record.has_pending_auth(),
        "Session decoded"
    );
    record
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UserData<'a> {
    user_attributes: [UserAttribute<'a>; 2],
    username: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct UserAttribute<'a> {
    name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
}

fn user_data(claims: &JwtClaims, username: &str) -> Result<String> {
    let data = UserData {
        user_attributes: [
            UserAttribute {
                name: "sub",
                value: Some(&claims.subject),
            },
            UserAttribute {
                name: "email",
                value: claims.email(),
            },
        ],
        username,
    };
    serde_json::to_string(&data).map_err(|e| Error::Session(e.to_string()))
}

fn scoped(attributes: &CookieAttributes, domain: &str) -> CookieAttributes {
    if domain.is_empty() {
        attributes.clone()
    } else {
        attributes.clone().with_default_domain(domain)
    }
}

fn wire(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Turn `record` into `Set-Cookie` entries, in a fixed order: id token,
/// access token, refresh token, `LastAuthUser`, scopes, user data, the
/// hosted-UI marker, then nonce and PKCE verifier.
///
/// The username in cookie names comes from the id token's
/// `cognito:username` claim. With `expire_all` every entry is expired,
/// falling back to `record.username` when there is no readable id token.
/// Otherwise an absent refresh token (or nonce/verifier) expires only that
/// cookie.
///
/// # Errors
///
/// `Error::Session` if an id token is present without an access token (or
/// the reverse), or the id token has no readable username.
pub fn encode(
    record: &SessionRecord,
    client_id: &str,
    domain: &str,
    policy: &CookieSettings,
    expire_all: bool,
) -> Result<Vec<CookieEntry>> {
    let names = CookieNames::new(client_id);

    let claims = match record.id_token.as_deref().map(UnverifiedJwt::parse) {
        Some(Ok(jwt)) => Some(jwt.claims),
        Some(Err(e)) if !expire_all => {
            return Err(Error::Session(format!("id token is unreadable: {e}")));
        }
        _ => None,
    };

    let username = if expire_all {
        claims
            .as_ref()
            .and_then(JwtClaims::username)
            .or(record.username.as_deref())
    } else {
        match (&claims, &record.access_token) {
            (None, None) => None,
            (Some(claims), Some(_)) => Some(claims.username().ok_or_else(|| {
                Error::Session("id token has no cognito:username claim".to_string())
            })?),
            _ => {
                return Err(Error::Session(
                    "id and access tokens must be encoded together".to_string(),
                ));
            }
        }
    };

    let id_class = scoped(&policy.id_token, domain);
    let access_class = scoped(&policy.access_token, domain);
    let refresh_class = scoped(&policy.refresh_token, domain).hardened();
    let nonce_class = scoped(&policy.nonce, domain).hardened();

    let mut entries = Vec::with_capacity(9);

    if let Some(username) = username {
        let token = |field, value: Option<&String>, attributes: CookieAttributes| {
            let entry = CookieEntry::new(
                names.user(username, field),
                value.map(|v| wire(v)).unwrap_or_default(),
                attributes,
            );
            if value.is_some() { entry } else { entry.expired() }
        };
        entries.push(token(
            UserField::IdToken,
            record.id_token.as_ref(),
            id_class.clone().hardened(),
        ));
        entries.push(token(
            UserField::AccessToken,
            record.access_token.as_ref(),
            access_class.clone().hardened(),
        ));
        entries.push(token(
            UserField::RefreshToken,
            record.refresh_token.as_ref(),
            refresh_class,
        ));
    }

    if username.is_some() || expire_all {
        entries.push(CookieEntry::new(
            names.last_auth_user(),
            wire(username.unwrap_or_default()),
            id_class.clone(),
        ));
    }

    if let Some(username) = username {
        entries.push(CookieEntry::new(
            names.user(username, UserField::TokenScopesString),
            wire(&record.scopes.join(" ")),
            access_class.clone(),
        ));
        let data = match &claims {
            Some(claims) => wire(&user_data(claims, username)?),
            None => String::new(),
        };
        entries.push(CookieEntry::new(
            names.user(username, UserField::UserData),
            data,
            id_class,
        ));
    }

    if username.is_some() || expire_all {
        entries.push(CookieEntry::new(HOSTED_UI_COOKIE, "true", access_class));
    }

    for (name, value) in [
        (NONCE_COOKIE, record.nonce.as_deref()),
        (PKCE_COOKIE, record.pkce_verifier.as_deref()),
    ] {
        let entry = CookieEntry::new(
            name,
            value.map(wire).unwrap_or_default(),
            nonce_class.clone(),
        );
        entries.push(if value.is_some() { entry } else { entry.expired() });
    }

    if expire_all {
        entries = entries.iter().map(CookieEntry::expired).collect();
    }

    tracing::debug!(
        target: "edge_auth.session",
        cookies = entries.len(),
        expire_all,
        "Session encoded"
    );
    Ok(entries)
}
