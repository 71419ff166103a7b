//! `Set-Cookie` attribute policy.
//!
//! Attribute sets are written in configuration the same way they appear on
//! the wire (`"Path=/; Secure; HttpOnly; SameSite=Lax"`), so
//! [`CookieAttributes`] parses and renders that form.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use httpdate::{fmt_http_date, parse_http_date};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// SameSite attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// SameSite=Strict
    Strict,
    /// SameSite=Lax
    Lax,
    /// SameSite=None
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl FromStr for SameSite {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            other => Err(ConfigError::Validation(format!(
                "unknown SameSite value: {other}"
            ))),
        }
    }
}

/// Attributes attached to one cookie: everything after `name=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CookieAttributes {
    /// Cookie domain. `None` means the caller decides (host-wide by default).
    pub domain: Option<String>,

    /// Cookie path.
    pub path: Option<String>,

    /// Absolute expiry.
    pub expires: Option<SystemTime>,

    /// Max-Age in seconds.
    pub max_age: Option<u64>,

    /// Send on HTTPS only.
    pub secure: bool,

    /// Not accessible to JS.
    pub http_only: bool,

    /// SameSite attribute.
    pub same_site: Option<SameSite>,
}

impl CookieAttributes {
    /// Scope the cookie to `.{host}` unless the policy already names a domain.
    #[must_use]
    pub fn with_default_domain(mut self, host: &str) -> Self {
        if self.domain.is_none() {
            self.domain = Some(format!(".{}", host.trim_start_matches('.')));
        }
        self
    }

    /// Force `Secure` and `HttpOnly`.
    #[must_use]
    pub fn hardened(mut self) -> Self {
        self.secure = true;
        self.http_only = true;
        self
    }

    /// Drop any lifetime directive and pin `Expires` to the Unix epoch.
    ///
    /// Applying this twice yields the same attributes.
    #[must_use]
    pub fn expired(mut self) -> Self {
        self.max_age = None;
        self.expires = Some(UNIX_EPOCH);
        self
    }

    /// True if the attributes describe a cookie the browser will discard.
    pub fn is_expired(&self) -> bool {
        self.max_age == Some(0) || self.expires.is_some_and(|t| t <= SystemTime::now())
    }
}

impl fmt::Display for CookieAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();

        if let Some(domain) = &self.domain {
            parts.push(format!("Domain={domain}"));
        }
        if let Some(path) = &self.path {
            parts.push(format!("Path={path}"));
        }
        if let Some(expires) = self.expires {
            parts.push(format!("Expires={}", fmt_http_date(expires)));
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("Max-Age={max_age}"));
        }
        if self.secure {
            parts.push("Secure".to_string());
        }
        if self.http_only {
            parts.push("HttpOnly".to_string());
        }
        if let Some(same_site) = self.same_site {
            parts.push(format!("SameSite={}", same_site.as_str()));
        }

        f.write_str(&parts.join("; "))
    }
}

impl FromStr for CookieAttributes {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let mut attrs = CookieAttributes::default();

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = match part.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim())),
                None => (part, None),
            };

            match (name.to_ascii_lowercase().as_str(), value) {
                ("domain", Some(v)) => attrs.domain = Some(v.to_string()),
                ("path", Some(v)) => attrs.path = Some(v.to_string()),
                ("expires", Some(v)) => {
                    let at = parse_http_date(v).map_err(|e| {
                        ConfigError::Validation(format!("invalid Expires value {v:?}: {e}"))
                    })?;
                    attrs.expires = Some(at);
                }
                ("max-age", Some(v)) => {
                    let secs = v.parse::<u64>().map_err(|e| {
                        ConfigError::Validation(format!("invalid Max-Age value {v:?}: {e}"))
                    })?;
                    attrs.max_age = Some(secs);
                }
                ("secure", None) => attrs.secure = true,
                ("httponly", None) => attrs.http_only = true,
                ("samesite", Some(v)) => attrs.same_site = Some(v.parse()?),
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "unsupported cookie attribute: {part}"
                    )));
                }
            }
        }

        Ok(attrs)
    }
}

impl TryFrom<String> for CookieAttributes {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CookieAttributes> for String {
    fn from(value: CookieAttributes) -> Self {
        value.to_string()
    }
}
