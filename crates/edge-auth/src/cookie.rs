//! Cookie wire format: `Cookie` request headers in, `Set-Cookie` entries out.

use std::collections::BTreeMap;
use std::fmt;

pub use edge_auth_config::{CookieAttributes, SameSite};

use crate::{Error, Result};

/// Request headers as delivered by the HTTP boundary: lower-cased name to
/// every raw value received under that name.
pub type HeaderValues = BTreeMap<String, Vec<String>>;

/// One `Set-Cookie` entry.
#[derive(Clone, PartialEq, Eq)]
pub struct CookieEntry {
    /// Cookie name.
    pub name: String,
    /// Cookie value, already encoded for the wire.
    pub value: String,
    /// Attributes.
    pub attributes: CookieAttributes,
}

impl CookieEntry {
    /// Build an entry.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        attributes: CookieAttributes,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            attributes,
        }
    }

    /// The same cookie in its already-expired form: empty value, `Expires`
    /// at the Unix epoch, no `Max-Age`.
    ///
    /// Expiring an expired entry returns an identical entry.
    #[must_use]
    pub fn expired(&self) -> Self {
        Self {
            name: self.name.clone(),
            value: String::new(),
            attributes: self.attributes.clone().expired(),
        }
    }

    /// True if the browser will discard this cookie.
    pub fn is_expired(&self) -> bool {
        self.attributes.is_expired()
    }

    /// Parse a `Set-Cookie` header value.
    ///
    /// # Errors
    ///
    /// `Error::Parse` if there is no `name=value` pair or an attribute is not understood.
    pub fn parse(set_cookie: &str) -> Result<Self> {
        let (pair, attrs) = match set_cookie.split_once(';') {
            Some((pair, attrs)) => (pair, attrs),
            None => (set_cookie, ""),
        };
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Parse(format!("not a cookie: {set_cookie:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Parse(format!("cookie without a name: {set_cookie:?}")));
        }
        let attributes = attrs
            .parse::<CookieAttributes>()
            .map_err(|e| Error::Parse(e.to_string()))?;
        Ok(Self::new(name, value.trim(), attributes))
    }
}

impl fmt::Debug for CookieEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieEntry")
            .field("name", &self.name)
            .field("value_len", &self.value.len())
            .field("attributes", &self.attributes)
            .finish()
    }
}

impl fmt::Display for CookieEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        let attrs = self.attributes.to_string();
        if !attrs.is_empty() {
            write!(f, "; {attrs}")?;
        }
        Ok(())
    }
}

/// Render entries as `("set-cookie", value)` header pairs, in order.
pub fn set_cookie_headers(entries: &[CookieEntry]) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|c| ("set-cookie".to_string(), c.to_string()))
        .collect()
}

/// Collect every cookie from every `cookie` header.
///
/// Headers are applied in order and a later cookie with the same name
/// replaces an earlier one. Values are percent-decoded and stripped of
/// surrounding double quotes.
pub fn parse_cookie_headers(headers: &HeaderValues) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();

    let Some(values) = headers.get("cookie") else {
        return cookies;
    };

    for header in values {
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            let value = urlencoding::decode(value)
                .map_or_else(|_| value.to_string(), std::borrow::Cow::into_owned);
            cookies.insert(name.to_string(), value);
        }
    }

    cookies
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(values: &[&str]) -> HeaderValues {
        BTreeMap::from([(
            "cookie".to_string(),
            values.iter().map(ToString::to_string).collect(),
        )])
    }

    #[test]
    fn merges_repeated_headers_last_write_wins() {
        let cookies = parse_cookie_headers(&headers(&[
            "a=1; b=2",
            "b=3; c=\"quoted\"",
            "a=4",
        ]));
        assert_eq!(cookies.get("a").map(String::as_str), Some("4"));
        assert_eq!(cookies.get("b").map(String::as_str), Some("3"));
        assert_eq!(cookies.get("c").map(String::as_str), Some("quoted"));
    }

    #[test]
    fn decodes_values_and_skips_junk() {
        let cookies = parse_cookie_headers(&headers(&[
            "data=%7B%22k%22%3A1%7D; junk; =x; bad=%E0%A4%A",
        ]));
        assert_eq!(cookies.get("data").map(String::as_str), Some("{\"k\":1}"));
        assert_eq!(cookies.get("bad").map(String::as_str), Some("%E0%A4%A"));
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn no_cookie_header() {
        assert!(parse_cookie_headers(&HeaderValues::new()).is_empty());
    }

    #[test]
    fn renders_set_cookie() {
        let entry = CookieEntry::new(
            "name",
            "value",
            "Path=/; Secure; HttpOnly; SameSite=Lax".parse().unwrap(),
        );
        assert_eq!(
            entry.to_string(),
            "name=value; Path=/; Secure; HttpOnly; SameSite=Lax"
        );
        assert_eq!(
            set_cookie_headers(&[entry]),
            vec![(
                "set-cookie".to_string(),
                "name=value; Path=/; Secure; HttpOnly; SameSite=Lax".to_string()
            )]
        );
    }

    #[test]
    fn expiring_is_idempotent() {
        let entry = CookieEntry::parse("t=abc; Domain=.example.com; Path=/; Max-Age=3600; Secure")
            .unwrap();
        let once = entry.expired();
        assert_eq!(once, once.expired());
        assert!(once.is_expired());
        assert!(!entry.is_expired());
        assert_eq!(
            once.to_string(),
            "t=; Domain=.example.com; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Secure"
        );

        // Re-expiring the wire form gives the same wire form.
        let reparsed = CookieEntry::parse(&once.to_string()).unwrap();
        assert_eq!(reparsed.expired().to_string(), once.to_string());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CookieEntry::parse("no-equals-sign").is_err());
        assert!(CookieEntry::parse("=value").is_err());
        assert!(CookieEntry::parse("a=b; Frobnicate").is_err());
    }
}
