//! Signing-key resolution against a published JWKS.
//!
//! [`KeyResolver`] keeps a process-lifetime cache of verification keys keyed
//! by `kid`. Keys are immutable once fetched: the issuer rotates by
//! publishing new key ids, so entries never expire. Only keys found in the
//! issuer's set are cached. Unknown ids never take memory, and the issuer is
//! contacted at most once per cooldown window however many distinct ids miss.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use edge_auth_config::DEFAULT_KEY_FETCH_COOLDOWN_SECONDS;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A JWKS (JSON Web Key Set).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwksSet {
    /// Keys.
    pub keys: Vec<Jwk>,
}

/// Minimal JWK structure for RSA/EC.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Jwk {
    /// Key type ("RSA", "EC").
    pub kty: String,

    /// Key id.
    pub kid: Option<String>,

    /// Public key use.
    #[serde(rename = "use")]
    pub use_: Option<String>,

    /// Algorithm (optional).
    pub alg: Option<String>,

    // RSA
    /// RSA modulus.
    pub n: Option<String>,
    /// RSA exponent.
    pub e: Option<String>,

    // EC
    /// Curve name.
    pub crv: Option<String>,
    /// EC x coordinate.
    pub x: Option<String>,
    /// EC y coordinate.
    pub y: Option<String>,
}

/// Public-key family of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// RSA (RS*/PS* algorithms).
    Rsa,
    /// Elliptic curve (ES* algorithms).
    Ec,
}

/// A verification key resolved from the issuer's key set.
///
/// The verification algorithm is fixed by the key itself; a token header
/// can never choose it.
#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    family: KeyFamily,
    algorithm: Algorithm,
    decoding_key: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Build a key from a JWK entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Fetch` if the entry is not a usable RSA/EC signing key.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self> {
        let key_id = jwk
            .kid
            .clone()
            .ok_or_else(|| Error::Fetch("JWK missing kid".to_string()))?;

        if let Some(use_) = jwk.use_.as_deref() {
            if use_ != "sig" {
                return Err(Error::Fetch(format!("JWK {key_id} is not a signing key ({use_})")));
            }
        }

        let (family, algorithm, decoding_key) = match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk
                    .n
                    .as_deref()
                    .ok_or_else(|| Error::Fetch("RSA JWK missing n".to_string()))?;
                let e = jwk
                    .e
                    .as_deref()
                    .ok_or_else(|| Error::Fetch("RSA JWK missing e".to_string()))?;
                let key = DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| Error::Fetch(format!("invalid RSA JWK: {e}")))?;
                (KeyFamily::Rsa, rsa_algorithm(jwk.alg.as_deref())?, key)
            }
            "EC" => {
                let x = jwk
                    .x
                    .as_deref()
                    .ok_or_else(|| Error::Fetch("EC JWK missing x".to_string()))?;
                let y = jwk
                    .y
                    .as_deref()
                    .ok_or_else(|| Error::Fetch("EC JWK missing y".to_string()))?;
                let algorithm = ec_algorithm(jwk.crv.as_deref(), jwk.alg.as_deref())?;
                let key = DecodingKey::from_ec_components(x, y)
                    .map_err(|e| Error::Fetch(format!("invalid EC JWK: {e}")))?;
                (KeyFamily::Ec, algorithm, key)
            }
            other => return Err(Error::Fetch(format!("unsupported kty: {other}"))),
        };

        Ok(Self {
            key_id,
            family,
            algorithm,
            decoding_key,
        })
    }

    /// Key id.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Key family.
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// The only algorithm this key verifies.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

fn rsa_algorithm(alg: Option<&str>) -> Result<Algorithm> {
    let Some(alg) = alg else {
        return Ok(Algorithm::RS256);
    };
    match alg.parse::<Algorithm>() {
        Ok(
            a @ (Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512),
        ) => Ok(a),
        _ => Err(Error::Fetch(format!("RSA JWK declares unsupported alg {alg}"))),
    }
}

fn ec_algorithm(crv: Option<&str>, alg: Option<&str>) -> Result<Algorithm> {
    let by_curve = match crv {
        Some("P-256") => Algorithm::ES256,
        Some("P-384") => Algorithm::ES384,
        other => return Err(Error::Fetch(format!("unsupported EC curve: {other:?}"))),
    };
    match alg {
        Some(declared) if declared.parse::<Algorithm>().ok() != Some(by_curve) => {
            Err(Error::Fetch(format!(
                "EC JWK alg {declared} does not match its curve"
            )))
        }
        _ => Ok(by_curve),
    }
}

// Only the matching entry is kept; the rest of the set is dropped.
fn select_key(set: &JwksSet, kid: &str) -> Result<SigningKey> {
    let jwk = set
        .keys
        .iter()
        .find(|k| k.kid.as_deref() == Some(kid))
        .ok_or_else(|| {
            tracing::warn!(target: "edge_auth.jwks", kid = %kid, "Key not present in JWKS");
            Error::KeyNotFound(kid.to_string())
        })?;

    SigningKey::from_jwk(jwk).map_err(|e| {
        tracing::warn!(target: "edge_auth.jwks", kid = %kid, error = %e, "Unusable key in JWKS");
        Error::KeyNotFound(kid.to_string())
    })
}

/// Source of the issuer's key set.
pub trait JwksFetcher: Send + Sync {
    /// Retrieve the full key set.
    fn fetch(&self) -> impl Future<Output = Result<JwksSet>> + Send;
}

/// A fixed key set, e.g. one provisioned alongside the deployment.
#[derive(Debug, Clone)]
pub struct StaticJwks(JwksSet);

impl StaticJwks {
    /// Wrap a parsed key set.
    pub fn new(set: JwksSet) -> Self {
        Self(set)
    }

    /// Parse a JWKS document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map(Self)
            .map_err(|e| Error::Fetch(format!("invalid JWKS document: {e}")))
    }
}

impl JwksFetcher for StaticJwks {
    async fn fetch(&self) -> Result<JwksSet> {
        Ok(self.0.clone())
    }
}

/// Fetches the key set over HTTPS.
#[cfg(feature = "fetch-reqwest")]
#[derive(Debug, Clone)]
pub struct HttpJwksFetcher {
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "fetch-reqwest")]
impl HttpJwksFetcher {
    /// Create a fetcher for `url` with a 10 second request timeout.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    /// The JWKS URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(feature = "fetch-reqwest")]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwksSet> {
        tracing::debug!(target: "edge_auth.jwks", url = %self.url, "Fetching JWKS");

        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Fetch(format!(
                "{} returned {}",
                self.url,
                resp.status()
            )));
        }

        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| Error::Fetch(format!("invalid JWKS document: {e}")))
    }
}

/// The last key-set retrieval, reused for every unknown `kid` until the
/// cooldown passes.
#[derive(Debug, Clone)]
struct Retrieval {
    at: Instant,
    set: std::result::Result<Arc<JwksSet>, String>,
}

/// Resolves signing keys by `kid`, caching each key for the life of the process.
///
/// Safe to share between concurrent requests. Two requests racing on the
/// same missing key may both fetch; the first insert wins and both observe
/// the same cached key.
pub struct KeyResolver<F> {
    fetcher: F,
    keys: DashMap<String, Arc<SigningKey>>,
    last_retrieval: Mutex<Option<Retrieval>>,
    cooldown: Duration,
}

impl<F: JwksFetcher> KeyResolver<F> {
    /// Create a resolver with the default fetch cooldown.
    pub fn new(fetcher: F) -> Self {
        Self::with_cooldown(
            fetcher,
            Duration::from_secs(DEFAULT_KEY_FETCH_COOLDOWN_SECONDS),
        )
    }

    /// Create a resolver that contacts the issuer at most once per `cooldown`
    /// for keys it has not cached.
    pub fn with_cooldown(fetcher: F, cooldown: Duration) -> Self {
        Self {
            fetcher,
            keys: DashMap::new(),
            last_retrieval: Mutex::new(None),
            cooldown,
        }
    }

    /// Look up the key for `kid`, fetching the key set on a cache miss.
    ///
    /// # Errors
    ///
    /// - `Error::KeyNotFound` if the key set has no usable key with this id
    /// - `Error::Fetch` if the key set could not be retrieved
    ///
    /// Within the cooldown window after a retrieval, lookups for uncached
    /// keys are answered from that retrieval, including its failure,
    /// without contacting the issuer.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<SigningKey>> {
        if let Some(key) = self.keys.get(kid) {
            tracing::debug!(target: "edge_auth.jwks", kid = %kid, "JWKS cache hit");
            return Ok(Arc::clone(key.value()));
        }

        tracing::debug!(target: "edge_auth.jwks", kid = %kid, "JWKS cache miss");
        let set = self.key_set(kid).await?;
        let key = select_key(&set, kid)?;

        let entry = self
            .keys
            .entry(kid.to_string())
            .or_insert_with(|| Arc::new(key));
        tracing::info!(
            target: "edge_auth.jwks",
            kid = %kid,
            alg = ?entry.value().algorithm(),
            "Signing key cached"
        );
        Ok(Arc::clone(entry.value()))
    }

    async fn key_set(&self, kid: &str) -> Result<Arc<JwksSet>> {
        if let Some(recent) = self.recent_retrieval() {
            tracing::debug!(
                target: "edge_auth.jwks",
                kid = %kid,
                "Key set retrieved recently, not refetching during cooldown"
            );
            return recent.set.map_err(Error::Fetch);
        }

        let set = self
            .fetcher
            .fetch()
            .await
            .map(Arc::new)
            .map_err(|e| match e {
                Error::Fetch(msg) => msg,
                other => other.to_string(),
            });
        if let Err(msg) = &set {
            tracing::warn!(
                target: "edge_auth.jwks",
                kid = %kid,
                error = %msg,
                "Failed to fetch JWKS"
            );
        }

        *self.lock_retrieval() = Some(Retrieval {
            at: Instant::now(),
            set: set.clone(),
        });
        set.map_err(Error::Fetch)
    }

    fn recent_retrieval(&self) -> Option<Retrieval> {
        self.lock_retrieval()
            .as_ref()
            .filter(|r| r.at.elapsed() < self.cooldown)
            .cloned()
    }

    fn lock_retrieval(&self) -> MutexGuard<'_, Option<Retrieval>> {
        self.last_retrieval
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids of the keys currently cached, sorted.
    pub fn cached_key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// The underlying fetcher.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_support::{CountingFetcher, EC_KID, RSA_KID, jwks};

    #[tokio::test]
    async fn caches_only_the_requested_key() {
        let resolver = KeyResolver::new(CountingFetcher::serving(jwks()));

        let key = resolver.get_key(EC_KID).await.unwrap();
        assert_eq!(key.key_id(), EC_KID);
        assert_eq!(key.family(), KeyFamily::Ec);
        assert_eq!(key.algorithm(), Algorithm::ES256);
        assert_eq!(resolver.cached_key_ids(), vec![EC_KID.to_string()]);

        resolver.get_key(EC_KID).await.unwrap();
        assert_eq!(resolver.fetcher().calls(), 1);

        // Served from the retrieval that found the EC key.
        let rsa = resolver.get_key(RSA_KID).await.unwrap();
        assert_eq!(rsa.algorithm(), Algorithm::RS256);
        assert_eq!(resolver.fetcher().calls(), 1);
        assert_eq!(
            resolver.cached_key_ids(),
            vec![EC_KID.to_string(), RSA_KID.to_string()]
        );
    }

    #[tokio::test]
    async fn missing_key_fetched_once_per_cooldown() {
        let resolver = KeyResolver::with_cooldown(
            CountingFetcher::serving(jwks()),
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            let err = resolver.get_key("rotated-away").await.unwrap_err();
            assert!(matches!(err, Error::KeyNotFound(ref kid) if kid == "rotated-away"));
        }
        assert_eq!(resolver.fetcher().calls(), 1);
        assert!(resolver.cached_key_ids().is_empty());
    }

    #[tokio::test]
    async fn forged_key_ids_share_one_fetch_per_cooldown() {
        let resolver = KeyResolver::with_cooldown(
            CountingFetcher::serving(jwks()),
            Duration::from_secs(60),
        );

        for i in 0..1000 {
            let kid = format!("forged-{i}");
            assert!(matches!(
                resolver.get_key(&kid).await,
                Err(Error::KeyNotFound(ref k)) if *k == kid
            ));
        }
        assert_eq!(resolver.fetcher().calls(), 1);
        assert!(resolver.cached_key_ids().is_empty());

        // A published key is still found within the window.
        resolver.get_key(EC_KID).await.unwrap();
        assert_eq!(resolver.fetcher().calls(), 1);
        assert_eq!(resolver.cached_key_ids(), vec![EC_KID.to_string()]);
    }

    #[tokio::test]
    async fn forged_key_ids_refetch_once_cooldown_passes() {
        let resolver = KeyResolver::with_cooldown(
            CountingFetcher::serving(jwks()),
            Duration::from_millis(20),
        );

        for i in 0..50 {
            assert!(resolver.get_key(&format!("forged-{i}")).await.is_err());
        }
        assert_eq!(resolver.fetcher().calls(), 1);

        std::thread::sleep(Duration::from_millis(40));
        for i in 50..100 {
            assert!(resolver.get_key(&format!("forged-{i}")).await.is_err());
        }
        assert_eq!(resolver.fetcher().calls(), 2);
    }

    #[tokio::test]
    async fn refetches_after_cooldown() {
        let resolver =
            KeyResolver::with_cooldown(CountingFetcher::serving(jwks()), Duration::ZERO);
        assert!(resolver.get_key("missing").await.is_err());
        assert!(resolver.get_key("missing").await.is_err());
        assert_eq!(resolver.fetcher().calls(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_is_remembered() {
        let resolver =
            KeyResolver::with_cooldown(CountingFetcher::failing(), Duration::from_secs(60));

        assert!(matches!(resolver.get_key(EC_KID).await, Err(Error::Fetch(_))));
        assert!(matches!(resolver.get_key(EC_KID).await, Err(Error::Fetch(_))));
        assert!(matches!(resolver.get_key(RSA_KID).await, Err(Error::Fetch(_))));
        assert_eq!(resolver.fetcher().calls(), 1);
        assert!(resolver.cached_key_ids().is_empty());
    }

    #[tokio::test]
    async fn unusable_key_is_not_found() {
        let resolver = KeyResolver::new(CountingFetcher::serving(jwks()));
        assert!(matches!(
            resolver.get_key("hmac-key").await,
            Err(Error::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_entry() {
        let resolver = Arc::new(KeyResolver::new(CountingFetcher::serving(jwks())));

        let (a, b) = tokio::join!(resolver.get_key(EC_KID), resolver.get_key(EC_KID));
        let (a, b) = (a.unwrap(), b.unwrap());
        let cached = resolver.get_key(EC_KID).await.unwrap();

        assert_eq!(resolver.cached_key_ids(), vec![EC_KID.to_string()]);
        assert!(Arc::ptr_eq(&cached, &a) || Arc::ptr_eq(&cached, &b));
        assert!(resolver.fetcher().calls() <= 2);
    }

    #[test]
    fn ec_alg_must_match_curve() {
        assert_eq!(ec_algorithm(Some("P-256"), None).unwrap(), Algorithm::ES256);
        assert_eq!(
            ec_algorithm(Some("P-384"), Some("ES384")).unwrap(),
            Algorithm::ES384
        );
        assert!(ec_algorithm(Some("P-256"), Some("ES384")).is_err());
        assert!(ec_algorithm(Some("P-521"), None).is_err());
    }

    #[test]
    fn rsa_alg_is_restricted_to_rsa_family() {
        assert_eq!(rsa_algorithm(None).unwrap(), Algorithm::RS256);
        assert_eq!(rsa_algorithm(Some("PS384")).unwrap(), Algorithm::PS384);
        assert!(rsa_algorithm(Some("HS256")).is_err());
        assert!(rsa_algorithm(Some("ES256")).is_err());
    }

    #[test]
    fn encryption_keys_are_rejected() {
        let mut jwk = jwks()
            .keys
            .into_iter()
            .find(|k| k.kid.as_deref() == Some(RSA_KID))
            .unwrap();
        jwk.use_ = Some("enc".to_string());
        assert!(SigningKey::from_jwk(&jwk).is_err());
    }

    #[test]
    fn static_jwks_from_json() {
        let json = serde_json::to_string(&jwks()).unwrap();
        assert!(StaticJwks::from_json(&json).is_ok());
        assert!(matches!(StaticJwks::from_json("[]"), Err(Error::Fetch(_))));
    }

    #[cfg(feature = "fetch-reqwest")]
    mod http {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn fetches_key_set_over_http() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/.well-known/jwks.json"))
                .respond_with(ResponseTemplate::new(200).set_body_json(jwks()))
                .expect(1)
                .mount(&server)
                .await;

            let fetcher =
                HttpJwksFetcher::new(format!("{}/.well-known/jwks.json", server.uri())).unwrap();
            let resolver = KeyResolver::new(fetcher);

            resolver.get_key(EC_KID).await.unwrap();
            resolver.get_key(EC_KID).await.unwrap();
        }

        #[tokio::test]
        async fn server_error_is_fetch_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;

            let fetcher = HttpJwksFetcher::new(server.uri()).unwrap();
            assert!(matches!(fetcher.fetch().await, Err(Error::Fetch(_))));
        }

        #[tokio::test]
        async fn garbage_body_is_fetch_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
                .mount(&server)
                .await;

            let fetcher = HttpJwksFetcher::new(server.uri()).unwrap();
            assert!(matches!(fetcher.fetch().await, Err(Error::Fetch(_))));
        }
    }
}
