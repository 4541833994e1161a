//! JWKS (JSON Web Key Set) documents, fetching and caching.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum spacing between refreshes triggered by unknown key ids.
pub const DEFAULT_MIN_REFRESH_GAP: Duration = Duration::from_secs(10);

/// JWKS document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

/// Individual JSON Web Key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC)
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// RSA modulus (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC x coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    /// Public RSA signing key.
    pub fn rsa(kid: &str, n: String, e: String) -> Self {
        Self {
            kty: "RSA".to_string(),
            kid: Some(kid.to_string()),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            n: Some(n),
            e: Some(e),
            crv: None,
            x: None,
            y: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum JwksError {
    #[error("key '{0}' not found in JWKS")]
    KeyNotFound(String),
    #[error("failed to fetch JWKS: {0:#}")]
    Fetch(anyhow::Error),
    #[error("JWKS cache lock poisoned")]
    Poisoned,
}

/// Key family, used to reject algorithm confusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    pub fn accepts(&self, alg: Algorithm) -> bool {
        match self {
            KeyFamily::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyFamily::Ec => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
        }
    }
}

/// A verification key ready for `jsonwebtoken`.
#[derive(Clone)]
pub struct CachedKey {
    pub key: DecodingKey,
    pub family: KeyFamily,
    pub alg: Option<String>,
}

impl CachedKey {
    /// Whether a token header algorithm may be used with this key.
    pub fn permits(&self, alg: Algorithm) -> bool {
        if !self.family.accepts(alg) {
            return false;
        }
        match &self.alg {
            Some(declared) => declared == &format!("{:?}", alg),
            None => true,
        }
    }
}

enum Source {
    Remote {
        url: String,
        http_client: reqwest::Client,
    },
    Static,
}

/// JWKS cache with refresh on interval and on unknown key id.
pub struct JwksCache {
    keys: RwLock<HashMap<String, CachedKey>>,
    last_refresh: RwLock<Option<Instant>>,
    /// Failure of the latest fetch, cleared by the next successful one.
    last_error: RwLock<Option<String>>,
    refresh_interval: Duration,
    min_refresh_gap: Duration,
    source: Source,
}

impl JwksCache {
    /// Create a cache and perform the initial fetch.
    pub async fn new(jwks_url: String, refresh_secs: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let cache = Self::remote(http_client, jwks_url, Duration::from_secs(refresh_secs));
        cache.refresh().await.map_err(|e| anyhow!("{}", e))?;
        Ok(cache)
    }

    /// Create a cache that fetches on first use.
    pub fn remote(
        http_client: reqwest::Client,
        jwks_url: String,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            last_error: RwLock::new(None),
            refresh_interval,
            min_refresh_gap: DEFAULT_MIN_REFRESH_GAP,
            source: Source::Remote {
                url: jwks_url,
                http_client,
            },
        }
    }

    /// Create a cache over a fixed key set that never refreshes.
    pub fn from_jwks(jwks: &Jwks) -> Result<Self> {
        let keys = Self::load_keys(jwks);
        if keys.is_empty() {
            return Err(anyhow!("No valid signing keys found in JWKS"));
        }
        Ok(Self {
            keys: RwLock::new(keys),
            last_refresh: RwLock::new(Some(Instant::now())),
            last_error: RwLock::new(None),
            refresh_interval: Duration::MAX,
            min_refresh_gap: Duration::MAX,
            source: Source::Static,
        })
    }

    pub fn with_min_refresh_gap(mut self, gap: Duration) -> Self {
        self.min_refresh_gap = gap;
        self
    }

    /// Get a key by id, refreshing once if it is unknown.
    ///
    /// A miss while the latest fetch failed reports that failure rather than
    /// [`JwksError::KeyNotFound`].
    pub async fn get_key(&self, kid: &str) -> Result<CachedKey, JwksError> {
        if let Err(e) = self.refresh_if_needed().await {
            if self.keys.read().map_err(|_| JwksError::Poisoned)?.is_empty() {
                return Err(e);
            }
            warn!(error = %e, "Periodic JWKS refresh failed, using cached keys");
        }

        if let Some(key) = self.cached(kid)? {
            return Ok(key);
        }

        if self.may_refresh_on_miss()? {
            debug!(kid = %kid, "Key not found in cache, refreshing JWKS");
            self.refresh().await?;
            if let Some(key) = self.cached(kid)? {
                return Ok(key);
            }
        }

        if let Some(reason) = self.last_error()? {
            return Err(JwksError::Fetch(anyhow!(reason)));
        }
        Err(JwksError::KeyNotFound(kid.to_string()))
    }

    /// The only key in the set, for tokens that carry no `kid`.
    pub async fn get_default_key(&self) -> Result<CachedKey, JwksError> {
        self.refresh_if_needed().await?;

        let keys = self.keys.read().map_err(|_| JwksError::Poisoned)?;
        if keys.len() == 1 {
            if let Some(key) = keys.values().next() {
                return Ok(key.clone());
            }
        }
        Err(JwksError::KeyNotFound("<none>".to_string()))
    }

    /// Refresh the cache if the refresh interval has elapsed.
    pub async fn refresh_if_needed(&self) -> Result<(), JwksError> {
        let should_refresh = {
            let last = self.last_refresh.read().map_err(|_| JwksError::Poisoned)?;
            match *last {
                Some(at) => at.elapsed() >= self.refresh_interval,
                None => true,
            }
        };

        if should_refresh {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Force refresh the JWKS cache. A no-op for static sets.
    pub async fn refresh(&self) -> Result<(), JwksError> {
        let Source::Remote { url, http_client } = &self.source else {
            return Ok(());
        };

        // Stamped before the fetch, so failed attempts also count toward the gap.
        *self.last_refresh.write().map_err(|_| JwksError::Poisoned)? = Some(Instant::now());

        let fetched = Self::fetch(http_client, url).await.and_then(|jwks| {
            let keys = Self::load_keys(&jwks);
            if keys.is_empty() {
                Err(anyhow!("No valid signing keys found in JWKS"))
            } else {
                Ok(keys)
            }
        });
        let new_keys = match fetched {
            Ok(keys) => keys,
            Err(e) => {
                *self.last_error.write().map_err(|_| JwksError::Poisoned)? =
                    Some(format!("{:#}", e));
                return Err(JwksError::Fetch(e));
            }
        };

        let key_count = new_keys.len();
        *self.keys.write().map_err(|_| JwksError::Poisoned)? = new_keys;
        *self.last_error.write().map_err(|_| JwksError::Poisoned)? = None;

        info!(url = %url, key_count, "JWKS cache refreshed");
        Ok(())
    }

    async fn fetch(http_client: &reqwest::Client, url: &str) -> Result<Jwks> {
        debug!(url = %url, "Fetching JWKS");

        let response = http_client
            .get(url)
            .send()
            .await
            .context("Failed to fetch JWKS")?;

        if !response.status().is_success() {
            return Err(anyhow!("JWKS endpoint returned status {}", response.status()));
        }

        response.json().await.context("Failed to parse JWKS")
    }

    fn last_error(&self) -> Result<Option<String>, JwksError> {
        Ok(self.last_error.read().map_err(|_| JwksError::Poisoned)?.clone())
    }

    fn cached(&self, kid: &str) -> Result<Option<CachedKey>, JwksError> {
        let keys = self.keys.read().map_err(|_| JwksError::Poisoned)?;
        Ok(keys.get(kid).cloned())
    }

    fn may_refresh_on_miss(&self) -> Result<bool, JwksError> {
        if matches!(self.source, Source::Static) {
            return Ok(false);
        }
        let last = self.last_refresh.read().map_err(|_| JwksError::Poisoned)?;
        Ok(last.map_or(true, |at| at.elapsed() >= self.min_refresh_gap))
    }

    fn load_keys(jwks: &Jwks) -> HashMap<String, CachedKey> {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            // Skip encryption keys
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            match Self::jwk_to_cached_key(jwk) {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    debug!(kid = %kid, kty = %jwk.kty, "Loaded JWK");
                    keys.insert(kid, key);
                }
                Err(e) => {
                    warn!(
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        error = %e,
                        "Failed to parse JWK, skipping"
                    );
                }
            }
        }
        keys
    }

    fn jwk_to_cached_key(jwk: &Jwk) -> Result<CachedKey> {
        let (key, family) = match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk.n.as_ref().ok_or_else(|| anyhow!("RSA key missing 'n'"))?;
                let e = jwk.e.as_ref().ok_or_else(|| anyhow!("RSA key missing 'e'"))?;
                let key = DecodingKey::from_rsa_components(n, e)
                    .context("Failed to create RSA DecodingKey")?;
                (key, KeyFamily::Rsa)
            }
            "EC" => {
                let crv = jwk.crv.as_deref().ok_or_else(|| anyhow!("EC key missing 'crv'"))?;
                if crv != "P-256" && crv != "P-384" {
                    return Err(anyhow!("Unsupported EC curve: {}", crv));
                }
                let x = jwk.x.as_ref().ok_or_else(|| anyhow!("EC key missing 'x'"))?;
                let y = jwk.y.as_ref().ok_or_else(|| anyhow!("EC key missing 'y'"))?;
                let key = DecodingKey::from_ec_components(x, y)
                    .context("Failed to create EC DecodingKey")?;
                (key, KeyFamily::Ec)
            }
            kty => return Err(anyhow!("Unsupported key type: {}", kty)),
        };

        Ok(CachedKey {
            key,
            family,
            alg: jwk.alg.clone(),
        })
    }
}
