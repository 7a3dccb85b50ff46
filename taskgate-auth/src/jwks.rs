use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::{AuthError, Reason};

/// Raw JWK as served by the provider's JWKS endpoint. Only the RSA
/// components we verify with are captured.
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

/// Cached key material. `DecodingKey` does not implement `Clone`, so the
/// raw components are kept and a key is rebuilt per lookup.
#[derive(Debug, Clone)]
struct CachedJwk {
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

impl CachedJwk {
    fn to_decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match self.kty.as_str() {
            "RSA" => {
                let (Some(n), Some(e)) = (self.n.as_deref(), self.e.as_deref()) else {
                    return Err(AuthError::TokenInvalid(Reason::BadSignature));
                };
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|_| AuthError::TokenInvalid(Reason::BadSignature))
            }
            _ => Err(AuthError::TokenInvalid(Reason::BadSignature)),
        }
    }
}

struct CacheInner {
    keys: HashMap<String, CachedJwk>,
    last_refresh: Option<Instant>,
    last_refresh_attempt: Option<Instant>,
}

/// Provider signing keys, fetched lazily and cached by `kid`.
///
/// A lookup for an unknown `kid` forces a refresh before failing, which is
/// how provider key rotation is absorbed. Refreshes are rate-limited by a
/// minimum interval so a flood of bad tokens cannot hammer the JWKS
/// endpoint.
pub struct JwksCache {
    inner: Arc<RwLock<CacheInner>>,
    jwks_url: String,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    client: reqwest::Client,
    refresh_lock: Mutex<()>,
}

impl JwksCache {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(RwLock::new(CacheInner {
                keys: HashMap::new(),
                last_refresh: None,
                last_refresh_attempt: None,
            })),
            jwks_url: config.jwks_url.clone(),
            cache_ttl: config.jwks_cache_ttl,
            min_refresh_interval: config.jwks_min_refresh_interval,
            client,
            refresh_lock: Mutex::new(()),
        })
    }

    /// Retrieve the decoding key for `kid`, refreshing the cache when the
    /// kid is unknown or the cached set is stale.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        let mut needs_refresh = false;
        let mut force_refresh = false;
        {
            let cache = self.inner.read().await;
            if let Some(jwk) = cache.keys.get(kid) {
                if is_stale(cache.last_refresh, self.cache_ttl) {
                    needs_refresh = true;
                } else {
                    return jwk.to_decoding_key();
                }
            } else {
                needs_refresh = true;
                force_refresh = true;
            }
        }

        if needs_refresh {
            self.try_refresh(force_refresh).await?;
        }

        let cache = self.inner.read().await;
        cache
            .keys
            .get(kid)
            .ok_or(AuthError::TokenInvalid(Reason::BadSignature))?
            .to_decoding_key()
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("JWKS fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| AuthError::Provider(format!("JWKS fetch failed: {e}")))?;

        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Provider(format!("JWKS parse failed: {e}")))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(kid) = &jwk.kid {
                keys.insert(
                    kid.clone(),
                    CachedJwk {
                        kty: jwk.kty.clone(),
                        n: jwk.n.clone(),
                        e: jwk.e.clone(),
                    },
                );
            }
        }
        debug!(count = keys.len(), "refreshed provider signing keys");

        let now = Instant::now();
        let mut cache = self.inner.write().await;
        cache.keys = keys;
        cache.last_refresh = Some(now);
        cache.last_refresh_attempt = Some(now);
        Ok(())
    }

    async fn try_refresh(&self, force: bool) -> Result<(), AuthError> {
        {
            let cache = self.inner.read().await;
            if !force && !is_stale(cache.last_refresh, self.cache_ttl) {
                return Ok(());
            }
            if !can_attempt(cache.last_refresh_attempt, self.min_refresh_interval) {
                return Ok(());
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Re-check after taking the lock: a concurrent caller may have
        // refreshed while we waited.
        {
            let cache = self.inner.read().await;
            if !force && !is_stale(cache.last_refresh, self.cache_ttl) {
                return Ok(());
            }
            if !can_attempt(cache.last_refresh_attempt, self.min_refresh_interval) {
                return Ok(());
            }
        }

        {
            let mut cache = self.inner.write().await;
            cache.last_refresh_attempt = Some(Instant::now());
        }

        self.refresh().await
    }
}

fn is_stale(last_refresh: Option<Instant>, ttl: Duration) -> bool {
    match last_refresh {
        None => true,
        Some(ts) => ts.elapsed() >= ttl,
    }
}

fn can_attempt(last_attempt: Option<Instant>, min_interval: Duration) -> bool {
    match last_attempt {
        None => true,
        Some(ts) => ts.elapsed() >= min_interval,
    }
}
