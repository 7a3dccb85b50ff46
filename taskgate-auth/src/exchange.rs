use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskgate_store::KvStore;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::random_urlsafe;
use crate::session::{Session, SessionBackend};

/// Stored record behind a bridge or API token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub session_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

fn bridge_key(token: &str) -> String {
    format!("bridge:{token}")
}

fn api_key(token: &str) -> String {
    format!("api:{token}")
}

/// Moves an authenticated identity across an origin boundary.
///
/// The callback hands the browser a short-lived single-use bridge token in
/// a redirect URL; the frontend redeems it once for a long-lived API token
/// it can present as a bearer credential from its own origin.
pub struct TokenExchange {
    store: Arc<dyn KvStore>,
    bridge_ttl: Duration,
    api_ttl: Duration,
}

impl TokenExchange {
    pub fn new(store: Arc<dyn KvStore>, bridge_ttl: Duration, api_ttl: Duration) -> Self {
        Self {
            store,
            bridge_ttl,
            api_ttl,
        }
    }

    /// Mint a bridge token for a freshly established session.
    pub async fn issue_bridge(&self, session_id: &str, email: &str) -> Result<String, AuthError> {
        let token = random_urlsafe(32);
        self.put(&bridge_key(&token), session_id, email, self.bridge_ttl)
            .await?;
        debug!(%email, "bridge token issued");
        Ok(token)
    }

    /// Redeem a bridge token, deleting it. At most one redemption can ever
    /// succeed for a given token.
    pub async fn redeem_bridge(&self, token: &str) -> Result<Option<TokenRecord>, AuthError> {
        let Some(body) = self.store.take(&bridge_key(token)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&body) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "discarding unreadable bridge record");
                Ok(None)
            }
        }
    }

    /// Mint a long-lived API token bound to a session.
    pub async fn mint_api_token(&self, session_id: &str, email: &str) -> Result<String, AuthError> {
        let token = random_urlsafe(32);
        self.put(&api_key(&token), session_id, email, self.api_ttl)
            .await?;
        debug!(%email, "api token minted");
        Ok(token)
    }

    /// Resolve an API token to its live session, sliding the token's TTL
    /// forward on success.
    ///
    /// A token whose backing session has expired or been destroyed resolves
    /// to absent and the orphaned record is removed; stale identity is never
    /// returned.
    pub async fn validate_api_token(
        &self,
        token: &str,
        sessions: &dyn SessionBackend,
    ) -> Result<Option<Session>, AuthError> {
        let Some(body) = self.store.get(&api_key(token)).await? else {
            return Ok(None);
        };
        let record: TokenRecord = match serde_json::from_slice(&body) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "discarding unreadable api token record");
                self.store.remove(&api_key(token)).await?;
                return Ok(None);
            }
        };

        let Some(session) = sessions.get(&record.session_id).await? else {
            warn!(email = %record.email, "api token outlived its session");
            self.store.remove(&api_key(token)).await?;
            return Ok(None);
        };

        // Sliding expiration: every successful validation rewrites the
        // record with a full TTL.
        self.put(&api_key(token), &record.session_id, &record.email, self.api_ttl)
            .await?;
        Ok(Some(session))
    }

    async fn put(
        &self,
        key: &str,
        session_id: &str,
        email: &str,
        ttl: Duration,
    ) -> Result<(), AuthError> {
        let record = TokenRecord {
            session_id: session_id.to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        let body =
            serde_json::to_vec(&record).map_err(|e| AuthError::StoreUnavailable(e.to_string()))?;
        self.store.set(key, Bytes::from(body), ttl).await?;
        Ok(())
    }
}
