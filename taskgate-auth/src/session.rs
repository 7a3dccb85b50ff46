use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use taskgate_store::KvStore;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::random_urlsafe;

/// An authenticated user's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub workspace_domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Identity and client metadata a new session is created from.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub workspace_domain: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AuthError>> + Send + 'a>>;

/// Session persistence backend.
///
/// Two implementations exist: [`StoreSessions`] against the shared store,
/// and [`CookieSessions`] as the degraded single-process fallback. The
/// choice is made once at startup; callers never branch on which one is
/// active.
pub trait SessionBackend: Send + Sync + 'static {
    /// Create a session and return the opaque token the browser holds,
    /// together with the created record.
    fn create(&self, new: NewSession) -> SessionFuture<'_, (String, Session)>;

    /// Resolve a token into its live session, refreshing the TTL and
    /// `last_activity_at`. Absence is the normal not-authenticated outcome.
    fn get<'a>(&'a self, token: &'a str) -> SessionFuture<'a, Option<Session>>;

    /// Destroy the session behind a token. Unknown tokens are a no-op.
    fn destroy<'a>(&'a self, token: &'a str) -> SessionFuture<'a, ()>;

    /// Destroy every session belonging to `email`, returning how many were
    /// removed.
    fn destroy_all<'a>(&'a self, email: &'a str) -> SessionFuture<'a, usize>;
}

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

fn index_key(email: &str) -> String {
    format!("user_sessions:{email}")
}

/// Shared-store session backend.
///
/// Records live at `session:{id}`; a per-user index set at
/// `user_sessions:{email}` enables logout-everywhere. The two are written
/// together on creation and deletion. A record missing while the index
/// still lists it is treated as not-authenticated, never the reverse.
pub struct StoreSessions {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl StoreSessions {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }
}

impl SessionBackend for StoreSessions {
    fn create(&self, new: NewSession) -> SessionFuture<'_, (String, Session)> {
        Box::pin(async move {
            let now = Utc::now();
            let session = Session {
                session_id: random_urlsafe(32),
                user_id: new.user_id,
                email: new.email,
                display_name: new.display_name,
                avatar_url: new.avatar_url,
                workspace_domain: new.workspace_domain,
                created_at: now,
                last_activity_at: now,
                client_ip: new.client_ip,
                user_agent: new.user_agent,
            };
            let body = serde_json::to_vec(&session)
                .map_err(|e| AuthError::StoreUnavailable(e.to_string()))?;
            // Index before record: a failure between the two writes must
            // leave a dangling index entry, never an unindexed record.
            self.store
                .set_add(&index_key(&session.email), &session.session_id, self.ttl)
                .await?;
            self.store
                .set(&session_key(&session.session_id), Bytes::from(body), self.ttl)
                .await?;
            debug!(email = %session.email, "session created");
            Ok((session.session_id.clone(), session))
        })
    }

    fn get<'a>(&'a self, token: &'a str) -> SessionFuture<'a, Option<Session>> {
        Box::pin(async move {
            let Some(body) = self.store.get(&session_key(token)).await? else {
                return Ok(None);
            };

            let mut session: Session = match serde_json::from_slice(&body) {
                Ok(session) => session,
                Err(e) => {
                    // Unknown or legacy shape: drop it rather than trust it.
                    warn!(error = %e, "discarding unreadable session record");
                    self.store.remove(&session_key(token)).await?;
                    return Ok(None);
                }
            };

            session.last_activity_at = Utc::now();
            let body = serde_json::to_vec(&session)
                .map_err(|e| AuthError::StoreUnavailable(e.to_string()))?;
            self.store
                .set(&session_key(token), Bytes::from(body), self.ttl)
                .await?;
            Ok(Some(session))
        })
    }

    fn destroy<'a>(&'a self, token: &'a str) -> SessionFuture<'a, ()> {
        Box::pin(async move {
            let Some(body) = self.store.take(&session_key(token)).await? else {
                return Ok(());
            };
            if let Ok(session) = serde_json::from_slice::<Session>(&body) {
                self.store
                    .set_remove(&index_key(&session.email), &session.session_id)
                    .await?;
                debug!(email = %session.email, "session destroyed");
            }
            Ok(())
        })
    }

    fn destroy_all<'a>(&'a self, email: &'a str) -> SessionFuture<'a, usize> {
        Box::pin(async move {
            // Snapshot then batch-delete. A session created after the
            // snapshot survives; it keeps its own index entry.
            let ids = self.store.set_members(&index_key(email)).await?;
            let count = ids.len();
            let mut keys: Vec<String> = ids.iter().map(|id| session_key(id)).collect();
            keys.push(index_key(email));
            self.store.remove_many(&keys).await?;
            debug!(%email, count, "all sessions destroyed");
            Ok(count)
        })
    }
}

/// Cookie-embedded session claims.
#[derive(Debug, Serialize, Deserialize)]
struct CookieClaims {
    exp: i64,
    #[serde(flatten)]
    session: Session,
}

/// Degraded-mode session backend used when the shared store is down at
/// startup: the whole session rides in a signed cookie.
///
/// Non-durable and non-shared across instances, and a session cannot be
/// revoked before its expiry — `destroy` only takes effect because the
/// handler clears the cookie, and `destroy_all` cannot reach cookies held
/// by other browsers.
pub struct CookieSessions {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl CookieSessions {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }
}

impl SessionBackend for CookieSessions {
    fn create(&self, new: NewSession) -> SessionFuture<'_, (String, Session)> {
        Box::pin(async move {
            let now = Utc::now();
            let session = Session {
                session_id: random_urlsafe(32),
                user_id: new.user_id,
                email: new.email,
                display_name: new.display_name,
                avatar_url: new.avatar_url,
                workspace_domain: new.workspace_domain,
                created_at: now,
                last_activity_at: now,
                client_ip: new.client_ip,
                user_agent: new.user_agent,
            };
            let claims = CookieClaims {
                exp: now.timestamp() + self.ttl.as_secs() as i64,
                session: session.clone(),
            };
            let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
                .map_err(|e| AuthError::StoreUnavailable(e.to_string()))?;
            debug!(email = %session.email, "cookie session created");
            Ok((token, session))
        })
    }

    fn get<'a>(&'a self, token: &'a str) -> SessionFuture<'a, Option<Session>> {
        Box::pin(async move {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_aud = false;
            match decode::<CookieClaims>(token, &self.decoding_key, &validation) {
                Ok(data) => {
                    let mut session = data.claims.session;
                    session.last_activity_at = Utc::now();
                    Ok(Some(session))
                }
                Err(_) => Ok(None),
            }
        })
    }

    fn destroy<'a>(&'a self, _token: &'a str) -> SessionFuture<'a, ()> {
        // Nothing to delete server-side; the handler clears the cookie.
        Box::pin(async move { Ok(()) })
    }

    fn destroy_all<'a>(&'a self, email: &'a str) -> SessionFuture<'a, usize> {
        Box::pin(async move {
            warn!(%email, "cookie sessions cannot be revoked remotely");
            Ok(0)
        })
    }
}
