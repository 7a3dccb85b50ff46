use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use taskgate_store::KvStore;
use tracing::warn;

use crate::csrf::OneTimeTokens;
use crate::error::AuthError;
use crate::random_urlsafe;

/// Values minted when a login flow opens: what the pre-auth cookie
/// carries, and the `state`/`nonce` pair embedded in the provider request.
pub struct FlowTicket {
    pub cookie_value: String,
    pub state: String,
    pub nonce: String,
}

/// What the callback recovers from its flow: the nonce the ID token must
/// echo, and the remembered destination.
pub struct FlowRecord {
    pub nonce: String,
    pub next: Option<String>,
}

type FlowFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AuthError>> + Send + 'a>>;

/// Pre-auth flow state backend.
///
/// Two implementations exist, paired with the session backends:
/// [`StoreFlows`] keeps state, nonce and destination in the shared store
/// behind an opaque flow id, and [`CookieFlows`] folds all three into the
/// signed pre-auth cookie itself so the flow still completes while the
/// store is down.
pub trait FlowStateBackend: Send + Sync + 'static {
    /// Open a flow: mint state and nonce, remember `next`, and return the
    /// value the pre-auth cookie carries. `next` is pre-validated by the
    /// caller.
    fn begin<'a>(&'a self, next: Option<&'a str>) -> FlowFuture<'a, FlowTicket>;

    /// Close the flow behind `cookie_value`, checking the presented state
    /// against the issued one. A flow can be consumed at most once.
    fn consume<'a>(&'a self, cookie_value: &'a str, state: &'a str) -> FlowFuture<'a, FlowRecord>;
}

fn next_key(flow_id: &str) -> String {
    format!("flow_next:{flow_id}")
}

/// Shared-store flow backend; the cookie holds a random flow id.
pub struct StoreFlows {
    store: Arc<dyn KvStore>,
    state_tokens: OneTimeTokens,
    nonce_tokens: OneTimeTokens,
    deadline: Duration,
}

impl StoreFlows {
    pub fn new(store: Arc<dyn KvStore>, deadline: Duration) -> Self {
        Self {
            state_tokens: OneTimeTokens::new(store.clone(), "oauth_state", deadline),
            nonce_tokens: OneTimeTokens::new(store.clone(), "oauth_nonce", deadline),
            store,
            deadline,
        }
    }
}

impl FlowStateBackend for StoreFlows {
    fn begin<'a>(&'a self, next: Option<&'a str>) -> FlowFuture<'a, FlowTicket> {
        Box::pin(async move {
            let flow_id = random_urlsafe(16);
            let state = self.state_tokens.issue(&flow_id).await?;
            let nonce = self.nonce_tokens.issue(&flow_id).await?;
            if let Some(next) = next {
                self.store
                    .set(
                        &next_key(&flow_id),
                        Bytes::from(next.as_bytes().to_vec()),
                        self.deadline,
                    )
                    .await?;
            }
            Ok(FlowTicket {
                cookie_value: flow_id,
                state,
                nonce,
            })
        })
    }

    fn consume<'a>(&'a self, cookie_value: &'a str, state: &'a str) -> FlowFuture<'a, FlowRecord> {
        Box::pin(async move {
            self.state_tokens.verify(cookie_value, state).await?;
            let nonce = self.nonce_tokens.redeem(cookie_value).await?;

            let next = match self.store.take(&next_key(cookie_value)).await {
                Ok(Some(body)) => String::from_utf8(body.to_vec()).ok(),
                Ok(None) => None,
                Err(e) => {
                    // Losing the destination is not worth failing the login.
                    warn!(error = %e, "could not read post-login destination");
                    None
                }
            };

            Ok(FlowRecord { nonce, next })
        })
    }
}

/// Signed flow cookie claims.
#[derive(Debug, Serialize, Deserialize)]
struct FlowClaims {
    exp: i64,
    state: String,
    nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next: Option<String>,
}

/// Degraded-mode flow backend, paired with
/// [`CookieSessions`](crate::CookieSessions): the whole flow record rides
/// in the signed pre-auth cookie.
///
/// Clearing the cookie on callback is the only replay defence here; a
/// captured cookie stays redeemable until the flow deadline. The deadline
/// check itself holds because it is part of the signed claims.
pub struct CookieFlows {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    deadline: Duration,
}

impl CookieFlows {
    pub fn new(secret: &str, deadline: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            deadline,
        }
    }
}

impl FlowStateBackend for CookieFlows {
    fn begin<'a>(&'a self, next: Option<&'a str>) -> FlowFuture<'a, FlowTicket> {
        Box::pin(async move {
            let state = random_urlsafe(32);
            let nonce = random_urlsafe(32);
            let claims = FlowClaims {
                exp: Utc::now().timestamp() + self.deadline.as_secs() as i64,
                state: state.clone(),
                nonce: nonce.clone(),
                next: next.map(str::to_string),
            };
            let cookie_value = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
                .map_err(|e| AuthError::StoreUnavailable(e.to_string()))?;
            Ok(FlowTicket {
                cookie_value,
                state,
                nonce,
            })
        })
    }

    fn consume<'a>(&'a self, cookie_value: &'a str, state: &'a str) -> FlowFuture<'a, FlowRecord> {
        Box::pin(async move {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_aud = false;
            validation.leeway = 0;
            let claims = decode::<FlowClaims>(cookie_value, &self.decoding_key, &validation)
                .map_err(|e| match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        warn!("flow cookie past its deadline");
                        AuthError::TimeoutExceeded
                    }
                    _ => {
                        warn!(error = %e, "unreadable flow cookie");
                        AuthError::CsrfMismatch
                    }
                })?
                .claims;

            if !bool::from(claims.state.as_bytes().ct_eq(state.as_bytes())) {
                warn!("flow cookie state mismatch");
                return Err(AuthError::CsrfMismatch);
            }

            Ok(FlowRecord {
                nonce: claims.nonce,
                next: claims.next,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_store::InMemoryStore;

    fn store_flows() -> StoreFlows {
        StoreFlows::new(Arc::new(InMemoryStore::new()), Duration::from_secs(600))
    }

    #[tokio::test]
    async fn store_flow_roundtrip() {
        let flows = store_flows();
        let ticket = flows.begin(Some("/board/7")).await.unwrap();
        let record = flows
            .consume(&ticket.cookie_value, &ticket.state)
            .await
            .unwrap();
        assert_eq!(record.nonce, ticket.nonce);
        assert_eq!(record.next.as_deref(), Some("/board/7"));
    }

    #[tokio::test]
    async fn store_flow_consumes_once() {
        let flows = store_flows();
        let ticket = flows.begin(None).await.unwrap();
        flows
            .consume(&ticket.cookie_value, &ticket.state)
            .await
            .unwrap();
        assert!(matches!(
            flows.consume(&ticket.cookie_value, &ticket.state).await,
            Err(AuthError::ReplayDetected)
        ));
    }

    #[tokio::test]
    async fn cookie_flow_roundtrip() {
        let flows = CookieFlows::new("flow-secret", Duration::from_secs(600));
        let ticket = flows.begin(Some("/board/7")).await.unwrap();
        let record = flows
            .consume(&ticket.cookie_value, &ticket.state)
            .await
            .unwrap();
        assert_eq!(record.nonce, ticket.nonce);
        assert_eq!(record.next.as_deref(), Some("/board/7"));
    }

    #[tokio::test]
    async fn cookie_flow_rejects_wrong_state_and_forgeries() {
        let flows = CookieFlows::new("flow-secret", Duration::from_secs(600));
        let ticket = flows.begin(None).await.unwrap();
        assert!(matches!(
            flows.consume(&ticket.cookie_value, "forged").await,
            Err(AuthError::CsrfMismatch)
        ));

        let forged = CookieFlows::new("other-secret", Duration::from_secs(600));
        assert!(matches!(
            forged.consume(&ticket.cookie_value, &ticket.state).await,
            Err(AuthError::CsrfMismatch)
        ));
    }
}
