use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use taskgate_store::KvStore;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::random_urlsafe;

/// Stored one-time value with its issue timestamp.
#[derive(Debug, Serialize, Deserialize)]
struct IssuedToken {
    value: String,
    issued_at: i64,
}

/// One-time token issuance and consumption, bound to a login flow.
///
/// Backs both the CSRF `state` parameter and the OIDC `nonce`; the two use
/// separate instances with distinct key namespaces. A value can be verified
/// at most once: verification is an atomic fetch-and-delete, so of two
/// concurrent callbacks at most one can succeed.
pub struct OneTimeTokens {
    store: Arc<dyn KvStore>,
    namespace: &'static str,
    deadline: Duration,
}

impl OneTimeTokens {
    pub fn new(store: Arc<dyn KvStore>, namespace: &'static str, deadline: Duration) -> Self {
        Self {
            store,
            namespace,
            deadline,
        }
    }

    fn key(&self, flow_id: &str) -> String {
        format!("{}:{}", self.namespace, flow_id)
    }

    /// Generate and store a fresh value for this flow, returning it for
    /// embedding in the outbound request.
    pub async fn issue(&self, flow_id: &str) -> Result<String, AuthError> {
        let value = random_urlsafe(32);
        let record = IssuedToken {
            value: value.clone(),
            issued_at: Utc::now().timestamp(),
        };
        let body = serde_json::to_vec(&record)
            .map_err(|e| AuthError::StoreUnavailable(e.to_string()))?;
        self.store
            .set(&self.key(flow_id), Bytes::from(body), self.deadline)
            .await?;
        debug!(namespace = self.namespace, "issued one-time value");
        Ok(value)
    }

    /// Consume and return the stored value for this flow.
    ///
    /// Fails if the value is absent (already consumed, or expired) or if
    /// the flow outlived its deadline.
    pub async fn redeem(&self, flow_id: &str) -> Result<String, AuthError> {
        let Some(body) = self.store.take(&self.key(flow_id)).await? else {
            warn!(namespace = self.namespace, "one-time value absent: replay or expired flow");
            return Err(AuthError::ReplayDetected);
        };

        let record: IssuedToken = serde_json::from_slice(&body).map_err(|e| {
            warn!(namespace = self.namespace, error = %e, "unreadable one-time record");
            AuthError::CsrfMismatch
        })?;

        let age = Utc::now().timestamp() - record.issued_at;
        if age < 0 || age as u64 > self.deadline.as_secs() {
            warn!(namespace = self.namespace, age, "one-time value past its deadline");
            return Err(AuthError::TimeoutExceeded);
        }

        Ok(record.value)
    }

    /// Consume the stored value and check `candidate` against it.
    /// Comparison is constant-time.
    pub async fn verify(&self, flow_id: &str, candidate: &str) -> Result<(), AuthError> {
        let value = self.redeem(flow_id).await?;
        if value.as_bytes().ct_eq(candidate.as_bytes()).into() {
            Ok(())
        } else {
            warn!(namespace = self.namespace, "one-time value mismatch");
            Err(AuthError::CsrfMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_store::InMemoryStore;

    fn tokens() -> OneTimeTokens {
        OneTimeTokens::new(
            Arc::new(InMemoryStore::new()),
            "state",
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn issued_value_verifies_once() {
        let tokens = tokens();
        let value = tokens.issue("flow-1").await.unwrap();
        tokens.verify("flow-1", &value).await.unwrap();
        assert!(matches!(
            tokens.verify("flow-1", &value).await,
            Err(AuthError::ReplayDetected)
        ));
    }

    #[tokio::test]
    async fn wrong_candidate_is_rejected_and_still_consumes() {
        let tokens = tokens();
        let value = tokens.issue("flow-1").await.unwrap();
        assert!(matches!(
            tokens.verify("flow-1", "forged").await,
            Err(AuthError::CsrfMismatch)
        ));
        // The fetch-and-delete consumed the record even on mismatch.
        assert!(matches!(
            tokens.verify("flow-1", &value).await,
            Err(AuthError::ReplayDetected)
        ));
    }

    #[tokio::test]
    async fn values_are_flow_scoped() {
        let tokens = tokens();
        let value = tokens.issue("flow-1").await.unwrap();
        assert!(tokens.verify("flow-2", &value).await.is_err());
    }

    #[tokio::test]
    async fn expired_deadline_is_rejected() {
        let tokens = OneTimeTokens::new(
            Arc::new(InMemoryStore::new()),
            "state",
            Duration::from_secs(0),
        );
        let value = tokens.issue("flow-1").await.unwrap();
        // With a zero deadline the store evicts the record immediately.
        assert!(tokens.verify("flow-1", &value).await.is_err());
    }
}
