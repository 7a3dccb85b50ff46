use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::{AuthError, Reason};
use crate::jwks::JwksCache;

/// Claims carried by a verified ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    /// Hosted workspace domain, present for workspace accounts.
    #[serde(default)]
    pub hd: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    pub exp: u64,
    pub iat: u64,
}

/// Source of decoding keys: the provider's JWKS, or a static key for tests.
enum KeySource {
    Jwks(Arc<JwksCache>),
    Static(DecodingKey),
}

/// Validates provider ID tokens.
///
/// Checks run in a fixed order and each failure carries its own reason
/// code: signature and expiry first, then issuer, audience, the
/// hosted-domain restriction, and the email-verified flag. A token is
/// either fully trusted or rejected; there is no partial outcome.
pub struct IdTokenVerifier {
    keys: KeySource,
    issuer: String,
    audience: String,
    workspace_domain: Option<String>,
    algorithms: Vec<Algorithm>,
    leeway_secs: u64,
}

impl IdTokenVerifier {
    /// Verifier backed by the provider's JWKS.
    pub fn new(jwks: Arc<JwksCache>, config: &AuthConfig) -> Self {
        Self {
            keys: KeySource::Jwks(jwks),
            issuer: config.issuer.clone(),
            audience: config.client_id.clone(),
            workspace_domain: config.restricted_domain().map(str::to_string),
            algorithms: vec![Algorithm::RS256],
            leeway_secs: 10,
        }
    }

    /// Verifier with a static decoding key (useful for testing).
    pub fn new_with_static_key(key: DecodingKey, config: &AuthConfig) -> Self {
        Self {
            keys: KeySource::Static(key),
            issuer: config.issuer.clone(),
            audience: config.client_id.clone(),
            workspace_domain: config.restricted_domain().map(str::to_string),
            algorithms: vec![Algorithm::RS256],
            leeway_secs: 10,
        }
    }

    /// Override the accepted signing algorithms (tests use HS256).
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Validate an ID token and return its claims.
    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, AuthError> {
        let header = decode_header(token).map_err(|e| {
            warn!(error = %e, "undecodable ID token header");
            AuthError::TokenInvalid(Reason::BadSignature)
        })?;

        if !self.algorithms.contains(&header.alg) {
            warn!(algorithm = ?header.alg, "disallowed ID token algorithm");
            return Err(AuthError::TokenInvalid(Reason::BadSignature));
        }

        let decoding_key = match &self.keys {
            KeySource::Static(key) => key.clone(),
            KeySource::Jwks(jwks) => {
                let kid = header.kid.as_deref().ok_or_else(|| {
                    warn!("ID token header missing 'kid'");
                    AuthError::TokenInvalid(Reason::BadSignature)
                })?;
                jwks.get_key(kid).await?
            }
        };

        // Signature and expiry here; issuer/audience/domain checked below
        // so each failure gets its own reason code.
        let mut validation = Validation::new(header.alg);
        validation.algorithms = self.algorithms.clone();
        validation.leeway = self.leeway_secs;
        validation.validate_exp = true;
        validation.validate_aud = false;

        let data = decode::<IdTokenClaims>(token, &decoding_key, &validation).map_err(|e| {
            let reason = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Reason::Expired,
                _ => Reason::BadSignature,
            };
            warn!(error = %e, reason = reason.code(), "ID token failed validation");
            AuthError::TokenInvalid(reason)
        })?;
        let claims = data.claims;

        if claims.iss != self.issuer {
            warn!(iss = %claims.iss, "ID token from unexpected issuer");
            return Err(AuthError::TokenInvalid(Reason::BadIssuer));
        }

        if claims.aud != self.audience {
            warn!(aud = %claims.aud, "ID token for a different audience");
            return Err(AuthError::TokenInvalid(Reason::BadAudience));
        }

        // Workspace restriction is checked twice over: the hosted-domain
        // claim and the email suffix must both agree with the configured
        // domain.
        if let Some(domain) = &self.workspace_domain {
            let hd_ok = claims.hd.as_deref() == Some(domain.as_str());
            let suffix_ok = claims
                .email
                .rsplit_once('@')
                .is_some_and(|(_, d)| d.eq_ignore_ascii_case(domain));
            if !hd_ok || !suffix_ok {
                warn!(email = %claims.email, hd = ?claims.hd, "ID token outside the workspace domain");
                return Err(AuthError::TokenInvalid(Reason::BadDomain));
            }
        }

        if !claims.email_verified {
            warn!(email = %claims.email, "ID token with unverified email");
            return Err(AuthError::TokenInvalid(Reason::UnverifiedEmail));
        }

        debug!(sub = %claims.sub, "ID token verified");
        Ok(claims)
    }
}
