use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use taskgate_store::StoreError;

/// Reason an ID token was rejected.
///
/// Reason codes are logged for audit; clients only ever see a generic
/// "invalid token" failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Expired,
    BadSignature,
    BadIssuer,
    BadAudience,
    BadDomain,
    UnverifiedEmail,
}

impl Reason {
    pub fn code(&self) -> &'static str {
        match self {
            Reason::Expired => "expired",
            Reason::BadSignature => "bad-signature",
            Reason::BadIssuer => "bad-issuer",
            Reason::BadAudience => "bad-audience",
            Reason::BadDomain => "bad-domain",
            Reason::UnverifiedEmail => "unverified-email",
        }
    }
}

/// Generic error body returned to clients. Detail stays in the logs.
#[derive(Debug, Serialize)]
pub struct AuthErrorBody {
    pub error: &'static str,
}

/// Authentication subsystem error type.
///
/// Everything here is converted to an HTTP response at the handler boundary;
/// nothing propagates past it.
#[derive(Debug)]
pub enum AuthError {
    /// Network or non-2xx failure talking to the identity provider.
    Provider(String),
    /// ID token failed verification.
    TokenInvalid(Reason),
    /// CSRF state missing or not matching the issued value.
    CsrfMismatch,
    /// A one-time state or nonce value was presented a second time.
    ReplayDetected,
    /// Callback arrived after the flow deadline.
    TimeoutExceeded,
    /// The identity provider reported an error, or the user declined.
    Denied(String),
    /// The shared store could not serve a session read/write.
    StoreUnavailable(String),
    /// Caller exceeded a quota.
    RateLimited,
    /// No valid session or API token presented.
    Unauthorized,
}

impl AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            AuthError::Provider(_) => "provider_error",
            AuthError::TokenInvalid(_) => "invalid_token",
            AuthError::CsrfMismatch => "invalid_state",
            AuthError::ReplayDetected => "invalid_state",
            AuthError::TimeoutExceeded => "login_expired",
            AuthError::Denied(_) => "access_denied",
            AuthError::StoreUnavailable(_) => "not_authenticated",
            AuthError::RateLimited => "rate_limited",
            AuthError::Unauthorized => "not_authenticated",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Provider(_) => StatusCode::BAD_GATEWAY,
            AuthError::TokenInvalid(_) => StatusCode::FORBIDDEN,
            AuthError::CsrfMismatch => StatusCode::FORBIDDEN,
            AuthError::ReplayDetected => StatusCode::FORBIDDEN,
            AuthError::TimeoutExceeded => StatusCode::FORBIDDEN,
            AuthError::Denied(_) => StatusCode::FORBIDDEN,
            // Infrastructure failure on a session path fails closed: the
            // caller is simply not authenticated.
            AuthError::StoreUnavailable(_) => StatusCode::UNAUTHORIZED,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn detail(&self) -> String {
        match self {
            AuthError::Provider(s) => format!("identity provider failure: {s}"),
            AuthError::TokenInvalid(reason) => format!("token rejected: {}", reason.code()),
            AuthError::CsrfMismatch => "state value did not match".to_string(),
            AuthError::ReplayDetected => "one-time value already consumed".to_string(),
            AuthError::TimeoutExceeded => "login flow exceeded its deadline".to_string(),
            AuthError::Denied(s) => format!("provider denied the request: {s}"),
            AuthError::StoreUnavailable(s) => format!("store unavailable: {s}"),
            AuthError::RateLimited => "quota exceeded".to_string(),
            AuthError::Unauthorized => "not authenticated".to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        // Detail goes to the log, never to the client.
        tracing::warn!(error = %self, "auth request rejected");
        let body = AuthErrorBody {
            error: self.error_code(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.detail())
    }
}

impl std::error::Error for AuthError {}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::StoreUnavailable(err.to_string())
    }
}
