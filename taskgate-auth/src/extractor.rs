use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, OptionalFromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::handlers::AuthState;
use crate::session::Session;
use crate::SESSION_COOKIE;

/// How a request authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Cookie,
    ApiToken,
}

/// The authenticated caller, resolved from the session cookie or a bearer
/// API token (in that order).
///
/// Store failures during resolution fail closed: the request is treated as
/// unauthenticated, with the real cause in the logs.
///
/// # Example
///
/// ```ignore
/// async fn protected(user: CurrentUser) -> Json<TaskList> {
///     load_tasks(&user.session.email).await
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub session: Session,
    /// The token that resolved this user (cookie value or API token).
    pub token: String,
    pub method: AuthMethod,
}

async fn resolve(parts: &Parts, state: &AuthState) -> Result<Option<CurrentUser>, AuthError> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        match state.sessions.get(cookie.value()).await {
            Ok(Some(session)) => {
                debug!(uri = %parts.uri, "authenticated via session cookie");
                return Ok(Some(CurrentUser {
                    session,
                    token: cookie.value().to_string(),
                    method: AuthMethod::Cookie,
                }));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(uri = %parts.uri, error = %e, "session lookup failed, treating as unauthenticated");
                return Ok(None);
            }
        }
    }

    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        let Some(token) = header
            .to_str()
            .ok()
            .and_then(|v| v.split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("Bearer"))
            .map(|(_, token)| token)
        else {
            return Ok(None);
        };

        match state
            .exchange
            .validate_api_token(token, state.sessions.as_ref())
            .await
        {
            Ok(Some(session)) => {
                debug!(uri = %parts.uri, "authenticated via api token");
                return Ok(Some(CurrentUser {
                    session,
                    token: token.to_string(),
                    method: AuthMethod::ApiToken,
                }));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(uri = %parts.uri, error = %e, "api token lookup failed, treating as unauthenticated");
            }
        }
    }

    Ok(None)
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    Arc<AuthState>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state: Arc<AuthState> = Arc::from_ref(state);
        resolve(parts, &state).await?.ok_or(AuthError::Unauthorized)
    }
}

impl<S> OptionalFromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    Arc<AuthState>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        let state: Arc<AuthState> = Arc::from_ref(state);
        resolve(parts, &state).await
    }
}
