use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use taskgate_store::KvStore;
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::exchange::TokenExchange;
use crate::extractor::{AuthMethod, CurrentUser};
use crate::flow::{CallbackParams, ClientMeta, OAuthFlow};
use crate::flow_state::{FlowStateBackend, StoreFlows};
use crate::provider::AuthCodeExchanger;
use crate::session::{Session, SessionBackend};
use crate::verify::IdTokenVerifier;
use crate::{FLOW_COOKIE, SESSION_COOKIE};

/// Shared state behind every auth endpoint.
pub struct AuthState {
    pub config: Arc<AuthConfig>,
    pub flow: OAuthFlow,
    pub sessions: Arc<dyn SessionBackend>,
    pub exchange: Arc<TokenExchange>,
}

impl AuthState {
    /// Store-backed state: flow records live in `store` alongside
    /// sessions and tokens.
    pub fn new(
        config: Arc<AuthConfig>,
        store: Arc<dyn KvStore>,
        verifier: Arc<IdTokenVerifier>,
        exchanger: Arc<dyn AuthCodeExchanger>,
        sessions: Arc<dyn SessionBackend>,
    ) -> Self {
        let flows = Arc::new(StoreFlows::new(store.clone(), config.flow_deadline));
        Self::with_flows(config, store, verifier, exchanger, sessions, flows)
    }

    /// State with an explicit flow backend; pair [`CookieFlows`] with
    /// [`CookieSessions`] when the store is unavailable.
    ///
    /// [`CookieFlows`]: crate::CookieFlows
    /// [`CookieSessions`]: crate::CookieSessions
    pub fn with_flows(
        config: Arc<AuthConfig>,
        store: Arc<dyn KvStore>,
        verifier: Arc<IdTokenVerifier>,
        exchanger: Arc<dyn AuthCodeExchanger>,
        sessions: Arc<dyn SessionBackend>,
        flows: Arc<dyn FlowStateBackend>,
    ) -> Self {
        let exchange = Arc::new(TokenExchange::new(
            store,
            config.bridge_ttl,
            config.session_ttl,
        ));
        let flow = OAuthFlow::new(
            config.clone(),
            flows,
            verifier,
            exchanger,
            sessions.clone(),
            exchange.clone(),
        );
        Self {
            config,
            flow,
            sessions,
            exchange,
        }
    }
}

/// The authentication routes.
pub fn router(state: Arc<AuthState>) -> Router {
    Router::new()
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/exchange-token", post(exchange_token))
        .route("/auth/status", get(status))
        .route("/auth/logout", post(logout))
        .route("/auth/logout-all", post(logout_all))
        .route("/auth/refresh", post(refresh))
        .route("/api/auth/check", get(check))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    token: String,
}

#[derive(Debug, Serialize)]
struct UserInfo {
    email: String,
    name: Option<String>,
    picture: Option<String>,
}

impl From<&Session> for UserInfo {
    fn from(session: &Session) -> Self {
        Self {
            email: session.email.clone(),
            name: session.display_name.clone(),
            picture: session.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ExchangeResponse {
    api_token: String,
    user: UserInfo,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserInfo>,
}

#[derive(Debug, Serialize)]
struct RevokedResponse {
    revoked: usize,
}

#[derive(Debug, Serialize)]
struct CheckResponse {
    authenticated: bool,
}

fn flow_cookie(config: &AuthConfig, value: String) -> Cookie<'static> {
    Cookie::build((FLOW_COOKIE, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(config.secure_cookies)
        .build()
}

/// The session cookie must survive the cross-site redirect back from the
/// provider, hence `SameSite=None` (which browsers only honor together
/// with `Secure`).
fn session_cookie(config: &AuthConfig, token: String) -> Cookie<'static> {
    let same_site = if config.secure_cookies {
        SameSite::None
    } else {
        SameSite::Lax
    };
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(same_site)
        .secure(config.secure_cookies)
        .build()
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, "")).path("/").build()
}

type FoundRedirect = (StatusCode, [(HeaderName, String); 1]);

/// 302 with a Location header; axum's `Redirect` only offers 303/307/308.
fn found(location: &str) -> FoundRedirect {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_string())],
    )
}

/// GET /auth/login
async fn login(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    Query(query): Query<LoginQuery>,
) -> Result<(CookieJar, FoundRedirect), AuthError> {
    let outcome = state.flow.login(query.next.as_deref()).await?;
    let jar = jar.add(flow_cookie(&state.config, outcome.flow_cookie));
    Ok((jar, found(&outcome.authorize_url)))
}

/// GET /auth/callback
async fn callback(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<(CookieJar, FoundRedirect), AuthError> {
    let flow_cookie = jar
        .get(FLOW_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(AuthError::CsrfMismatch)?;

    let meta = ClientMeta {
        ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string()),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let outcome = state.flow.callback(&flow_cookie, params, meta).await?;

    let jar = jar
        .remove(removal_cookie(FLOW_COOKIE))
        .add(session_cookie(&state.config, outcome.session_token));
    Ok((jar, found(&outcome.redirect)))
}

/// POST /auth/exchange-token
async fn exchange_token(
    State(state): State<Arc<AuthState>>,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, AuthError> {
    let record = state
        .exchange
        .redeem_bridge(&body.token)
        .await?
        .ok_or(AuthError::Unauthorized)?;

    let session = state
        .sessions
        .get(&record.session_id)
        .await?
        .ok_or(AuthError::Unauthorized)?;

    let api_token = state
        .exchange
        .mint_api_token(&session.session_id, &session.email)
        .await?;

    debug!(email = %session.email, "bridge token exchanged");
    Ok(Json(ExchangeResponse {
        api_token,
        user: UserInfo::from(&session),
    }))
}

/// GET /auth/status
async fn status(user: Option<CurrentUser>) -> Json<StatusResponse> {
    Json(match user {
        Some(user) => StatusResponse {
            authenticated: true,
            user: Some(UserInfo::from(&user.session)),
        },
        None => StatusResponse {
            authenticated: false,
            user: None,
        },
    })
}

/// POST /auth/logout
async fn logout(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    user: Option<CurrentUser>,
) -> Result<(CookieJar, StatusCode), AuthError> {
    if let Some(user) = user {
        let token = match user.method {
            AuthMethod::Cookie => user.token,
            AuthMethod::ApiToken => user.session.session_id,
        };
        state.sessions.destroy(&token).await?;
    }
    Ok((jar.remove(removal_cookie(SESSION_COOKIE)), StatusCode::NO_CONTENT))
}

/// POST /auth/logout-all
async fn logout_all(
    State(state): State<Arc<AuthState>>,
    jar: CookieJar,
    user: CurrentUser,
) -> Result<(CookieJar, Json<RevokedResponse>), AuthError> {
    let revoked = state.sessions.destroy_all(&user.session.email).await?;
    Ok((
        jar.remove(removal_cookie(SESSION_COOKIE)),
        Json(RevokedResponse { revoked }),
    ))
}

/// POST /auth/refresh
///
/// Resolving the session already slid its TTL forward, so there is nothing
/// left to do beyond confirming.
async fn refresh(user: CurrentUser) -> Json<StatusResponse> {
    Json(StatusResponse {
        authenticated: true,
        user: Some(UserInfo::from(&user.session)),
    })
}

/// GET /api/auth/check — cheap probe for page glue.
async fn check(user: Option<CurrentUser>) -> impl IntoResponse {
    match user {
        Some(_) => (StatusCode::OK, Json(CheckResponse { authenticated: true })),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(CheckResponse {
                authenticated: false,
            }),
        ),
    }
}
