use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, OptionalFromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use taskgate_auth::{
    AuthError, AuthState, CookieFlows, CookieSessions, CurrentUser, FlowStateBackend,
    HttpCodeExchanger, IdTokenVerifier, JwksCache, SessionBackend, StoreFlows, StoreSessions,
};
use taskgate_rate_limit::{Quota, RateLimiter};
use taskgate_security::{cors_layer, security_middleware, SecurityPolicy};
use taskgate_store::{InMemoryStore, KvStore};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::ServerConfig;

/// Shared state for the rate-limit middleware.
struct RateLimitCtx {
    limiter: RateLimiter,
    default_quota: Quota,
    login_quota: Quota,
    auth: Arc<AuthState>,
}

fn client_ip(parts: &Parts) -> String {
    if let Some(forwarded) = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return forwarded.trim().to_string();
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fixed-window quota check on every request.
///
/// Authenticated callers are keyed by email so one user cannot starve
/// another behind the same NAT; anonymous callers are keyed by client IP.
/// The login route carries its own, much tighter quota.
async fn rate_limit(
    State(ctx): State<Arc<RateLimitCtx>>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let caller = match <CurrentUser as OptionalFromRequestParts<Arc<AuthState>>>::from_request_parts(
        &mut parts, &ctx.auth,
    )
    .await
    {
        Ok(Some(user)) => user.session.email,
        _ => client_ip(&parts),
    };

    let (name, quota) = if parts.uri.path() == "/auth/login" {
        ("login", ctx.login_quota)
    } else {
        ("default", ctx.default_quota)
    };

    if !ctx.limiter.allow(name, &caller, quota).await {
        return AuthError::RateLimited.into_response();
    }

    next.run(Request::from_parts(parts, body)).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl-C");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env()?;

    let store: Arc<dyn KvStore> = match config.store_url.as_str() {
        "memory://" => Arc::new(InMemoryStore::new()),
        other => {
            return Err(format!(
                "unsupported TASKGATE_STORE_URL {other:?}: only memory:// is built in"
            )
            .into())
        }
    };

    // Degraded mode: an unreachable store at startup falls back to signed
    // cookies for both sessions and pre-auth flow state, so login still
    // completes rather than the process refusing to start.
    let (sessions, flows): (Arc<dyn SessionBackend>, Arc<dyn FlowStateBackend>) =
        match store.ping().await {
            Ok(()) => (
                Arc::new(StoreSessions::new(store.clone(), config.auth.session_ttl)),
                Arc::new(StoreFlows::new(store.clone(), config.auth.flow_deadline)),
            ),
            Err(e) => {
                warn!(error = %e, "shared store unavailable, using cookie-only sessions (non-durable, single-instance)");
                if config.auth.cookie_secret.is_empty() {
                    return Err(
                        "TASKGATE_COOKIE_SECRET must be set for cookie-only session mode".into(),
                    );
                }
                (
                    Arc::new(CookieSessions::new(
                        &config.auth.cookie_secret,
                        config.auth.session_ttl,
                    )),
                    Arc::new(CookieFlows::new(
                        &config.auth.cookie_secret,
                        config.auth.flow_deadline,
                    )),
                )
            }
        };

    let auth_config = Arc::new(config.auth.clone());
    let jwks = Arc::new(JwksCache::new(&auth_config)?);
    let verifier = Arc::new(IdTokenVerifier::new(jwks, &auth_config));
    let exchanger = Arc::new(HttpCodeExchanger::new(&auth_config)?);

    let auth_state = Arc::new(AuthState::with_flows(
        auth_config.clone(),
        store.clone(),
        verifier,
        exchanger,
        sessions,
        flows,
    ));

    let rate_ctx = Arc::new(RateLimitCtx {
        limiter: RateLimiter::new(store),
        default_quota: Quota::parse("100 per hour").ok_or("bad default quota")?,
        login_quota: Quota::parse("10 per hour").ok_or("bad login quota")?,
        auth: auth_state.clone(),
    });

    let policy = Arc::new(SecurityPolicy::default().with_connect_src(&auth_config.frontend_url));
    let cors = cors_layer(&auth_config.frontend_url)
        .map_err(|e| format!("TASKGATE_FRONTEND_URL is not a valid CORS origin: {e}"))?;

    let app = taskgate_auth::router(auth_state)
        .layer(middleware::from_fn_with_state(rate_ctx, rate_limit))
        .layer(middleware::from_fn_with_state(policy, security_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "taskgate listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("taskgate stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}
