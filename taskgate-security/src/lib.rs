//! Security middleware for taskgate.
//!
//! Runs on every request, authenticated or not. Before the handler:
//! oversized bodies are refused, mutating requests must carry a JSON or
//! multipart body, and query values plus the `User-Agent` header are
//! screened against a small deny-list of known attack signatures. Request
//! bodies themselves are not parsed or scanned. After the handler: a fixed
//! set of security response headers is injected, any server-identifying
//! header is stripped, and the request's correlation id is stamped for
//! audit logs.
//!
//! [`cors_layer`] complements the middleware with the credentialed CORS
//! configuration the cross-origin frontend needs.
//!
//! ```ignore
//! let policy = Arc::new(SecurityPolicy::default());
//! let app = Router::new()
//!     .merge(auth_routes)
//!     .layer(middleware::from_fn_with_state(policy, security_middleware))
//!     .layer(cors_layer(&frontend_url)?);
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::InvalidHeaderValue;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Substrings that mark a request as hostile when found in a query value.
/// Matched case-insensitively against the percent-decoded value.
const SUSPICIOUS_PATTERNS: &[&str] = &[
    "union select",
    "drop table",
    "<script",
    "javascript:",
    "../",
    "..\\",
    "%00",
    "\0",
    "base64,",
    "onerror=",
    "onclick=",
];

/// User-Agent fragments of known scanners.
const SUSPICIOUS_AGENTS: &[&str] = &["sqlmap", "nikto", "nessus", "metasploit", "burp"];

/// Content types accepted on mutating methods.
const ALLOWED_MUTATING_TYPES: &[&str] = &["application/json", "multipart/form-data"];

/// Correlation id attached to each request, readable from request extensions.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Tunable knobs for the middleware.
#[derive(Clone, Debug)]
pub struct SecurityPolicy {
    /// Requests with a larger declared body are refused with 413.
    pub max_body_bytes: u64,
    /// Extra origin allowed in the CSP `connect-src` directive
    /// (the backend base URL when frontend and backend differ).
    pub connect_src: Option<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_body_bytes: 16 * 1024 * 1024,
            connect_src: None,
        }
    }
}

impl SecurityPolicy {
    pub fn with_max_body_bytes(mut self, bytes: u64) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn with_connect_src(mut self, origin: impl Into<String>) -> Self {
        self.connect_src = Some(origin.into());
        self
    }

    fn content_security_policy(&self) -> String {
        let connect = match &self.connect_src {
            Some(origin) => format!("'self' {origin}"),
            None => "'self'".to_string(),
        };
        format!(
            "default-src 'self'; script-src 'self'; style-src 'self'; \
             img-src 'self' data: https:; font-src 'self' data:; \
             connect-src {connect}; frame-ancestors 'none';"
        )
    }
}

/// CORS for the frontend origin: credentialed, restricted to that one
/// origin, with the methods and headers the auth endpoints accept.
///
/// Credentialed responses cannot use a wildcard origin, so the origin is
/// pinned at construction.
pub fn cors_layer(frontend_origin: &str) -> Result<CorsLayer, InvalidHeaderValue> {
    let origin: HeaderValue = frontend_origin.parse()?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600)))
}

/// The full before/after security wrap. Install with
/// `axum::middleware::from_fn_with_state`.
pub async fn security_middleware(
    State(policy): State<Arc<SecurityPolicy>>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    info!(
        method = %req.method(),
        path = %req.uri().path(),
        request_id = %request_id,
        "request"
    );

    if let Err(rejection) = screen_request(&policy, &req, &request_id) {
        return finalize(&policy, &request_id, rejection);
    }

    let response = next.run(req).await;
    finalize(&policy, &request_id, response)
}

/// Pre-handler checks. Returns the rejection response on refusal.
fn screen_request(
    policy: &SecurityPolicy,
    req: &Request,
    request_id: &str,
) -> Result<(), Response> {
    if declared_length(req).is_some_and(|len| len > policy.max_body_bytes) {
        warn!(request_id = %request_id, "request body over size ceiling");
        return Err(reject(StatusCode::PAYLOAD_TOO_LARGE, "Request too large"));
    }

    if is_mutating(req.method()) {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !ALLOWED_MUTATING_TYPES
            .iter()
            .any(|allowed| content_type.starts_with(allowed))
        {
            warn!(request_id = %request_id, content_type = %content_type, "unexpected content type");
            return Err(reject(StatusCode::BAD_REQUEST, "Invalid content type"));
        }
    }

    if let Some(query) = req.uri().query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if contains_suspicious_pattern(&value) || contains_suspicious_pattern(&key) {
                warn!(request_id = %request_id, param = %key, "suspicious pattern in query");
                return Err(reject(StatusCode::BAD_REQUEST, "Invalid request"));
            }
        }
    }

    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let agent_lower = user_agent.to_ascii_lowercase();
    if SUSPICIOUS_AGENTS.iter().any(|a| agent_lower.contains(a)) {
        warn!(request_id = %request_id, user_agent = %user_agent, "scanner user agent blocked");
        return Err(reject(StatusCode::BAD_REQUEST, "Invalid request"));
    }

    Ok(())
}

/// Post-handler header injection.
fn finalize(policy: &SecurityPolicy, request_id: &str, mut response: Response) -> Response {
    let headers = response.headers_mut();

    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    if let Ok(csp) = HeaderValue::from_str(&policy.content_security_policy()) {
        headers.insert(header::CONTENT_SECURITY_POLICY, csp);
    }

    headers.remove(header::SERVER);

    if let Ok(id) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), id);
    }

    response
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn declared_length(req: &Request) -> Option<u64> {
    req.headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn contains_suspicious_pattern(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    SUSPICIOUS_PATTERNS.iter().any(|p| lower.contains(p))
}
