use std::time::Duration;

use url::Url;

/// Google OIDC endpoints used when nothing else is configured.
pub const DEFAULT_ISSUER: &str = "https://accounts.google.com";
pub const DEFAULT_AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// Configuration for the authentication subsystem.
///
/// Built once at startup and injected into every component; there is no
/// process-global configuration.
///
/// # Example
///
/// ```ignore
/// let config = AuthConfig::new(client_id, client_secret)
///     .with_frontend_url("https://tasks.example.com")
///     .with_backend_url("https://api.tasks.example.com")
///     .with_workspace_domain("example.com");
/// ```
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// OAuth client id registered with the identity provider.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Expected `iss` claim.
    pub issuer: String,
    /// Provider authorization endpoint (browser redirect target).
    pub authorize_endpoint: String,
    /// Provider token endpoint (code-for-token exchange).
    pub token_endpoint: String,
    /// Provider JWKS endpoint.
    pub jwks_url: String,
    /// How long fetched JWKS keys stay fresh.
    pub jwks_cache_ttl: Duration,
    /// Minimum interval between JWKS refresh attempts.
    pub jwks_min_refresh_interval: Duration,
    /// Workspace domain users must belong to, when restriction is on.
    pub workspace_domain: Option<String>,
    /// Whether the hosted-domain restriction is enforced.
    pub require_workspace_domain: bool,
    /// Base URL the browser lands on after login.
    pub frontend_url: String,
    /// Base URL this service is reachable at (builds the redirect URI).
    pub backend_url: String,
    /// Session lifetime; also the API token lifetime.
    pub session_ttl: Duration,
    /// Bridge token lifetime.
    pub bridge_ttl: Duration,
    /// Maximum age of a login flow before its callback is rejected.
    pub flow_deadline: Duration,
    /// Secret signing the cookie-only fallback sessions.
    pub cookie_secret: String,
    /// Whether session cookies are marked `Secure` (off for local dev).
    pub secure_cookies: bool,
}

impl AuthConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            issuer: DEFAULT_ISSUER.to_string(),
            authorize_endpoint: DEFAULT_AUTHORIZE_ENDPOINT.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            jwks_url: DEFAULT_JWKS_URL.to_string(),
            jwks_cache_ttl: Duration::from_secs(3600),
            jwks_min_refresh_interval: Duration::from_secs(30),
            workspace_domain: None,
            require_workspace_domain: false,
            frontend_url: "http://localhost:3000".to_string(),
            backend_url: "http://localhost:8080".to_string(),
            session_ttl: Duration::from_secs(24 * 3600),
            bridge_ttl: Duration::from_secs(300),
            flow_deadline: Duration::from_secs(600),
            cookie_secret: String::new(),
            secure_cookies: true,
        }
    }

    /// Restrict logins to one hosted workspace domain.
    pub fn with_workspace_domain(mut self, domain: impl Into<String>) -> Self {
        self.workspace_domain = Some(domain.into());
        self.require_workspace_domain = true;
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    pub fn with_jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks_url = url.into();
        self
    }

    pub fn with_frontend_url(mut self, url: impl Into<String>) -> Self {
        self.frontend_url = trim_trailing_slash(url.into());
        self
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = trim_trailing_slash(url.into());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_bridge_ttl(mut self, ttl: Duration) -> Self {
        self.bridge_ttl = ttl;
        self
    }

    pub fn with_flow_deadline(mut self, deadline: Duration) -> Self {
        self.flow_deadline = deadline;
        self
    }

    pub fn with_cookie_secret(mut self, secret: impl Into<String>) -> Self {
        self.cookie_secret = secret.into();
        self
    }

    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    /// The callback URL registered with the provider.
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth/callback", self.backend_url)
    }

    /// The domain restriction, when enforcement is on.
    pub fn restricted_domain(&self) -> Option<&str> {
        if self.require_workspace_domain {
            self.workspace_domain.as_deref()
        } else {
            None
        }
    }

    /// Whether `target` is a safe post-login redirect destination.
    ///
    /// Relative paths are safe; absolute URLs must share the frontend's
    /// origin. Everything else is an open-redirect vector and is dropped
    /// in favor of the default landing page.
    pub fn is_safe_url(&self, target: &str) -> bool {
        if target.starts_with('/') && !target.starts_with("//") {
            return true;
        }
        let (Ok(target), Ok(frontend)) = (Url::parse(target), Url::parse(&self.frontend_url))
        else {
            return false;
        };
        target.scheme() == frontend.scheme()
            && target.host_str() == frontend.host_str()
            && target.port_or_known_default() == frontend.port_or_known_default()
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}
