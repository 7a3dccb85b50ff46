use std::env;
use std::time::Duration;

use taskgate_auth::AuthConfig;

/// A required environment variable was missing or malformed.
#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing environment variable {name}"),
            ConfigError::Invalid(name, value) => {
                write!(f, "invalid value for {name}: {value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything the binary reads from the environment, once, at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub auth: AuthConfig,
    pub store_url: String,
    pub bind_addr: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(name, value.to_string())),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = required("TASKGATE_CLIENT_ID")?;
        let client_secret = required("TASKGATE_CLIENT_SECRET")?;

        let mut auth = AuthConfig::new(client_id, client_secret);

        if let Some(domain) = optional("TASKGATE_WORKSPACE_DOMAIN") {
            auth = auth.with_workspace_domain(domain);
        }
        if let Some(value) = optional("TASKGATE_REQUIRE_WORKSPACE_DOMAIN") {
            auth.require_workspace_domain =
                parse_bool("TASKGATE_REQUIRE_WORKSPACE_DOMAIN", &value)?;
        }
        if let Some(url) = optional("TASKGATE_FRONTEND_URL") {
            auth = auth.with_frontend_url(url);
        }
        if let Some(url) = optional("TASKGATE_BACKEND_URL") {
            auth = auth.with_backend_url(url);
        }
        if let Some(value) = optional("TASKGATE_SESSION_TTL_SECS") {
            let secs: u64 = value
                .parse()
                .map_err(|_| ConfigError::Invalid("TASKGATE_SESSION_TTL_SECS", value))?;
            auth = auth.with_session_ttl(Duration::from_secs(secs));
        }
        if let Some(secret) = optional("TASKGATE_COOKIE_SECRET") {
            auth = auth.with_cookie_secret(secret);
        }

        // Local HTTP deployments cannot set Secure cookies; everything else
        // must.
        let secure_default = !auth.backend_url.starts_with("http://");
        let secure = match optional("TASKGATE_SECURE_COOKIES") {
            Some(value) => parse_bool("TASKGATE_SECURE_COOKIES", &value)?,
            None => secure_default,
        };
        auth = auth.with_secure_cookies(secure);

        Ok(Self {
            auth,
            store_url: optional("TASKGATE_STORE_URL").unwrap_or_else(|| "memory://".to_string()),
            bind_addr: optional("TASKGATE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }
}
