use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::AuthError;

/// Tokens returned by the provider's code-for-token exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub id_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Server-to-server exchange of an authorization code for provider tokens.
///
/// A trait so tests can drive the flow without network access.
pub trait AuthCodeExchanger: Send + Sync + 'static {
    fn exchange<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderTokens, AuthError>> + Send + 'a>>;
}

/// Production exchanger calling the provider's token endpoint.
///
/// One attempt, 10 second timeout, no retries: a failed exchange surfaces
/// as a rejected login and the browser re-initiates the flow.
pub struct HttpCodeExchanger {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
}

impl HttpCodeExchanger {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        Ok(Self {
            client,
            token_endpoint: config.token_endpoint.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        })
    }
}

impl AuthCodeExchanger for HttpCodeExchanger {
    fn exchange<'a>(
        &'a self,
        code: &'a str,
        redirect_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderTokens, AuthError>> + Send + 'a>> {
        Box::pin(async move {
            let params = [
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", redirect_uri),
            ];

            let response = self
                .client
                .post(&self.token_endpoint)
                .form(&params)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "token endpoint unreachable");
                    AuthError::Provider(e.to_string())
                })?;

            if !response.status().is_success() {
                warn!(status = %response.status(), "token endpoint refused the code");
                return Err(AuthError::Provider(format!(
                    "token endpoint returned {}",
                    response.status()
                )));
            }

            response.json::<ProviderTokens>().await.map_err(|e| {
                warn!(error = %e, "unreadable token endpoint response");
                AuthError::Provider(e.to_string())
            })
        })
    }
}
