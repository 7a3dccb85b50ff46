use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::exchange::TokenExchange;
use crate::flow_state::FlowStateBackend;
use crate::provider::AuthCodeExchanger;
use crate::session::{NewSession, Session, SessionBackend};
use crate::verify::IdTokenVerifier;

/// Query parameters of the provider callback.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Client metadata recorded on the session.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Result of a completed callback: where to send the browser, and the
/// session token for the cookie.
pub struct CallbackOutcome {
    pub redirect: String,
    pub session_token: String,
    pub session: Session,
}

/// Result of an opened flow: what the pre-auth cookie carries, and the
/// provider authorization URL.
pub struct LoginOutcome {
    pub flow_cookie: String,
    pub authorize_url: String,
}

/// Drives the login flow from the first redirect to an established
/// session.
///
/// Before the callback verifies, the only state is what the flow backend
/// holds for this browser: the issued state and nonce values and the
/// remembered destination. A session exists only after the ID token has
/// passed every check and the nonce has matched.
pub struct OAuthFlow {
    config: Arc<AuthConfig>,
    flows: Arc<dyn FlowStateBackend>,
    verifier: Arc<IdTokenVerifier>,
    exchanger: Arc<dyn AuthCodeExchanger>,
    sessions: Arc<dyn SessionBackend>,
    exchange: Arc<TokenExchange>,
}

impl OAuthFlow {
    pub fn new(
        config: Arc<AuthConfig>,
        flows: Arc<dyn FlowStateBackend>,
        verifier: Arc<IdTokenVerifier>,
        exchanger: Arc<dyn AuthCodeExchanger>,
        sessions: Arc<dyn SessionBackend>,
        exchange: Arc<TokenExchange>,
    ) -> Self {
        Self {
            config,
            flows,
            verifier,
            exchanger,
            sessions,
            exchange,
        }
    }

    /// Start the flow: open a flow record with fresh state and nonce,
    /// remember where the user was going, and build the provider
    /// authorization URL.
    pub async fn login(&self, next: Option<&str>) -> Result<LoginOutcome, AuthError> {
        let next = match next {
            Some(next) if self.config.is_safe_url(next) => Some(next),
            Some(next) => {
                warn!(target = %next, "dropping unsafe post-login destination");
                None
            }
            None => None,
        };

        let ticket = self.flows.begin(next).await?;

        let mut url = Url::parse(&self.config.authorize_endpoint)
            .map_err(|e| AuthError::Provider(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_uri())
                .append_pair("scope", "openid email profile")
                .append_pair("state", &ticket.state)
                .append_pair("nonce", &ticket.nonce)
                .append_pair("access_type", "online")
                .append_pair("prompt", "select_account");
            if let Some(domain) = self.config.restricted_domain() {
                query.append_pair("hd", domain);
            }
        }

        debug!("login flow initiated");
        Ok(LoginOutcome {
            flow_cookie: ticket.cookie_value,
            authorize_url: url.into(),
        })
    }

    /// Complete the flow: consume the flow record, check state, exchange
    /// the code, verify the ID token and its nonce, establish a session,
    /// and mint a bridge token.
    pub async fn callback(
        &self,
        flow_cookie: &str,
        params: CallbackParams,
        meta: ClientMeta,
    ) -> Result<CallbackOutcome, AuthError> {
        if let Some(error) = params.error {
            warn!(provider_error = %error, "provider returned an error callback");
            return Err(AuthError::Denied(error));
        }

        let state = params.state.ok_or(AuthError::CsrfMismatch)?;
        let record = self.flows.consume(flow_cookie, &state).await?;

        let code = params
            .code
            .ok_or_else(|| AuthError::Denied("callback without authorization code".to_string()))?;

        let tokens = self
            .exchanger
            .exchange(&code, &self.config.redirect_uri())
            .await?;

        let claims = self.verifier.verify(&tokens.id_token).await?;

        let nonce = claims.nonce.as_deref().ok_or_else(|| {
            warn!("verified ID token carries no nonce");
            AuthError::CsrfMismatch
        })?;
        if !bool::from(record.nonce.as_bytes().ct_eq(nonce.as_bytes())) {
            warn!("ID token nonce does not match the issued one");
            return Err(AuthError::CsrfMismatch);
        }

        let (session_token, session) = self
            .sessions
            .create(NewSession {
                user_id: claims.sub,
                email: claims.email,
                display_name: claims.name,
                avatar_url: claims.picture,
                workspace_domain: claims.hd,
                client_ip: meta.ip,
                user_agent: meta.user_agent,
            })
            .await?;

        // With the store down the session cookie still works; only the
        // frontend's token exchange is lost until the store returns.
        let bridge = match self
            .exchange
            .issue_bridge(&session.session_id, &session.email)
            .await
        {
            Ok(bridge) => Some(bridge),
            Err(AuthError::StoreUnavailable(e)) => {
                warn!(error = %e, "store down, completing login without a bridge token");
                None
            }
            Err(e) => return Err(e),
        };

        let redirect = self.redirect_target(record.next, bridge.as_deref());
        info!(email = %session.email, "login completed");

        Ok(CallbackOutcome {
            redirect,
            session_token,
            session,
        })
    }

    /// Build the post-login redirect: the remembered destination when it is
    /// same-origin safe, else the frontend's landing page, with the bridge
    /// token attached.
    fn redirect_target(&self, next: Option<String>, bridge: Option<&str>) -> String {
        let base = match next {
            Some(next) if self.config.is_safe_url(&next) => {
                if next.starts_with('/') {
                    format!("{}{}", self.config.frontend_url, next)
                } else {
                    next
                }
            }
            _ => self.config.frontend_url.clone(),
        };

        match Url::parse(&base) {
            Ok(mut url) => {
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("auth", "success");
                    if let Some(bridge) = bridge {
                        query.append_pair("token", bridge);
                    }
                }
                url.into()
            }
            Err(_) => {
                let sep = if base.contains('?') { '&' } else { '?' };
                match bridge {
                    Some(bridge) => format!("{base}{sep}auth=success&token={bridge}"),
                    None => format!("{base}{sep}auth=success"),
                }
            }
        }
    }
}
