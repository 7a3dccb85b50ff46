//! OAuth2/OpenID-Connect login, sessions and token exchange for taskgate.
//!
//! The pieces compose leaves-first: pre-auth flow state lives behind the
//! [`FlowStateBackend`] trait (built on [`OneTimeTokens`]), the
//! [`IdTokenVerifier`] feeds the [`OAuthFlow`] controller, sessions live
//! behind the [`SessionBackend`] trait, and [`TokenExchange`] moves an
//! established identity across the frontend's origin boundary. The HTTP
//! surface in [`handlers`] wires them into an axum router, and
//! [`CurrentUser`] is the request guard everything downstream consumes.
//!
//! # Example
//!
//! ```ignore
//! let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
//! let jwks = Arc::new(JwksCache::new(&config)?);
//! let verifier = Arc::new(IdTokenVerifier::new(jwks, &config));
//! let exchanger = Arc::new(HttpCodeExchanger::new(&config)?);
//! let sessions: Arc<dyn SessionBackend> =
//!     Arc::new(StoreSessions::new(store.clone(), config.session_ttl));
//!
//! let state = Arc::new(AuthState::new(config, store, verifier, exchanger, sessions));
//! let app = taskgate_auth::router(state);
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

pub mod config;
pub mod csrf;
pub mod error;
pub mod exchange;
pub mod extractor;
pub mod flow;
pub mod flow_state;
pub mod handlers;
pub mod jwks;
pub mod provider;
pub mod session;
pub mod verify;

pub use config::AuthConfig;
pub use csrf::OneTimeTokens;
pub use error::{AuthError, Reason};
pub use exchange::{TokenExchange, TokenRecord};
pub use extractor::{AuthMethod, CurrentUser};
pub use flow::{CallbackOutcome, CallbackParams, ClientMeta, LoginOutcome, OAuthFlow};
pub use flow_state::{CookieFlows, FlowRecord, FlowStateBackend, FlowTicket, StoreFlows};
pub use handlers::{router, AuthState};
pub use jwks::JwksCache;
pub use provider::{AuthCodeExchanger, HttpCodeExchanger, ProviderTokens};
pub use session::{CookieSessions, NewSession, Session, SessionBackend, StoreSessions};
pub use verify::{IdTokenClaims, IdTokenVerifier};

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "tg_session";

/// Name of the pre-auth flow cookie. Carries a random flow id under
/// [`StoreFlows`], or the whole signed flow record under [`CookieFlows`].
pub const FLOW_COOKIE: &str = "tg_flow";

/// URL-safe base64 of `bytes` cryptographically random bytes.
pub(crate) fn random_urlsafe(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
