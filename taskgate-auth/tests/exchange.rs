use std::sync::Arc;
use std::time::Duration;

use taskgate_auth::{NewSession, SessionBackend, StoreSessions, TokenExchange};
use taskgate_store::{InMemoryStore, KvStore};

fn new_session(email: &str) -> NewSession {
    NewSession {
        user_id: "sub-1".to_string(),
        email: email.to_string(),
        display_name: None,
        avatar_url: None,
        workspace_domain: None,
        client_ip: None,
        user_agent: None,
    }
}

struct Fixture {
    sessions: StoreSessions,
    exchange: TokenExchange,
}

fn fixture() -> Fixture {
    fixture_with_api_ttl(Duration::from_secs(3600))
}

fn fixture_with_api_ttl(api_ttl: Duration) -> Fixture {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    Fixture {
        sessions: StoreSessions::new(store.clone(), Duration::from_secs(3600)),
        exchange: TokenExchange::new(store, Duration::from_secs(300), api_ttl),
    }
}

#[tokio::test]
async fn bridge_token_is_single_use() {
    let f = fixture();
    let (_, session) = f.sessions.create(new_session("a@example.com")).await.unwrap();

    let bridge = f
        .exchange
        .issue_bridge(&session.session_id, &session.email)
        .await
        .unwrap();

    let record = f.exchange.redeem_bridge(&bridge).await.unwrap().unwrap();
    assert_eq!(record.session_id, session.session_id);
    assert_eq!(record.email, "a@example.com");

    assert!(f.exchange.redeem_bridge(&bridge).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_bridge_token_is_invalid() {
    let f = fixture();
    assert!(f
        .exchange
        .redeem_bridge("never-issued")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn api_token_resolves_to_the_live_session() {
    let f = fixture();
    let (_, session) = f.sessions.create(new_session("a@example.com")).await.unwrap();

    let api = f
        .exchange
        .mint_api_token(&session.session_id, &session.email)
        .await
        .unwrap();

    let resolved = f
        .exchange
        .validate_api_token(&api, &f.sessions)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.session_id, session.session_id);
}

#[tokio::test]
async fn api_token_dies_with_its_session() {
    let f = fixture();
    let (token, session) = f.sessions.create(new_session("a@example.com")).await.unwrap();

    let api = f
        .exchange
        .mint_api_token(&session.session_id, &session.email)
        .await
        .unwrap();

    f.sessions.destroy(&token).await.unwrap();

    // The token's own TTL has not expired, but the backing session is gone.
    assert!(f
        .exchange
        .validate_api_token(&api, &f.sessions)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn api_token_ttl_slides_on_validation() {
    let f = fixture_with_api_ttl(Duration::from_millis(500));
    let (_, session) = f.sessions.create(new_session("a@example.com")).await.unwrap();

    let api = f
        .exchange
        .mint_api_token(&session.session_id, &session.email)
        .await
        .unwrap();

    // Two validations 300ms apart: without the sliding refresh the second
    // would land past the 500ms TTL.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(f
        .exchange
        .validate_api_token(&api, &f.sessions)
        .await
        .unwrap()
        .is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(f
        .exchange
        .validate_api_token(&api, &f.sessions)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn logout_all_revokes_every_session_for_one_user_only() {
    let f = fixture();
    let (token_a1, _) = f.sessions.create(new_session("a@example.com")).await.unwrap();
    let (token_a2, _) = f.sessions.create(new_session("a@example.com")).await.unwrap();
    let (token_b, _) = f.sessions.create(new_session("b@example.com")).await.unwrap();

    let revoked = f.sessions.destroy_all("a@example.com").await.unwrap();
    assert_eq!(revoked, 2);

    assert!(f.sessions.get(&token_a1).await.unwrap().is_none());
    assert!(f.sessions.get(&token_a2).await.unwrap().is_none());
    assert!(f.sessions.get(&token_b).await.unwrap().is_some());
}

#[tokio::test]
async fn logout_all_invalidates_api_tokens_through_the_session() {
    let f = fixture();
    let (_, session) = f.sessions.create(new_session("a@example.com")).await.unwrap();
    let api = f
        .exchange
        .mint_api_token(&session.session_id, &session.email)
        .await
        .unwrap();

    f.sessions.destroy_all("a@example.com").await.unwrap();

    assert!(f
        .exchange
        .validate_api_token(&api, &f.sessions)
        .await
        .unwrap()
        .is_none());
}
