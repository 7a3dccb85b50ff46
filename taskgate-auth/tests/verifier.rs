use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use taskgate_auth::{AuthConfig, AuthError, IdTokenClaims, IdTokenVerifier, Reason};

const SECRET: &str = "verifier-test-secret";
const CLIENT_ID: &str = "taskgate-client";
const ISSUER: &str = "https://accounts.google.com";

fn config() -> AuthConfig {
    AuthConfig::new(CLIENT_ID, "unused").with_workspace_domain("example.com")
}

fn verifier(config: &AuthConfig) -> IdTokenVerifier {
    IdTokenVerifier::new_with_static_key(DecodingKey::from_secret(SECRET.as_bytes()), config)
        .with_algorithms(vec![Algorithm::HS256])
}

fn claims() -> IdTokenClaims {
    let now = Utc::now().timestamp() as u64;
    IdTokenClaims {
        iss: ISSUER.to_string(),
        aud: CLIENT_ID.to_string(),
        sub: "1234567890".to_string(),
        email: "user@example.com".to_string(),
        email_verified: true,
        hd: Some("example.com".to_string()),
        name: Some("Test User".to_string()),
        picture: None,
        nonce: Some("nonce-value".to_string()),
        exp: now + 300,
        iat: now,
    }
}

fn sign(claims: &IdTokenClaims) -> String {
    sign_with(claims, SECRET)
}

fn sign_with(claims: &IdTokenClaims, secret: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn reason(err: AuthError) -> Reason {
    match err {
        AuthError::TokenInvalid(reason) => reason,
        other => panic!("expected TokenInvalid, got {other}"),
    }
}

#[tokio::test]
async fn valid_token_yields_claims() {
    let config = config();
    let verified = verifier(&config).verify(&sign(&claims())).await.unwrap();
    assert_eq!(verified.email, "user@example.com");
    assert_eq!(verified.sub, "1234567890");
    assert_eq!(verified.nonce.as_deref(), Some("nonce-value"));
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let config = config();
    let mut claims = claims();
    claims.exp = Utc::now().timestamp() as u64 - 60;
    let err = verifier(&config).verify(&sign(&claims)).await.unwrap_err();
    assert_eq!(reason(err), Reason::Expired);
}

#[tokio::test]
async fn expiry_within_leeway_is_accepted() {
    let config = config();
    let mut claims = claims();
    claims.exp = Utc::now().timestamp() as u64 - 5;
    assert!(verifier(&config).verify(&sign(&claims)).await.is_ok());
}

#[tokio::test]
async fn wrong_issuer_is_rejected() {
    let config = config();
    let mut claims = claims();
    claims.iss = "https://evil.example.net".to_string();
    let err = verifier(&config).verify(&sign(&claims)).await.unwrap_err();
    assert_eq!(reason(err), Reason::BadIssuer);
}

#[tokio::test]
async fn wrong_audience_is_rejected() {
    let config = config();
    let mut claims = claims();
    claims.aud = "someone-else".to_string();
    let err = verifier(&config).verify(&sign(&claims)).await.unwrap_err();
    assert_eq!(reason(err), Reason::BadAudience);
}

#[tokio::test]
async fn wrong_hosted_domain_is_rejected() {
    let config = config();
    let mut claims = claims();
    claims.hd = Some("evil.example.net".to_string());
    let err = verifier(&config).verify(&sign(&claims)).await.unwrap_err();
    assert_eq!(reason(err), Reason::BadDomain);
}

#[tokio::test]
async fn email_outside_domain_is_rejected_even_with_matching_hd() {
    let config = config();
    let mut claims = claims();
    claims.email = "user@evil.example.net".to_string();
    let err = verifier(&config).verify(&sign(&claims)).await.unwrap_err();
    assert_eq!(reason(err), Reason::BadDomain);
}

#[tokio::test]
async fn missing_hd_is_rejected_when_restricted() {
    let config = config();
    let mut claims = claims();
    claims.hd = None;
    let err = verifier(&config).verify(&sign(&claims)).await.unwrap_err();
    assert_eq!(reason(err), Reason::BadDomain);
}

#[tokio::test]
async fn domain_is_not_checked_when_unrestricted() {
    let config = AuthConfig::new(CLIENT_ID, "unused");
    let mut claims = claims();
    claims.hd = None;
    claims.email = "user@anywhere.example.org".to_string();
    assert!(verifier(&config).verify(&sign(&claims)).await.is_ok());
}

#[tokio::test]
async fn unverified_email_is_rejected() {
    let config = config();
    let mut claims = claims();
    claims.email_verified = false;
    let err = verifier(&config).verify(&sign(&claims)).await.unwrap_err();
    assert_eq!(reason(err), Reason::UnverifiedEmail);
}

#[tokio::test]
async fn wrong_signature_is_rejected() {
    let config = config();
    let token = sign_with(&claims(), "a-different-secret");
    let err = verifier(&config).verify(&token).await.unwrap_err();
    assert_eq!(reason(err), Reason::BadSignature);
}

#[tokio::test]
async fn garbage_token_is_rejected() {
    let config = config();
    let err = verifier(&config).verify("not-a-jwt").await.unwrap_err();
    assert_eq!(reason(err), Reason::BadSignature);
}
