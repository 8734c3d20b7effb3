//! Push-endpoint identity verification.
//!
//! The backend signs each push delivery with an ID token in the
//! `Authorization: Bearer` header. The token must verify and carry the
//! configured service-account email and audience.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::PushRequest;
use crate::{Error, Result};

/// Google's public signing keys for ID tokens.
pub const GOOGLE_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// Issuers Google uses for ID tokens.
pub const GOOGLE_ISSUERS: &[&str] = &["accounts.google.com", "https://accounts.google.com"];

/// Verified token subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Service-account email the token was issued to.
    pub email: String,
    /// Audience the token was minted for.
    pub audience: String,
}

/// Verifies a bearer token and extracts its identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token`. Any failure is [`Error::Forbidden`].
    async fn verify(&self, token: &str) -> Result<Identity>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    email: Option<String>,
    aud: AudienceClaim,
}

impl IdTokenClaims {
    fn into_identity(self) -> Result<Identity> {
        let audience = match self.aud {
            AudienceClaim::One(aud) => aud,
            AudienceClaim::Many(auds) => auds.into_iter().next().unwrap_or_default(),
        };
        let email = self
            .email
            .ok_or_else(|| Error::Forbidden("token has no email claim".to_string()))?;

        Ok(Identity { email, audience })
    }
}

fn forbidden(e: impl std::fmt::Display) -> Error {
    Error::Forbidden(e.to_string())
}

/// Minimum time between two JWKS fetches triggered by unknown key ids.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, Jwk>,
    last_refresh: Option<Instant>,
}

/// RS256 ID-token verifier backed by a cached JWKS.
///
/// A token whose `kid` is not cached triggers a JWKS refresh, at most once
/// per [`MIN_REFRESH_INTERVAL`].
#[derive(Clone)]
pub struct JwksVerifier {
    jwks_uri: String,
    issuers: Vec<String>,
    client: reqwest::Client,
    min_refresh_interval: Duration,
    cache: Arc<RwLock<KeyCache>>,
}

impl JwksVerifier {
    /// Verifier for Google-issued ID tokens.
    pub fn google() -> Self {
        Self::new(
            GOOGLE_JWKS_URI,
            GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Verifier for tokens from `issuers`, signed by keys at `jwks_uri`.
    pub fn new(jwks_uri: impl Into<String>, issuers: Vec<String>) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            issuers,
            client: reqwest::Client::new(),
            min_refresh_interval: MIN_REFRESH_INTERVAL,
            cache: Arc::new(RwLock::new(KeyCache::default())),
        }
    }

    /// Override the minimum interval between unknown-kid refreshes.
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    async fn get_jwk(&self, kid: &str) -> Result<Jwk> {
        if let Some(jwk) = self.cache.read().await.keys.get(kid) {
            return Ok(jwk.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(jwk) = cache.keys.get(kid) {
            return Ok(jwk.clone());
        }

        let recently_refreshed = cache
            .last_refresh
            .is_some_and(|at| at.elapsed() < self.min_refresh_interval);
        if recently_refreshed {
            debug!(kid, "Unknown kid, JWKS refreshed recently");
            return Err(forbidden(format!("no signing key with kid {}", kid)));
        }

        // Failed fetches count toward the interval too.
        cache.last_refresh = Some(Instant::now());
        cache.keys = self.fetch_keys().await?;

        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| forbidden(format!("no signing key with kid {}", kid)))
    }

    async fn fetch_keys(&self) -> Result<HashMap<String, Jwk>> {
        info!(jwks_uri = %self.jwks_uri, "Refreshing JWKS cache");

        let response = self
            .client
            .get(&self.jwks_uri)
            .send()
            .await
            .map_err(|e| {
                warn!(jwks_uri = %self.jwks_uri, error = %e, "JWKS request failed");
                forbidden(format!("cannot fetch signing keys: {}", e))
            })?;
        if !response.status().is_success() {
            return Err(forbidden(format!(
                "JWKS request to {} returned status {}",
                self.jwks_uri,
                response.status()
            )));
        }
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| forbidden(format!("invalid JWKS document: {}", e)))?;

        let keys: HashMap<String, Jwk> = jwks
            .keys
            .into_iter()
            .filter_map(|jwk| jwk.common.key_id.clone().map(|kid| (kid, jwk)))
            .collect();

        debug!(keys = keys.len(), "JWKS cache refreshed");
        Ok(keys)
    }

    /// Replace the cached key set with the one served at the JWKS URI.
    pub async fn refresh(&self) -> Result<()> {
        let keys = self.fetch_keys().await?;
        let mut cache = self.cache.write().await;
        cache.keys = keys;
        cache.last_refresh = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let header = decode_header(token).map_err(forbidden)?;
        let kid = header
            .kid
            .ok_or_else(|| forbidden("token header has no kid"))?;

        let jwk = self.get_jwk(&kid).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(forbidden)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&self.issuers);
        validation.validate_aud = false;

        let data = decode::<IdTokenClaims>(token, &key, &validation).map_err(|e| {
            warn!(error = %e, "ID token rejected");
            forbidden(e)
        })?;
        data.claims.into_identity()
    }
}

/// HS256 verifier for a shared secret, for emulators and local setups.
#[derive(Clone)]
pub struct SharedSecretVerifier {
    key: DecodingKey,
}

impl SharedSecretVerifier {
    /// Create a verifier for `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
        }
    }
}

#[async_trait]
impl TokenVerifier for SharedSecretVerifier {
    async fn verify(&self, token: &str) -> Result<Identity> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;

        let data = decode::<IdTokenClaims>(token, &self.key, &validation).map_err(forbidden)?;
        data.claims.into_identity()
    }
}

/// Checks push requests against the expected identity.
#[derive(Clone)]
pub struct PushAuthenticator {
    verifier: Arc<dyn TokenVerifier>,
    expected_email: String,
    expected_audience: String,
}

impl PushAuthenticator {
    /// Create an authenticator expecting `email` and `audience`.
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        email: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            expected_email: email.into(),
            expected_audience: audience.into(),
        }
    }

    /// Verify the `Authorization` header value.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Identity> {
        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| forbidden("missing bearer token"))?;

        let identity = self.verifier.verify(token).await?;
        if identity.email != self.expected_email || identity.audience != self.expected_audience {
            warn!(email = %identity.email, audience = %identity.audience, "Push token identity mismatch");
            return Err(forbidden("token email or audience does not match"));
        }

        Ok(identity)
    }

    /// Authenticate a push request and return its decoded message data.
    pub async fn read_push(&self, authorization: Option<&str>, body: &[u8]) -> Result<Vec<u8>> {
        self.authenticate(authorization).await?;
        let request: PushRequest = serde_json::from_slice(body)?;
        debug!(
            subscription = %request.subscription,
            message_id = request.message.message_id.as_deref().unwrap_or("-"),
            "Push request verified"
        );
        Ok(request.message.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"push-secret";

    fn token(email: &str, aud: &str) -> String {
        let claims = json!({
            "email": email,
            "aud": aud,
            "exp": chrono::Utc::now().timestamp() + 3600,
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn authenticator() -> PushAuthenticator {
        PushAuthenticator::new(
            Arc::new(SharedSecretVerifier::new(SECRET)),
            "pusher@demo.iam.gserviceaccount.com",
            "https://gateway.example.com/pubsub/push",
        )
    }

    #[tokio::test]
    async fn test_valid_token() {
        let header = format!(
            "Bearer {}",
            token(
                "pusher@demo.iam.gserviceaccount.com",
                "https://gateway.example.com/pubsub/push"
            )
        );
        let identity = authenticator().authenticate(Some(&header)).await.unwrap();
        assert_eq!(identity.email, "pusher@demo.iam.gserviceaccount.com");
    }

    #[tokio::test]
    async fn test_missing_header_is_forbidden() {
        let err = authenticator().authenticate(None).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let err = authenticator().authenticate(Some("Basic abc")).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_audience_mismatch_is_forbidden() {
        let header = format!(
            "Bearer {}",
            token("pusher@demo.iam.gserviceaccount.com", "https://other.example.com")
        );
        let err = authenticator().authenticate(Some(&header)).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_bad_signature_is_forbidden() {
        let claims = json!({"email": "x@y", "aud": "z", "exp": chrono::Utc::now().timestamp() + 60});
        let forged = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"other")).unwrap();
        let err = authenticator()
            .authenticate(Some(&format!("Bearer {}", forged)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_read_push_decodes_data() {
        let header = format!(
            "Bearer {}",
            token(
                "pusher@demo.iam.gserviceaccount.com",
                "https://gateway.example.com/pubsub/push"
            )
        );
        let body = json!({
            "message": {"data": "eyJpZCI6N30=", "messageId": "1"},
            "subscription": "projects/demo/subscriptions/s"
        });

        let data = authenticator()
            .read_push(Some(&header), body.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(data, br#"{"id":7}"#);
    }

    fn token_with_kid(kid: &str) -> String {
        let header = Header {
            kid: Some(kid.to_string()),
            ..Header::default()
        };
        let claims = json!({"email": "a@b", "aud": "c", "exp": chrono::Utc::now().timestamp() + 60});
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    #[tokio::test]
    async fn test_unreachable_jwks_is_forbidden() {
        let verifier = JwksVerifier::new("http://127.0.0.1:9/certs", vec!["issuer".to_string()]);
        let authenticator = PushAuthenticator::new(Arc::new(verifier), "a@b", "c");

        let err = authenticator
            .authenticate(Some(&format!("Bearer {}", token_with_kid("k1"))))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)), "got {:?}", err);
        assert_eq!(err.status_code(), crate::types::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_invalid_jwks_document_is_forbidden() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let verifier = JwksVerifier::new(format!("{}/certs", server.uri()), vec![]);
        let err = verifier.verify(&token_with_kid("k1")).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_unknown_kids_refresh_once_per_interval() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
            .expect(1)
            .mount(&server)
            .await;

        let verifier = JwksVerifier::new(format!("{}/certs", server.uri()), vec![]);
        for kid in ["k1", "k2"] {
            let err = verifier.verify(&token_with_kid(kid)).await.unwrap_err();
            assert!(matches!(err, Error::Forbidden(_)));
        }

        server.verify().await;
    }

    #[tokio::test]
    async fn test_jwks_verifier_requires_kid() {
        let verifier = JwksVerifier::new("http://127.0.0.1:9/certs", vec!["issuer".to_string()]);
        let err = verifier.verify(&token("a@b", "c")).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }
}
