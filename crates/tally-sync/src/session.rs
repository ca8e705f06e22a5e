//! # Session Provider
//!
//! Supplies the bearer credential for the remote store and keeps it fresh.
//!
//! ## Refresh Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Orchestrator                  SessionProvider            Auth server  │
//! │       │                              │                         │        │
//! │       │  refresh() (every round)     │                         │        │
//! │       │─────────────────────────────►│                         │        │
//! │       │                              │── POST refresh ────────►│        │
//! │       │                              │◄──── new access token ──│        │
//! │       │                              │   (+ rotated refresh)   │        │
//! │       │◄──────── Credential ─────────│                         │        │
//! │       │                              │                         │        │
//! │       │  [remote answers 401/403]    │                         │        │
//! │       │  invalidate()               ─►  forget tokens: signed out       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Credential
// =============================================================================

/// A bearer token and, when known, its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Wraps a token, reading `exp` from it when it is a JWT.
    pub fn from_token(token: impl Into<String>) -> Self {
        let access_token = token.into();
        let expires_at = jwt_expiry(&access_token);
        Credential {
            access_token,
            expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    pub fn remaining_secs(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_seconds().max(0))
    }
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

/// Reads the `exp` claim of a JWT without verifying its signature.
///
/// The client only needs the expiry to schedule a refresh; the remote store
/// does the verifying.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = jsonwebtoken::Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = jsonwebtoken::decode::<ExpiryClaims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(&[]),
        &validation,
    )
    .ok()?;

    data.claims
        .exp
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
}

// =============================================================================
// SessionProvider
// =============================================================================

/// Refreshable credential source for the remote store.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Returns a credential to use for the rest of the round. Called once
    /// per round before any network call; implementations that hold a
    /// refresh token exchange it every time.
    ///
    /// Fails with [`SyncError::Auth`] when signed out or when the refresh
    /// is refused.
    async fn refresh(&self) -> SyncResult<Credential>;

    /// Forgets every token. Later calls to `refresh` fail until the user
    /// signs in again.
    async fn invalidate(&self);

    async fn is_signed_in(&self) -> bool;
}

// =============================================================================
// StaticSession
// =============================================================================

/// A fixed token, or none at all for backends that need no credential.
#[derive(Debug, Clone)]
pub struct StaticSession {
    token: Arc<RwLock<Option<Credential>>>,
}

impl StaticSession {
    pub fn new(token: impl Into<String>) -> Self {
        StaticSession {
            token: Arc::new(RwLock::new(Some(Credential::from_token(token)))),
        }
    }

    /// A session whose credential is an empty token; used by the file and
    /// memory backends.
    pub fn anonymous() -> Self {
        StaticSession {
            token: Arc::new(RwLock::new(Some(Credential {
                access_token: String::new(),
                expires_at: None,
            }))),
        }
    }

    /// Replaces the token after the user signed in again.
    pub async fn sign_in(&self, token: impl Into<String>) {
        *self.token.write().await = Some(Credential::from_token(token));
        info!("Signed in");
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn refresh(&self) -> SyncResult<Credential> {
        match self.token.read().await.as_ref() {
            Some(c) if c.is_expired() => Err(SyncError::Auth("access token expired".into())),
            Some(c) => Ok(c.clone()),
            None => Err(SyncError::Auth("signed out".into())),
        }
    }

    async fn invalidate(&self) {
        *self.token.write().await = None;
        warn!("Session invalidated");
    }

    async fn is_signed_in(&self) -> bool {
        self.token.read().await.is_some()
    }
}

// =============================================================================
// HttpSession
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Default)]
struct TokenState {
    access: Option<Credential>,
    refresh_token: Option<String>,
}

/// Exchanges a refresh token for short-lived access tokens over HTTP.
///
/// `POST {refresh_url}` with `{"refreshToken": "..."}`; the response carries
/// `accessToken` and optionally a rotated `refreshToken` and `expiresIn`.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: reqwest::Client,
    refresh_url: String,
    state: Arc<RwLock<TokenState>>,
}

impl HttpSession {
    pub fn new(
        refresh_url: impl Into<String>,
        refresh_token: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(HttpSession {
            client,
            refresh_url: refresh_url.into(),
            state: Arc::new(RwLock::new(TokenState {
                access: access_token.map(Credential::from_token),
                refresh_token: Some(refresh_token.into()),
            })),
        })
    }

    async fn exchange(&self, refresh_token: &str) -> SyncResult<(Credential, Option<String>)> {
        debug!(url = %self.refresh_url, "Refreshing access token");

        let response = self
            .client
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("token refresh: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 400 {
            return Err(SyncError::Auth(format!("token refresh refused: HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(SyncError::Network(format!("token refresh: HTTP {}", status)));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Serialization(format!("token refresh response: {}", e)))?;

        let mut credential = Credential::from_token(body.access_token);
        if credential.expires_at.is_none() {
            credential.expires_at = body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        }
        Ok((credential, body.refresh_token))
    }
}

#[async_trait]
impl SessionProvider for HttpSession {
    /// Exchanges the refresh token every time, whatever the cached access
    /// token claims about its own expiry. Concurrent callers are serialized
    /// on the state lock so a rotated refresh token is never used twice.
    async fn refresh(&self) -> SyncResult<Credential> {
        let mut guard = self.state.write().await;

        let refresh_token = guard
            .refresh_token
            .clone()
            .ok_or_else(|| SyncError::Auth("signed out".into()))?;

        if let Some(previous) = guard.access.as_ref() {
            debug!(remaining_secs = ?previous.remaining_secs(), "Replacing access token");
        }

        let (credential, rotated) = self.exchange(&refresh_token).await?;
        info!(expires_in_secs = ?credential.remaining_secs(), "Token refreshed");

        if let Some(rotated) = rotated {
            guard.refresh_token = Some(rotated);
        }
        guard.access = Some(credential.clone());
        Ok(credential)
    }

    async fn invalidate(&self) {
        *self.state.write().await = TokenState::default();
        warn!("Session invalidated");
    }

    async fn is_signed_in(&self) -> bool {
        self.state.read().await.refresh_token.is_some()
    }
}

/// Picks the session implementation for `config`: refresh-token exchange
/// when a refresh endpoint is configured, a static bearer token when only a
/// token is set, and an anonymous session otherwise.
pub fn from_config(config: &SyncConfig) -> SyncResult<Arc<dyn SessionProvider>> {
    let session = &config.session;
    match (&session.refresh_url, &session.refresh_token, &session.token) {
        (Some(url), Some(refresh_token), access) => Ok(Arc::new(HttpSession::new(
            url.clone(),
            refresh_token.clone(),
            access.clone(),
            config.request_timeout(),
        )?)),
        (None, _, Some(token)) => Ok(Arc::new(StaticSession::new(token.clone()))),
        (Some(_), None, _) => Err(SyncError::InvalidConfig(
            "session.refresh_url requires session.refresh_token".into(),
        )),
        (None, _, None) => Ok(Arc::new(StaticSession::anonymous())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn jwt_expiring_in(secs: i64) -> String {
        let claims = TestClaims {
            sub: "alice".into(),
            exp: (Utc::now() + chrono::Duration::seconds(secs)).timestamp(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"server-secret")).unwrap()
    }

    #[test]
    fn test_jwt_expiry_is_decoded() {
        let credential = Credential::from_token(jwt_expiring_in(3600));
        let remaining = credential.remaining_secs().unwrap();
        assert!(remaining > 3500 && remaining <= 3600);
        assert!(!credential.is_expired());
        assert!(Credential::from_token(jwt_expiring_in(-5)).is_expired());
    }

    #[test]
    fn test_opaque_token_never_expires() {
        let credential = Credential::from_token("not-a-jwt");
        assert_eq!(credential.expires_at, None);
        assert_eq!(credential.remaining_secs(), None);
    }

    #[tokio::test]
    async fn test_static_session_invalidate() {
        let session = StaticSession::new("abc");
        assert_eq!(session.refresh().await.unwrap().access_token, "abc");

        session.invalidate().await;
        assert!(!session.is_signed_in().await);
        assert!(matches!(session.refresh().await, Err(SyncError::Auth(_))));

        session.sign_in("def").await;
        assert_eq!(session.refresh().await.unwrap().access_token, "def");
    }

    #[tokio::test]
    async fn test_static_session_rejects_expired_jwt() {
        let session = StaticSession::new(jwt_expiring_in(-10));
        assert!(matches!(session.refresh().await, Err(SyncError::Auth(_))));
    }

    #[tokio::test]
    async fn test_from_config_picks_implementation() {
        let mut config = SyncConfig::default();
        let anonymous = from_config(&config).unwrap();
        assert_eq!(anonymous.refresh().await.unwrap().access_token, "");

        config.session.token = Some("abc".into());
        let fixed = from_config(&config).unwrap();
        assert_eq!(fixed.refresh().await.unwrap().access_token, "abc");

        config.session.refresh_url = Some("https://auth.example.com/token".into());
        assert!(from_config(&config).is_err());
    }

    /// Serves one canned JSON answer per connection and hands back the
    /// request bodies it saw.
    fn token_server(answers: Vec<&'static str>) -> (String, std::thread::JoinHandle<Vec<String>>) {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut bodies = Vec::new();
            for answer in answers {
                let (mut stream, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = stream.read(&mut chunk).unwrap();
                    request.extend_from_slice(&chunk[..n]);
                    let text = String::from_utf8_lossy(&request).to_string();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let length = text[..split]
                            .lines()
                            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                            .and_then(|v| v.parse::<usize>().ok())
                            .unwrap_or(0);
                        if request.len() >= split + 4 + length || n == 0 {
                            bodies.push(text[split + 4..].to_string());
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    answer.len(),
                    answer
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
            bodies
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_http_session_refreshes_opaque_token() {
        let session = HttpSession::new(
            "http://127.0.0.1:9/token",
            "refresh-1",
            Some("opaque-token".to_string()),
            Duration::from_secs(1),
        )
        .unwrap();

        // The cached token is not handed out without asking the auth server.
        assert!(matches!(session.refresh().await, Err(SyncError::Network(_))));
        assert!(session.is_signed_in().await);
    }

    #[tokio::test]
    async fn test_http_session_exchanges_every_call() {
        let (url, server) = token_server(vec![
            r#"{"accessToken":"access-1","refreshToken":"refresh-2","expiresIn":3600}"#,
            r#"{"accessToken":"access-2"}"#,
        ]);
        let session = HttpSession::new(
            url,
            "refresh-1",
            Some(jwt_expiring_in(3600)),
            Duration::from_secs(5),
        )
        .unwrap();

        let first = session.refresh().await.unwrap();
        assert_eq!(first.access_token, "access-1");
        assert!(first.remaining_secs().unwrap() > 3500);

        let second = session.refresh().await.unwrap();
        assert_eq!(second.access_token, "access-2");
        assert_eq!(second.expires_at, None);

        let bodies = server.join().unwrap();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].contains("\"refreshToken\":\"refresh-1\""));
        assert!(bodies[1].contains("\"refreshToken\":\"refresh-2\""));
    }

    #[tokio::test]
    async fn test_http_session_signed_out_after_invalidate() {
        let session = HttpSession::new(
            "http://127.0.0.1:9/token",
            "refresh-1",
            Some(jwt_expiring_in(3600)),
            Duration::from_secs(1),
        )
        .unwrap();

        session.invalidate().await;
        assert!(!session.is_signed_in().await);
        assert!(matches!(session.refresh().await, Err(SyncError::Auth(_))));
    }
}
