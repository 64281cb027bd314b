//! Tokens verified against a remote JSON Web Key Set
//!
//! The key set is fetched once at construction (failure is fatal) and then
//! refreshed in the background every 12 hours. Validation only ever reads the
//! current snapshot; a refresh swaps in a new `Arc<JwkSet>` after the network
//! round-trip has finished, so no lock is held across I/O.

use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{validation, AuthError, Claims, TokenValidator};
use crate::client::SafeFetchClient;
use crate::error::{ConfigError, FetchError};
use crate::storage::CanonicalPath;

/// Interval between scheduled key-set refreshes
pub const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Minimum spacing of refreshes triggered by an unknown `kid`
const UNKNOWN_KID_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct KeySet {
    url: String,
    client: SafeFetchClient,
    snapshot: RwLock<Arc<JwkSet>>,
    last_refresh: Mutex<Instant>,
}

impl KeySet {
    async fn fetch(&self) -> Result<JwkSet, FetchError> {
        let response = self.client.get(&self.url).await?;
        Ok(response.json::<JwkSet>().await?)
    }

    async fn refresh(&self) -> Result<usize, FetchError> {
        *self.last_refresh.lock() = Instant::now();
        let keys = self.fetch().await?;
        let count = keys.keys.len();
        *self.snapshot.write() = Arc::new(keys);
        Ok(count)
    }

    fn snapshot(&self) -> Arc<JwkSet> {
        self.snapshot.read().clone()
    }
}

pub struct JwksValidator {
    keys: Arc<KeySet>,
    refresher: JoinHandle<()>,
}

impl JwksValidator {
    /// Fetch the key set and start the background refresh task
    pub async fn new(client: SafeFetchClient, url: &str) -> Result<Self, ConfigError> {
        Self::with_refresh_interval(client, url, JWKS_REFRESH_INTERVAL).await
    }

    pub async fn with_refresh_interval(
        client: SafeFetchClient,
        url: &str,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        if url.is_empty() {
            return Err(ConfigError::MissingJwksUrl);
        }

        let keys = KeySet {
            url: url.to_string(),
            client,
            snapshot: RwLock::new(Arc::new(JwkSet { keys: Vec::new() })),
            last_refresh: Mutex::new(Instant::now()),
        };
        let count = keys.refresh().await.map_err(|e| ConfigError::JwksUnavailable {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(jwks_url = %url, keys = count, "Loaded JWKS");

        let keys = Arc::new(keys);
        let refresher = tokio::spawn(refresh_loop(Arc::downgrade(&keys), interval));

        Ok(Self { keys, refresher })
    }

    /// Refetch the key set now
    pub async fn refresh(&self) -> Result<usize, FetchError> {
        self.keys.refresh().await
    }

    pub fn key_count(&self) -> usize {
        self.keys.snapshot().keys.len()
    }

    /// Kick off a rate-limited refresh without waiting for it
    fn refresh_in_background(&self) {
        {
            let mut last = self.keys.last_refresh.lock();
            if last.elapsed() < UNKNOWN_KID_REFRESH_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let keys = Arc::downgrade(&self.keys);
        runtime.spawn(async move {
            if let Some(keys) = keys.upgrade() {
                if let Err(e) = keys.refresh().await {
                    tracing::warn!(error = %e, "JWKS refresh for unknown key ID failed");
                }
            }
        });
    }
}

impl Drop for JwksValidator {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

async fn refresh_loop(keys: Weak<KeySet>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(keys) = keys.upgrade() else {
            break;
        };
        match keys.refresh().await {
            Ok(count) => tracing::debug!(jwks_url = %keys.url, keys = count, "Refreshed JWKS"),
            Err(e) => tracing::warn!(jwks_url = %keys.url, error = %e, "JWKS refresh failed, keeping previous keys"),
        }
    }
}

/// Pick the verification key for a token
fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Result<&'a Jwk, AuthError> {
    match kid {
        Some(kid) => keys
            .find(kid)
            .ok_or_else(|| AuthError::KeyNotFound(kid.to_string())),
        None if keys.keys.len() == 1 => Ok(&keys.keys[0]),
        None => Err(AuthError::KeyNotFound("token has no kid".to_string())),
    }
}

/// The signing algorithm a key is restricted to, if it declares one
fn key_algorithm(jwk: &Jwk) -> Option<Result<Algorithm, AuthError>> {
    jwk.common.key_algorithm.as_ref().map(|alg| {
        let name = format!("{:?}", alg);
        Algorithm::from_str(&name)
            .map_err(|_| AuthError::KeyNotFound(format!("key is not a signing key ({})", name)))
    })
}

impl TokenValidator for JwksValidator {
    fn validate(&self, token: &str) -> Result<CanonicalPath, AuthError> {
        let header = decode_header(token)?;
        let keys = self.keys.snapshot();

        let jwk = match select_key(&keys, header.kid.as_deref()) {
            Ok(jwk) => jwk,
            Err(e) => {
                self.refresh_in_background();
                return Err(e);
            }
        };

        // A key that names its algorithm pins it, otherwise the header decides.
        // Either way `jsonwebtoken` refuses an algorithm from another key family.
        let algorithm = match key_algorithm(jwk) {
            Some(alg) => alg?,
            None => header.alg,
        };
        let key = DecodingKey::from_jwk(jwk).map_err(|e| AuthError::Internal(e.to_string()))?;

        let data = decode::<Claims>(token, &key, &validation(algorithm))?;
        data.claims.into_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;
    use axum::{extract::State, http::StatusCode, routing::get, Router};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};

    // 30 bytes, so base64 with and without the URL-safe alphabet agree
    const SECRET_ONE: &[u8] = b"jwks-shared-secret-for-tests!!";
    const K_ONE: &str = "andrcy1zaGFyZWQtc2VjcmV0LWZvci10ZXN0cyEh";
    const SECRET_TWO: &[u8] = b"remote-key-set-secret-value-01";
    const K_TWO: &str = "cmVtb3RlLWtleS1zZXQtc2VjcmV0LXZhbHVlLTAx";

    type Served = Arc<Mutex<Value>>;

    fn key_set(entries: &[(&str, &str)]) -> Value {
        let keys: Vec<Value> = entries
            .iter()
            .map(|(kid, k)| json!({ "kty": "oct", "kid": kid, "alg": "HS256", "k": k }))
            .collect();
        json!({ "keys": keys })
    }

    async fn serve(initial: Value) -> (String, Served) {
        let served: Served = Arc::new(Mutex::new(initial));
        let app = Router::new()
            .route(
                "/jwks.json",
                get(|State(s): State<Served>| async move { axum::Json(s.lock().clone()) }),
            )
            .with_state(served.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/jwks.json", addr), served)
    }

    fn local_client() -> SafeFetchClient {
        SafeFetchClient::new(ClientOptions {
            unsafe_requests: true,
            ..Default::default()
        })
        .unwrap()
    }

    fn sign(kid: Option<&str>, secret: &[u8], claims: Value) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_string);
        encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let result = JwksValidator::new(local_client(), "").await;
        assert!(matches!(result, Err(ConfigError::MissingJwksUrl)));
    }

    #[tokio::test]
    async fn test_unreachable_url_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = JwksValidator::new(local_client(), &format!("http://{}/jwks.json", addr)).await;
        assert!(matches!(result, Err(ConfigError::JwksUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_private_jwks_host_refused_by_gate() {
        let client = SafeFetchClient::new(ClientOptions::default()).unwrap();
        let result = JwksValidator::new(client, "http://127.0.0.1/jwks.json").await;
        assert!(matches!(result, Err(ConfigError::JwksUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_validate_with_remote_keys() {
        let (url, _served) = serve(key_set(&[("one", K_ONE)])).await;
        let validator = JwksValidator::new(local_client(), &url).await.unwrap();
        assert_eq!(validator.key_count(), 1);

        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = sign(Some("one"), SECRET_ONE, json!({ "sub": "gs://bucket/a.epub", "exp": exp }));
        assert_eq!(validator.validate(&token).unwrap().to_str(), Some("gs://bucket/a.epub"));

        // Single-key sets also accept tokens without a kid
        let token = sign(None, SECRET_ONE, json!({ "sub": "a.epub" }));
        assert_eq!(validator.validate(&token).unwrap().to_str(), Some("a.epub"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (url, _served) = serve(key_set(&[("one", K_ONE)])).await;
        let validator = JwksValidator::new(local_client(), &url).await.unwrap();
        let now = chrono::Utc::now().timestamp();

        let unknown = sign(Some("missing"), SECRET_ONE, json!({ "sub": "a.epub" }));
        assert_eq!(validator.validate(&unknown).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let forged = sign(Some("one"), SECRET_TWO, json!({ "sub": "a.epub" }));
        assert_eq!(validator.validate(&forged).unwrap_err(), AuthError::InvalidSignature);

        let expired = sign(Some("one"), SECRET_ONE, json!({ "sub": "a.epub", "exp": now - 10 }));
        assert_eq!(validator.validate(&expired).unwrap_err().status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_refresh_swaps_snapshot() {
        let (url, served) = serve(key_set(&[("one", K_ONE)])).await;
        let validator = JwksValidator::new(local_client(), &url).await.unwrap();

        let token = sign(Some("two"), SECRET_TWO, json!({ "sub": "b.epub" }));
        assert!(matches!(validator.validate(&token), Err(AuthError::KeyNotFound(_))));

        *served.lock() = key_set(&[("one", K_ONE), ("two", K_TWO)]);
        assert_eq!(validator.refresh().await.unwrap(), 2);

        assert_eq!(validator.validate(&token).unwrap().to_str(), Some("b.epub"));
    }

    #[tokio::test]
    async fn test_periodic_refresh() {
        let (url, served) = serve(key_set(&[("one", K_ONE)])).await;
        let validator =
            JwksValidator::with_refresh_interval(local_client(), &url, Duration::from_millis(50))
                .await
                .unwrap();

        *served.lock() = key_set(&[("one", K_ONE), ("two", K_TWO)]);

        let mut refreshed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if validator.key_count() == 2 {
                refreshed = true;
                break;
            }
        }
        assert!(refreshed, "background refresh never picked up the new key");
    }
}
