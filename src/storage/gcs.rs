//! Google Cloud Storage client
//!
//! Reads objects through the JSON API with a bearer token. The token is either
//! configured statically or obtained from the GCE metadata server and reused
//! until shortly before it expires.

use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::{header::AUTHORIZATION, Client, StatusCode};
use serde::Deserialize;

use super::too_large;
use crate::client::collect_limited;
use crate::error::{ConfigError, FetchError, PublicationError};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

enum TokenSource {
    Static(String),
    Metadata(Mutex<Option<(String, Instant)>>),
}

/// Read-only GCS client
pub struct GcsClient {
    client: Client,
    base_url: String,
    tokens: TokenSource,
}

impl GcsClient {
    /// `access_token` of `None` means tokens come from the metadata server
    pub fn new(access_token: Option<String>) -> Result<Self, ConfigError> {
        // The metadata server is link-local, so this client does not go through
        // the connection gate. It only ever talks to Google endpoints.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        let tokens = match access_token.filter(|t| !t.is_empty()) {
            Some(token) => TokenSource::Static(token),
            None => {
                tracing::info!("GCS access token will be discovered from the metadata server");
                TokenSource::Metadata(Mutex::new(None))
            }
        };

        Ok(Self {
            client,
            base_url: STORAGE_API.to_string(),
            tokens,
        })
    }

    /// Point the client at another JSON API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn access_token(&self) -> Result<String, PublicationError> {
        let cache = match &self.tokens {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata(cache) => cache,
        };

        let cached = cache.lock().clone();
        if let Some((token, expires_at)) = cached {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < expires_at {
                return Ok(token);
            }
        }

        let token: MetadataToken = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PublicationError::Backend(format!("GCS token discovery failed: {}", e)))?
            .json()
            .await
            .map_err(|e| PublicationError::Backend(format!("GCS token response invalid: {}", e)))?;

        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        *cache.lock() = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }

    /// Download an object's contents, refusing objects over `limit` bytes
    pub async fn get_object(&self, bucket: &str, key: &str, limit: u64) -> Result<Bytes, PublicationError> {
        let url = format!(
            "{}/b/{}/o/{}?alt=media",
            self.base_url,
            urlencoding::encode(bucket),
            urlencoding::encode(key)
        );
        let token = self.access_token().await?;

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| PublicationError::Backend(format!("failed to get gs://{}/{}: {}", bucket, key, e)))?;

        match response.status() {
            status if status.is_success() => collect_limited(response, limit).await.map_err(|e| match e {
                FetchError::TooLarge { limit, .. } => too_large(&format!("gs://{}/{}", bucket, key), limit),
                e => PublicationError::Backend(format!("failed to read gs://{}/{}: {}", bucket, key, e)),
            }),
            StatusCode::NOT_FOUND => Err(PublicationError::NotFound(format!("gs://{}/{}", bucket, key))),
            status => Err(PublicationError::Backend(format!(
                "GCS answered {} for gs://{}/{}",
                status, bucket, key
            ))),
        }
    }
}
