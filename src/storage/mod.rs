//! Publication storage backends
//!
//! Local directory, S3-compatible object storage, Google Cloud Storage and
//! plain HTTP(S). Which backends exist is decided once at startup; the router
//! is read-only afterwards and shared between requests.

mod gcs;
mod s3_client;
mod types;

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;

use crate::client::{ClientOptions, SafeFetchClient, Whitelist};
use crate::config::Config;
use crate::error::{ConfigError, PublicationError};

pub use gcs::GcsClient;
pub use s3_client::S3Client;
pub use types::*;

/// Tuning forwarded to the publication engine for remote archives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Entries up to this size are memoised
    pub cache_size_threshold: u64,
    /// Maximum number of memoised entries per archive
    pub cache_count_threshold: usize,
    /// Archives up to this size are fully decompressed on open
    pub cache_all_threshold: u64,
    /// Bound on each remote backend operation
    pub timeout: Duration,
    /// Largest body read into memory: a whole publication, or one inflated
    /// archive entry
    pub max_size: u64,
}

/// Default for [`ArchiveConfig::max_size`]
pub const DEFAULT_MAX_SIZE: u64 = 512 * 1024 * 1024;

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            cache_size_threshold: 1024 * 1024,
            cache_count_threshold: 64,
            cache_all_threshold: 1024 * 1024,
            timeout: Duration::from_secs(60),
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

/// Per-scheme backend handles
#[derive(Default)]
pub struct BackendRouter {
    local_directory: Option<PathBuf>,
    s3: Option<S3Client>,
    gcs: Option<GcsClient>,
    http: Option<SafeFetchClient>,
    http_enabled: bool,
    https_enabled: bool,
    archive: ArchiveConfig,
}

impl BackendRouter {
    pub fn new(archive: ArchiveConfig) -> Self {
        Self {
            archive,
            ..Default::default()
        }
    }

    pub fn with_local_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        self.local_directory = (!directory.as_os_str().is_empty()).then_some(directory);
        self
    }

    pub fn with_s3(mut self, client: S3Client) -> Self {
        self.s3 = Some(client);
        self
    }

    pub fn with_gcs(mut self, client: GcsClient) -> Self {
        self.gcs = Some(client);
        self
    }

    /// HTTP and HTTPS share the client but are enabled independently
    pub fn with_http(mut self, client: Option<SafeFetchClient>, http_enabled: bool, https_enabled: bool) -> Self {
        self.http = client;
        self.http_enabled = http_enabled;
        self.https_enabled = https_enabled;
        self
    }

    /// Build every backend the configuration enables.
    ///
    /// Object storage failures stop startup. A bad whitelist or HTTP client
    /// only disables HTTP(S), with a warning.
    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut router = Self::new(config.archive.clone());

        if let Some(directory) = config.local_directory() {
            tracing::info!(directory = %directory.display(), "Serving local publications");
            router = router.with_local_directory(directory.clone());
        }

        if config.is_enabled(Scheme::S3) {
            router = router.with_s3(S3Client::new(&config.s3).await?);
        }

        if config.is_enabled(Scheme::Gs) {
            router = router.with_gcs(GcsClient::new(config.gcs.access_token.clone())?);
        }

        let http = Whitelist::parse(&config.http.whitelist).and_then(|whitelist| {
            SafeFetchClient::new(ClientOptions {
                authorization: config.http.authorization.clone(),
                whitelist,
                unsafe_requests: config.http.unsafe_requests,
            })
        });
        let http = match http {
            Ok(client) => {
                if client.is_unsafe() {
                    tracing::warn!("Unsafe HTTP requests enabled, outbound fetches may reach private networks");
                }
                Some(client)
            }
            Err(e) => {
                tracing::warn!(error = %e, "HTTP client creation failed, HTTP support will be disabled");
                None
            }
        };
        router = router.with_http(http, config.is_enabled(Scheme::Http), config.is_enabled(Scheme::Https));

        let enabled: Vec<&str> = router.enabled_schemes().iter().map(Scheme::as_str).collect();
        tracing::info!(schemes = ?enabled, "Backends ready");
        Ok(router)
    }

    pub fn accepts_scheme(&self, scheme: Scheme) -> bool {
        match scheme {
            Scheme::File => self.local_directory.is_some(),
            Scheme::S3 => self.s3.is_some(),
            Scheme::Gs => self.gcs.is_some(),
            Scheme::Http => self.http_enabled && self.http.is_some(),
            Scheme::Https => self.https_enabled && self.http.is_some(),
        }
    }

    /// Schemes that can currently be served
    pub fn enabled_schemes(&self) -> Vec<Scheme> {
        Scheme::ALL.into_iter().filter(|s| self.accepts_scheme(*s)).collect()
    }

    pub fn archive_config(&self) -> &ArchiveConfig {
        &self.archive
    }

    pub fn local_directory(&self) -> Option<&Path> {
        self.local_directory.as_deref()
    }

    /// The outbound client, also used for key-set retrieval
    pub fn http_client(&self) -> Option<&SafeFetchClient> {
        self.http.as_ref()
    }

    /// Parse a canonical path and check its backend is enabled
    pub fn resolve(&self, path: &CanonicalPath) -> Result<Locator, PublicationError> {
        let locator = path.locate()?;
        if !self.accepts_scheme(locator.scheme()) {
            return Err(PublicationError::SchemeDisabled(locator.scheme().to_string()));
        }
        Ok(locator)
    }

    /// Read the whole publication from its backend
    pub async fn fetch(&self, locator: &Locator) -> Result<Bytes, PublicationError> {
        let scheme = locator.scheme();
        if !self.accepts_scheme(scheme) {
            return Err(PublicationError::SchemeDisabled(scheme.to_string()));
        }

        match locator {
            Locator::File(relative) => self.read_local(relative).await,
            remote => {
                let timeout = self.archive.timeout;
                tokio::time::timeout(timeout, self.fetch_remote(remote))
                    .await
                    .map_err(|_| PublicationError::Timeout(timeout.as_secs()))?
            }
        }
    }

    async fn read_local(&self, relative: &Path) -> Result<Bytes, PublicationError> {
        let root = self
            .local_directory
            .as_deref()
            .ok_or_else(|| PublicationError::SchemeDisabled(Scheme::File.to_string()))?;
        let full = root.join(relative);

        if let Ok(metadata) = tokio::fs::metadata(&full).await {
            if metadata.len() > self.archive.max_size {
                return Err(too_large(&relative.display().to_string(), self.archive.max_size));
            }
        }

        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PublicationError::NotFound(relative.display().to_string()))
            }
            Err(e) => {
                tracing::warn!(path = %full.display(), error = %e, "Failed to read local publication");
                Err(PublicationError::Backend(format!("failed to read {}: {}", relative.display(), e)))
            }
        }
    }

    async fn fetch_remote(&self, locator: &Locator) -> Result<Bytes, PublicationError> {
        let disabled = || PublicationError::SchemeDisabled(locator.scheme().to_string());
        match locator {
            Locator::S3 { bucket, key } => {
                self.s3
                    .as_ref()
                    .ok_or_else(disabled)?
                    .get_object(bucket, key, self.archive.max_size)
                    .await
            }
            Locator::Gs { bucket, key } => {
                self.gcs
                    .as_ref()
                    .ok_or_else(disabled)?
                    .get_object(bucket, key, self.archive.max_size)
                    .await
            }
            Locator::Http(url) => {
                let client = self.http.as_ref().ok_or_else(disabled)?;
                Ok(client.get_bytes_limited(url.as_str(), self.archive.max_size).await?)
            }
            Locator::File(relative) => self.read_local(relative).await,
        }
    }
}

/// Error for a publication over [`ArchiveConfig::max_size`]
pub(crate) fn too_large(what: &str, limit: u64) -> PublicationError {
    PublicationError::Unsupported(format!("{} is larger than the {} byte limit", what, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};

    fn unsafe_client() -> SafeFetchClient {
        SafeFetchClient::new(ClientOptions {
            unsafe_requests: true,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_accepts_scheme() {
        let router = BackendRouter::new(ArchiveConfig::default());
        assert!(Scheme::ALL.iter().all(|s| !router.accepts_scheme(*s)));

        let router = BackendRouter::new(ArchiveConfig::default())
            .with_local_directory("/srv/books")
            .with_http(Some(unsafe_client()), false, true);
        assert!(router.accepts_scheme(Scheme::File));
        assert!(router.accepts_scheme(Scheme::Https));
        assert!(!router.accepts_scheme(Scheme::Http));
        assert!(!router.accepts_scheme(Scheme::S3));
        assert_eq!(router.enabled_schemes(), vec![Scheme::File, Scheme::Https]);

        // Enable flags alone are not enough without a client
        let router = BackendRouter::new(ArchiveConfig::default()).with_http(None, true, true);
        assert!(!router.accepts_scheme(Scheme::Http));
    }

    #[tokio::test]
    async fn test_invalid_whitelist_only_disables_http() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.schemes = vec![Scheme::File, Scheme::Https];
        config.file_directory = Some(dir.path().to_path_buf());
        config.http.whitelist = vec!["ftp://example.com".to_string()];

        let router = BackendRouter::from_config(&config).await.unwrap();
        assert!(router.accepts_scheme(Scheme::File));
        assert!(!router.accepts_scheme(Scheme::Https));
        assert!(router.http_client().is_none());

        config.http.whitelist = vec!["https://example.com/books".to_string()];
        let router = BackendRouter::from_config(&config).await.unwrap();
        assert!(router.accepts_scheme(Scheme::Https));
        assert!(!router.accepts_scheme(Scheme::Http));
    }

    #[test]
    fn test_resolve_rejects_disabled_scheme() {
        let router = BackendRouter::new(ArchiveConfig::default()).with_local_directory("/srv/books");
        assert!(router.resolve(&"a.epub".into()).is_ok());

        let err = router.resolve(&"s3://bucket/a.epub".into()).unwrap_err();
        assert_eq!(err, PublicationError::SchemeDisabled("s3".into()));
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("shelf")).unwrap();
        std::fs::write(dir.path().join("shelf/a.pdf"), b"%PDF-1.7").unwrap();

        let router = BackendRouter::new(ArchiveConfig::default()).with_local_directory(dir.path());
        let locator = router.resolve(&"shelf/a.pdf".into()).unwrap();
        assert_eq!(&router.fetch(&locator).await.unwrap()[..], b"%PDF-1.7");

        let locator = router.resolve(&"missing.pdf".into()).unwrap();
        assert!(matches!(router.fetch(&locator).await, Err(PublicationError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_oversized_publications_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.pdf"), vec![b'x'; 64]).unwrap();

        let app = Router::new().route("/big.epub", get(|| async { vec![b'x'; 64] }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let archive = ArchiveConfig {
            max_size: 16,
            ..Default::default()
        };
        let router = BackendRouter::new(archive)
            .with_local_directory(dir.path())
            .with_http(Some(unsafe_client()), true, false);

        for path in ["big.pdf".to_string(), format!("http://{}/big.epub", addr)] {
            let locator = router.resolve(&CanonicalPath::new(path.clone())).unwrap();
            let err = router.fetch(&locator).await.unwrap_err();
            assert!(matches!(err, PublicationError::Unsupported(_)), "{}: {:?}", path, err);
        }
    }

    #[tokio::test]
    async fn test_remote_fetch_times_out() {
        let app = Router::new().route(
            "/slow.epub",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let archive = ArchiveConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let router = BackendRouter::new(archive).with_http(Some(unsafe_client()), true, false);
        let locator = router
            .resolve(&CanonicalPath::new(format!("http://{}/slow.epub", addr)))
            .unwrap();

        assert_eq!(router.fetch(&locator).await.unwrap_err(), PublicationError::Timeout(0));
    }
}
