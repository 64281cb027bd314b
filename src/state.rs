//! Application state management

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::auth::{self, TokenValidator};
use crate::cache::{CachedPublication, PublicationCache};
use crate::config::Config;
use crate::error::{ConfigError, PublicationError};
use crate::publication::{DefaultOpener, Publication, PublicationOpener};
use crate::storage::{BackendRouter, CanonicalPath};

/// Cache of opened publications keyed by canonical path
pub type Publications = PublicationCache<Box<dyn Publication>, PublicationError>;

/// A publication borrowed from the cache for the duration of a request
pub type PublicationHandle = Arc<CachedPublication<Box<dyn Publication>>>;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    validator: Arc<dyn TokenValidator>,
    backends: Arc<BackendRouter>,
    opener: Arc<dyn PublicationOpener>,
    publications: Publications,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Config,
        validator: Arc<dyn TokenValidator>,
        backends: BackendRouter,
        opener: Arc<dyn PublicationOpener>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                validator,
                backends: Arc::new(backends),
                opener,
                publications: Publications::default(),
                started_at: Utc::now(),
            }),
        }
    }

    /// Build backends, the token validator and the default engine
    pub async fn from_config(config: Config) -> Result<Self, ConfigError> {
        let backends = BackendRouter::from_config(&config).await?;
        let validator = auth::from_config(&config, backends.http_client()).await?;
        Ok(Self::new(config, validator, backends, Arc::new(DefaultOpener::new())))
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn validator(&self) -> &dyn TokenValidator {
        self.inner.validator.as_ref()
    }

    pub fn backends(&self) -> &BackendRouter {
        &self.inner.backends
    }

    pub fn publications(&self) -> &Publications {
        &self.inner.publications
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Open the publication at `path`, through the cache
    pub async fn publication(&self, path: &CanonicalPath) -> Result<PublicationHandle, PublicationError> {
        let locator = self.inner.backends.resolve(path)?;
        let backends = self.inner.backends.clone();
        let opener = self.inner.opener.clone();
        let key = path.clone();

        self.inner
            .publications
            .get_or_create(path.as_bytes(), locator.is_remote(), move || async move {
                tracing::debug!(path = %key, scheme = %locator.scheme(), "Opening publication");
                let data = backends.fetch(&locator).await?;
                opener.open(&key, data, backends.archive_config()).await
            })
            .await
    }

    /// Release every cached publication
    pub fn shutdown(&self) {
        let released = self.inner.publications.clear();
        tracing::info!(released, "Publication cache cleared");
    }
}
