//! Publication engine
//!
//! Turns the raw bytes of a publication into something the gateway can serve:
//! a WebPub manifest plus named resources. The gateway only depends on the
//! [`Publication`] and [`PublicationOpener`] traits; [`DefaultOpener`] handles
//! ZIP containers (EPUB, CBZ) and PDF.

mod archive;
mod manifest;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::Release;
use crate::error::PublicationError;
use crate::storage::{ArchiveConfig, CanonicalPath};

pub use archive::{ArchivePublication, PdfPublication, Profile};
pub use manifest::{Link, Manifest, Metadata, MANIFEST_HREF, WEBPUB_CONTEXT, WEBPUB_MEDIA_TYPE};

/// A named resource extracted from a publication
#[derive(Debug, Clone)]
pub struct Resource {
    pub data: Bytes,
    pub media_type: String,
}

/// An opened publication. Releasing it frees the underlying container.
pub trait Publication: Release + Send + Sync {
    fn manifest(&self) -> &Manifest;

    /// Resource at `href`, relative to the manifest
    fn resource(&self, href: &str) -> Result<Resource, PublicationError>;
}

/// Builds publications from backend bytes
#[async_trait]
pub trait PublicationOpener: Send + Sync {
    async fn open(
        &self,
        path: &CanonicalPath,
        data: Bytes,
        config: &ArchiveConfig,
    ) -> Result<Box<dyn Publication>, PublicationError>;
}

/// Title shown when the container carries none we read
fn fallback_title(path: &CanonicalPath) -> String {
    let located = path.locate().ok();
    located
        .as_ref()
        .and_then(|l| l.file_name())
        .map(|name| {
            Path::new(name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(name)
                .to_string()
        })
        .unwrap_or_else(|| path.to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOpener;

impl DefaultOpener {
    pub fn new() -> Self {
        Self
    }

    /// Sniff the container format and open it
    pub fn open_sync(
        path: &CanonicalPath,
        data: Bytes,
        config: &ArchiveConfig,
    ) -> Result<Box<dyn Publication>, PublicationError> {
        let title = fallback_title(path);
        if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
            Ok(Box::new(ArchivePublication::open(&title, data, config)?))
        } else if data.starts_with(b"%PDF") {
            Ok(Box::new(PdfPublication::open(&title, data)))
        } else {
            Err(PublicationError::Unsupported(format!(
                "{} is neither a ZIP container nor a PDF",
                path
            )))
        }
    }
}

#[async_trait]
impl PublicationOpener for DefaultOpener {
    async fn open(
        &self,
        path: &CanonicalPath,
        data: Bytes,
        config: &ArchiveConfig,
    ) -> Result<Box<dyn Publication>, PublicationError> {
        let path = path.clone();
        let config = config.clone();
        // Inflating and indexing archives is CPU-bound
        tokio::task::spawn_blocking(move || Self::open_sync(&path, data, &config)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_title() {
        assert_eq!(fallback_title(&"books/moby-dick.epub".into()), "moby-dick");
        assert_eq!(fallback_title(&"s3://bucket/a/b.pdf".into()), "b");
        assert_eq!(fallback_title(&"ftp://nowhere".into()), "ftp://nowhere");
    }

    #[tokio::test]
    async fn test_default_opener_sniffs_format() {
        let opener = DefaultOpener::new();
        let config = ArchiveConfig::default();

        let pdf = opener
            .open(&"paper.pdf".into(), Bytes::from_static(b"%PDF-1.4 ..."), &config)
            .await
            .unwrap();
        assert_eq!(pdf.manifest().metadata.title, "paper");

        let err = opener
            .open(&"notes.txt".into(), Bytes::from_static(b"just text"), &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PublicationError::Unsupported(_)));
    }
}
