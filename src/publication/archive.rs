//! ZIP-based publications (EPUB, CBZ) and single-file PDF publications

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use zip::ZipArchive;

use super::manifest::{Link, Manifest};
use super::{Publication, Resource};
use crate::cache::Release;
use crate::error::PublicationError;
use crate::storage::ArchiveConfig;

const EPUB_MEDIA_TYPE: &str = "application/epub+zip";
const PDF_MEDIA_TYPE: &str = "application/pdf";
const PDF_HREF: &str = "publication.pdf";
/// Upper bound on buffer preallocation; declared sizes are not trusted
const MAX_PREALLOCATION: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Epub,
    Comic,
    Generic,
}

#[derive(Debug)]
struct Entry {
    index: usize,
    size: u64,
    media_type: String,
}

fn media_type_of(name: &str) -> String {
    mime_guess::from_path(name).first_or_octet_stream().essence_str().to_string()
}

fn is_html(media_type: &str) -> bool {
    media_type == "application/xhtml+xml" || media_type == "text/html"
}

fn closed() -> PublicationError {
    PublicationError::Internal("publication has been released".to_string())
}

/// Publication backed by an in-memory ZIP archive
pub struct ArchivePublication {
    manifest: Manifest,
    profile: Profile,
    entries: HashMap<String, Entry>,
    archive: Mutex<Option<ZipArchive<Cursor<Bytes>>>>,
    /// Fully decompressed entries when the archive is small enough
    preloaded: Mutex<HashMap<String, Bytes>>,
    memo: Option<Mutex<LruCache<String, Bytes>>>,
    cache_size_threshold: u64,
}

impl ArchivePublication {
    pub fn open(title: &str, data: Bytes, config: &ArchiveConfig) -> Result<Self, PublicationError> {
        let archive_size = data.len() as u64;
        let mut archive = ZipArchive::new(Cursor::new(data))
            .map_err(|e| PublicationError::Unsupported(format!("unreadable ZIP archive: {}", e)))?;

        let mut order = Vec::new();
        let mut entries = HashMap::new();
        for index in 0..archive.len() {
            let file = archive
                .by_index_raw(index)
                .map_err(|e| PublicationError::Unsupported(format!("corrupt ZIP entry {}: {}", index, e)))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let size = file.size();
            if size > config.max_size {
                return Err(PublicationError::Unsupported(format!(
                    "ZIP entry {} declares {} bytes, over the {} byte limit",
                    name, size, config.max_size
                )));
            }
            let media_type = media_type_of(&name);
            entries.insert(
                name.clone(),
                Entry {
                    index,
                    size,
                    media_type,
                },
            );
            order.push(name);
        }

        let profile = detect_profile(&mut archive, &entries);
        let manifest = build_manifest(title, profile, &order, &entries);

        let inflated_size = entries.values().fold(0u64, |total, e| total.saturating_add(e.size));
        let mut preloaded = HashMap::new();
        if archive_size <= config.cache_all_threshold && inflated_size <= config.max_size {
            for (name, entry) in &entries {
                preloaded.insert(name.clone(), read_entry(&mut archive, entry)?);
            }
        }

        let memo = NonZeroUsize::new(config.cache_count_threshold).map(|n| Mutex::new(LruCache::new(n)));

        tracing::debug!(
            title,
            entries = entries.len(),
            preloaded = !preloaded.is_empty(),
            ?profile,
            "Opened archive publication"
        );

        Ok(Self {
            manifest,
            profile,
            entries,
            archive: Mutex::new(Some(archive)),
            preloaded: Mutex::new(preloaded),
            memo,
            cache_size_threshold: config.cache_size_threshold,
        })
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    fn read(&self, href: &str, entry: &Entry) -> Result<Bytes, PublicationError> {
        if let Some(data) = self.preloaded.lock().get(href) {
            return Ok(data.clone());
        }
        if let Some(memo) = &self.memo {
            if let Some(data) = memo.lock().get(href) {
                return Ok(data.clone());
            }
        }

        let data = {
            let mut archive = self.archive.lock();
            let archive = archive.as_mut().ok_or_else(closed)?;
            read_entry(archive, entry)?
        };

        if let Some(memo) = &self.memo {
            if entry.size <= self.cache_size_threshold {
                memo.lock().put(href.to_string(), data.clone());
            }
        }
        Ok(data)
    }
}

/// Inflate one entry, never past the size its header declares
fn read_entry(archive: &mut ZipArchive<Cursor<Bytes>>, entry: &Entry) -> Result<Bytes, PublicationError> {
    let file = archive
        .by_index(entry.index)
        .map_err(|e| PublicationError::Internal(format!("failed to open ZIP entry: {}", e)))?;
    let mut data = Vec::with_capacity(entry.size.min(MAX_PREALLOCATION) as usize);
    file.take(entry.size.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|e| PublicationError::Internal(format!("failed to inflate ZIP entry: {}", e)))?;
    if data.len() as u64 > entry.size {
        return Err(PublicationError::Unsupported(format!(
            "ZIP entry {} inflates past its declared {} bytes",
            entry.index, entry.size
        )));
    }
    Ok(Bytes::from(data))
}

fn detect_profile(archive: &mut ZipArchive<Cursor<Bytes>>, entries: &HashMap<String, Entry>) -> Profile {
    if let Some(entry) = entries.get("mimetype") {
        if let Ok(data) = read_entry(archive, entry) {
            if String::from_utf8_lossy(&data).trim() == EPUB_MEDIA_TYPE {
                return Profile::Epub;
            }
        }
    }
    if entries.contains_key("META-INF/container.xml") {
        return Profile::Epub;
    }

    let has_images = entries.values().any(|e| e.media_type.starts_with("image/"));
    let has_html = entries.values().any(|e| is_html(&e.media_type));
    if has_images && !has_html {
        Profile::Comic
    } else {
        Profile::Generic
    }
}

fn build_manifest(title: &str, profile: Profile, order: &[String], entries: &HashMap<String, Entry>) -> Manifest {
    let mut manifest = match profile {
        Profile::Epub => Manifest::new(title).conforms_to("https://readium.org/webpub-manifest/profiles/epub"),
        Profile::Comic => Manifest::new(title).conforms_to("https://readium.org/webpub-manifest/profiles/divina"),
        Profile::Generic => Manifest::new(title),
    };

    for name in order {
        let Some(entry) = entries.get(name) else {
            continue;
        };
        if name == "mimetype" {
            continue;
        }
        let in_reading_order = match profile {
            Profile::Epub | Profile::Generic => is_html(&entry.media_type),
            Profile::Comic => entry.media_type.starts_with("image/"),
        };
        let link = Link::new(name.clone(), entry.media_type.clone());
        if in_reading_order {
            manifest.reading_order.push(link);
        } else {
            manifest.resources.push(link);
        }
    }
    manifest
}

impl Publication for ArchivePublication {
    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn resource(&self, href: &str) -> Result<Resource, PublicationError> {
        let entry = self
            .entries
            .get(href)
            .ok_or_else(|| PublicationError::ResourceNotFound(href.to_string()))?;
        Ok(Resource {
            data: self.read(href, entry)?,
            media_type: entry.media_type.clone(),
        })
    }
}

impl Release for ArchivePublication {
    fn release(&self) {
        self.archive.lock().take();
        self.preloaded.lock().clear();
        if let Some(memo) = &self.memo {
            memo.lock().clear();
        }
    }
}

/// A PDF exposed as a one-resource publication
pub struct PdfPublication {
    manifest: Manifest,
    data: Mutex<Option<Bytes>>,
    released: AtomicBool,
}

impl PdfPublication {
    pub fn open(title: &str, data: Bytes) -> Self {
        let mut manifest = Manifest::new(title).conforms_to("https://readium.org/webpub-manifest/profiles/pdf");
        manifest.reading_order.push(Link::new(PDF_HREF, PDF_MEDIA_TYPE));
        Self {
            manifest,
            data: Mutex::new(Some(data)),
            released: AtomicBool::new(false),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Publication for PdfPublication {
    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn resource(&self, href: &str) -> Result<Resource, PublicationError> {
        if href != PDF_HREF {
            return Err(PublicationError::ResourceNotFound(href.to_string()));
        }
        let data = self.data.lock().clone().ok_or_else(closed)?;
        Ok(Resource {
            data,
            media_type: PDF_MEDIA_TYPE.to_string(),
        })
    }
}

impl Release for PdfPublication {
    fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.data.lock().take();
    }
}
