//! Canonical paths and the backend locations they resolve to

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use url::Url;

use crate::error::{ConfigError, PublicationError};

/// Backend selector of a canonical path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    File,
    Http,
    Https,
    S3,
    Gs,
}

impl Scheme {
    pub const ALL: [Scheme; 5] = [Scheme::File, Scheme::Http, Scheme::Https, Scheme::S3, Scheme::Gs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::S3 => "s3",
            Scheme::Gs => "gs",
        }
    }

    /// Whether reads go over the network
    pub fn is_remote(&self) -> bool {
        !matches!(self, Scheme::File)
    }
}

impl FromStr for Scheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Scheme::File),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "s3" => Ok(Scheme::S3),
            "gs" => Ok(Scheme::Gs),
            _ => Err(ConfigError::UnknownScheme(s.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-qualified publication path recovered from a token. The cache key.
///
/// Held as raw bytes: a token may carry any byte sequence. Remote schemes
/// need UTF-8, which is checked when the path is located.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPath(Vec<u8>);

impl CanonicalPath {
    pub fn new(path: impl Into<Vec<u8>>) -> Self {
        Self(path.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The path as text, if it is valid UTF-8
    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Parse into a backend location.
    ///
    /// `scheme://rest` selects the backend; anything without a scheme is a
    /// path relative to the local directory root.
    pub fn locate(&self) -> Result<Locator, PublicationError> {
        let raw = self.0.as_slice();
        let Some(split) = raw.windows(3).position(|w| w == b"://") else {
            return Ok(Locator::File(relative_path(raw)?));
        };
        let (prefix, rest) = (&raw[..split], &raw[split + 3..]);

        let scheme = std::str::from_utf8(prefix)
            .ok()
            .and_then(|prefix| Scheme::from_str(prefix).ok())
            .ok_or_else(|| PublicationError::InvalidPath(format!("unknown scheme in {}", self)))?;

        if scheme == Scheme::File {
            let start = rest.iter().position(|b| *b != b'/').unwrap_or(rest.len());
            return Ok(Locator::File(relative_path(&rest[start..])?));
        }

        let text = self
            .to_str()
            .ok_or_else(|| PublicationError::InvalidPath(format!("{} paths must be UTF-8: {}", scheme, self)))?;
        let rest = &text[split + 3..];

        match scheme {
            Scheme::S3 | Scheme::Gs => {
                let (bucket, key) = rest
                    .split_once('/')
                    .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
                    .ok_or_else(|| {
                        PublicationError::InvalidPath(format!("expected {}://bucket/key, got {}", scheme, text))
                    })?;
                let (bucket, key) = (bucket.to_string(), key.to_string());
                Ok(if scheme == Scheme::S3 {
                    Locator::S3 { bucket, key }
                } else {
                    Locator::Gs { bucket, key }
                })
            }
            _ => {
                let url = Url::parse(text).map_err(|e| PublicationError::InvalidPath(format!("{}: {}", text, e)))?;
                if url.host_str().map_or(true, str::is_empty) {
                    return Err(PublicationError::InvalidPath(format!("{} has no host", text)));
                }
                Ok(Locator::Http(url))
            }
        }
    }
}

/// Lossy for non-UTF-8 paths, for logs and messages only
impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for CanonicalPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<Vec<u8>> for CanonicalPath {
    fn from(path: Vec<u8>) -> Self {
        Self(path)
    }
}

#[cfg(unix)]
fn os_path(raw: &[u8]) -> Result<&Path, PublicationError> {
    use std::os::unix::ffi::OsStrExt;
    Ok(Path::new(std::ffi::OsStr::from_bytes(raw)))
}

#[cfg(not(unix))]
fn os_path(raw: &[u8]) -> Result<&Path, PublicationError> {
    std::str::from_utf8(raw)
        .map(Path::new)
        .map_err(|_| PublicationError::InvalidPath(format!("{} is not UTF-8", String::from_utf8_lossy(raw))))
}

/// Local paths stay under the root: no `..`, no absolute components
fn relative_path(raw: &[u8]) -> Result<PathBuf, PublicationError> {
    if raw.is_empty() {
        return Err(PublicationError::InvalidPath("empty path".to_string()));
    }
    let display = || String::from_utf8_lossy(raw).into_owned();

    let mut path = PathBuf::new();
    for component in os_path(raw)?.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PublicationError::InvalidPath(format!(
                    "{} escapes the local directory",
                    display()
                )));
            }
        }
    }

    if path.as_os_str().is_empty() {
        return Err(PublicationError::InvalidPath(format!("{} names no file", display())));
    }
    Ok(path)
}

/// Where the bytes of a publication live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Relative to the local directory root
    File(PathBuf),
    S3 { bucket: String, key: String },
    Gs { bucket: String, key: String },
    Http(Url),
}

impl Locator {
    pub fn scheme(&self) -> Scheme {
        match self {
            Locator::File(_) => Scheme::File,
            Locator::S3 { .. } => Scheme::S3,
            Locator::Gs { .. } => Scheme::Gs,
            Locator::Http(url) if url.scheme() == "https" => Scheme::Https,
            Locator::Http(_) => Scheme::Http,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.scheme().is_remote()
    }

    /// Last path segment, used as a fallback title
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Locator::File(path) => path.file_name().and_then(|n| n.to_str()),
            Locator::S3 { key, .. } | Locator::Gs { key, .. } => key.rsplit('/').next(),
            Locator::Http(url) => url.path_segments().and_then(|mut s| s.next_back()),
        }
        .filter(|name| !name.is_empty())
    }
}
