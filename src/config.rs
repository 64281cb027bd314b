//! Configuration management for the WebPub server
//!
//! Built once at startup from environment variables (a `.env` file is loaded
//! first by the binary) and passed explicitly to every component.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::storage::{ArchiveConfig, Scheme};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// Schemes requested by the operator. A backend may still end up
    /// unavailable, see [`crate::storage::BackendRouter::accepts_scheme`].
    pub schemes: Vec<Scheme>,
    pub file_directory: Option<PathBuf>,
    pub s3: S3Config,
    pub gcs: GcsConfig,
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub debug: bool,
    /// Manifest JSON indentation, compact when unset
    pub indent: Option<String>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub use_path_style: bool,
}

impl S3Config {
    fn is_configured(&self) -> bool {
        self.endpoint.is_some() || self.access_key.is_some() || self.secret_key.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcsConfig {
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    pub authorization: Option<String>,
    pub whitelist: Vec<String>,
    pub unsafe_requests: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Base64,
    Jwt,
    Jwks,
}

impl FromStr for AccessMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base64" => Ok(AccessMode::Base64),
            "jwt" => Ok(AccessMode::Jwt),
            "jwks" => Ok(AccessMode::Jwks),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AccessMode,
    /// Hex-encoded; a random secret is generated when unset
    pub jwt_shared_secret: Option<String>,
    pub jwks_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                address: "localhost".to_string(),
                port: 15080,
                debug: false,
                indent: None,
                log_format: LogFormat::Text,
            },
            schemes: vec![Scheme::File],
            file_directory: None,
            s3: S3Config {
                region: "auto".to_string(),
                ..Default::default()
            },
            gcs: GcsConfig::default(),
            http: HttpConfig::default(),
            auth: AuthConfig {
                mode: AccessMode::Base64,
                jwt_shared_secret: None,
                jwks_url: None,
            },
            archive: ArchiveConfig::default(),
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    ///
    /// Only parses; call [`Config::validate`] once logging is up.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(schemes) = var("WEBPUB_SCHEMES") {
            config.schemes = split_list(&schemes)
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<Scheme>, _>>()?;
            config.schemes.dedup();
        }

        if let Some(address) = var("WEBPUB_ADDRESS") {
            config.server.address = address;
        }
        if let Some(port) = var("WEBPUB_PORT") {
            config.server.port = parse_number("WEBPUB_PORT", &port)?;
        }
        if let Some(debug) = var("WEBPUB_DEBUG") {
            config.server.debug = parse_bool("WEBPUB_DEBUG", &debug)?;
        }
        // Whitespace is the point of this one, so read it raw
        config.server.indent = lookup("WEBPUB_INDENT").filter(|v| !v.is_empty());
        if let Some(format) = var("WEBPUB_LOG_FORMAT") {
            config.server.log_format = match format.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "WEBPUB_LOG_FORMAT",
                        value: format,
                    })
                }
            };
        }

        config.file_directory = var("WEBPUB_FILE_DIRECTORY").map(PathBuf::from);

        config.s3.endpoint = var("WEBPUB_S3_ENDPOINT");
        if let Some(region) = var("WEBPUB_S3_REGION") {
            config.s3.region = region;
        }
        config.s3.access_key = var("WEBPUB_S3_ACCESS_KEY");
        config.s3.secret_key = var("WEBPUB_S3_SECRET_KEY");
        if let Some(path_style) = var("WEBPUB_S3_USE_PATH_STYLE") {
            config.s3.use_path_style = parse_bool("WEBPUB_S3_USE_PATH_STYLE", &path_style)?;
        }

        config.gcs.access_token = var("WEBPUB_GCS_ACCESS_TOKEN");

        config.http.authorization = var("WEBPUB_HTTP_AUTHORIZATION");
        config.http.whitelist = var("WEBPUB_HTTP_HOST_WHITELIST")
            .map(|v| split_list(&v))
            .unwrap_or_default();
        if let Some(unsafe_requests) = var("WEBPUB_HTTP_UNSAFE_REQUESTS") {
            config.http.unsafe_requests = parse_bool("WEBPUB_HTTP_UNSAFE_REQUESTS", &unsafe_requests)?;
        }

        if let Some(mode) = var("WEBPUB_MODE") {
            config.auth.mode = mode.parse()?;
        }
        config.auth.jwt_shared_secret = var("WEBPUB_JWT_SHARED_SECRET");
        config.auth.jwks_url = var("WEBPUB_JWKS_URL");

        if let Some(timeout) = var("WEBPUB_REMOTE_ARCHIVE_TIMEOUT") {
            config.archive.timeout = Duration::from_secs(parse_number("WEBPUB_REMOTE_ARCHIVE_TIMEOUT", &timeout)?);
        }
        if let Some(size) = var("WEBPUB_REMOTE_ARCHIVE_CACHE_SIZE") {
            config.archive.cache_size_threshold = parse_number("WEBPUB_REMOTE_ARCHIVE_CACHE_SIZE", &size)?;
        }
        if let Some(count) = var("WEBPUB_REMOTE_ARCHIVE_CACHE_COUNT") {
            config.archive.cache_count_threshold = parse_number("WEBPUB_REMOTE_ARCHIVE_CACHE_COUNT", &count)?;
        }
        if let Some(all) = var("WEBPUB_REMOTE_ARCHIVE_CACHE_ALL") {
            config.archive.cache_all_threshold = parse_number("WEBPUB_REMOTE_ARCHIVE_CACHE_ALL", &all)?;
        }
        if let Some(max) = var("WEBPUB_MAX_PUBLICATION_SIZE") {
            config.archive.max_size = parse_number("WEBPUB_MAX_PUBLICATION_SIZE", &max)?;
        }

        Ok(config)
    }

    pub fn is_enabled(&self, scheme: Scheme) -> bool {
        self.schemes.contains(&scheme)
    }

    /// Check cross-field rules and the local directory
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.file_directory, self.is_enabled(Scheme::File)) {
            (Some(dir), true) => {
                let metadata = std::fs::metadata(dir).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ConfigError::DirectoryNotFound(dir.clone())
                    } else {
                        ConfigError::Stat {
                            path: dir.clone(),
                            source: e,
                        }
                    }
                })?;
                if !metadata.is_dir() {
                    return Err(ConfigError::NotADirectory(dir.clone()));
                }
            }
            (Some(_), false) => {
                tracing::warn!("Local directory specified, but file scheme is not enabled");
            }
            (None, true) => return Err(ConfigError::MissingDirectory),
            (None, false) => {}
        }

        if self.s3.is_configured() && !self.is_enabled(Scheme::S3) {
            tracing::warn!("S3-related settings are set, but S3 scheme is not enabled");
        }

        if self.auth.mode == AccessMode::Jwks && self.auth.jwks_url.is_none() {
            return Err(ConfigError::MissingJwksUrl);
        }
        if let Some(secret) = &self.auth.jwt_shared_secret {
            if self.auth.mode == AccessMode::Jwt && hex::decode(secret)?.len() < 8 {
                return Err(ConfigError::SecretTooShort);
            }
        }

        Ok(())
    }

    /// Directory the file scheme serves from, if enabled
    pub fn local_directory(&self) -> Option<&PathBuf> {
        self.file_directory.as_ref().filter(|_| self.is_enabled(Scheme::File))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let config = Config::from_lookup(|name| vars.get(name).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults_need_directory() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingDirectory)));
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&[("WEBPUB_FILE_DIRECTORY", dir.path().to_str().unwrap())]).unwrap();

        assert_eq!(config.server.address, "localhost");
        assert_eq!(config.server.port, 15080);
        assert_eq!(config.schemes, vec![Scheme::File]);
        assert_eq!(config.auth.mode, AccessMode::Base64);
        assert_eq!(config.s3.region, "auto");
        assert_eq!(config.archive, ArchiveConfig::default());
        assert_eq!(config.server.log_format, LogFormat::Text);
        assert!(config.local_directory().is_some());
    }

    #[test]
    fn test_schemes_and_modes() {
        let config = load(&[
            ("WEBPUB_SCHEMES", "HTTPS, s3"),
            ("WEBPUB_MODE", "JWT"),
            ("WEBPUB_JWT_SHARED_SECRET", "00112233445566778899"),
            ("WEBPUB_HTTP_HOST_WHITELIST", "https://example.com/books, https://cdn.example.com"),
            ("WEBPUB_REMOTE_ARCHIVE_TIMEOUT", "5"),
            ("WEBPUB_INDENT", "  "),
            ("WEBPUB_MAX_PUBLICATION_SIZE", "1048576"),
        ])
        .unwrap();

        assert_eq!(config.schemes, vec![Scheme::Https, Scheme::S3]);
        assert_eq!(config.auth.mode, AccessMode::Jwt);
        assert_eq!(config.http.whitelist.len(), 2);
        assert_eq!(config.archive.timeout, Duration::from_secs(5));
        assert_eq!(config.server.indent.as_deref(), Some("  "));
        assert_eq!(config.archive.max_size, 1024 * 1024);
        assert!(config.local_directory().is_none());
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            load(&[("WEBPUB_SCHEMES", "file,ftp")]),
            Err(ConfigError::UnknownScheme(s)) if s == "ftp"
        ));
        assert!(matches!(
            load(&[("WEBPUB_SCHEMES", "https"), ("WEBPUB_MODE", "oauth")]),
            Err(ConfigError::UnknownMode(_))
        ));
        assert!(matches!(
            load(&[("WEBPUB_SCHEMES", "https"), ("WEBPUB_MODE", "jwks")]),
            Err(ConfigError::MissingJwksUrl)
        ));
        assert!(matches!(
            load(&[("WEBPUB_SCHEMES", "https"), ("WEBPUB_MODE", "jwt"), ("WEBPUB_JWT_SHARED_SECRET", "zz")]),
            Err(ConfigError::InvalidSecret(_))
        ));
        assert!(matches!(
            load(&[("WEBPUB_SCHEMES", "https"), ("WEBPUB_MODE", "jwt"), ("WEBPUB_JWT_SHARED_SECRET", "0011")]),
            Err(ConfigError::SecretTooShort)
        ));
        assert!(matches!(
            load(&[("WEBPUB_SCHEMES", "https"), ("WEBPUB_PORT", "http")]),
            Err(ConfigError::InvalidValue { var: "WEBPUB_PORT", .. })
        ));
    }

    #[test]
    fn test_directory_checks() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            load(&[("WEBPUB_FILE_DIRECTORY", missing.to_str().unwrap())]),
            Err(ConfigError::DirectoryNotFound(_))
        ));

        let file = dir.path().join("book.epub");
        std::fs::write(&file, b"PK").unwrap();
        assert!(matches!(
            load(&[("WEBPUB_FILE_DIRECTORY", file.to_str().unwrap())]),
            Err(ConfigError::NotADirectory(_))
        ));
    }
}
