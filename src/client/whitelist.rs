//! Host allow-list for outbound HTTP requests

use url::Url;

use crate::error::ConfigError;

/// A single allow-list entry: a host (with its explicit port, if any) and an
/// optional path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistEntry {
    pub host: String,
    pub path: Option<String>,
}

impl WhitelistEntry {
    /// Parse an entry such as `https://na1.storage.example.com/the/path`
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidWhitelistEntry {
            entry: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("must have http or https scheme"));
        }
        let host = authority(&url).ok_or_else(|| invalid("must have a host"))?;
        let path = match url.path() {
            "" | "/" => None,
            p => Some(p.to_string()),
        };

        Ok(Self { host, path })
    }

    fn matches(&self, url: &Url) -> bool {
        if authority(url).as_deref() != Some(self.host.as_str()) {
            return false;
        }
        match &self.path {
            None => true,
            Some(prefix) => url.path().starts_with(prefix.as_str()),
        }
    }
}

/// Ordered allow-list. An empty list allows every host.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
}

impl Whitelist {
    pub fn new(entries: Vec<WhitelistEntry>) -> Self {
        Self { entries }
    }

    /// Parse every raw entry, failing on the first invalid one
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, ConfigError> {
        let entries = raw
            .iter()
            .map(|s| WhitelistEntry::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }

    /// Check whether a URL has a matching entry
    pub fn allows(&self, url: &Url) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|entry| entry.matches(url))
    }
}

/// `host` or `host:port` when the URL carries a non-default port
fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_empty_whitelist_allows_everything() {
        let whitelist = Whitelist::default();
        assert!(whitelist.allows(&url("https://anything.example.org/a.epub")));
    }

    #[test]
    fn test_path_prefix() {
        let whitelist = Whitelist::parse(&["https://example.com/books"]).unwrap();

        assert!(whitelist.allows(&url("https://example.com/books/a.epub")));
        assert!(!whitelist.allows(&url("https://example.com/other/a.epub")));
        assert!(!whitelist.allows(&url("https://evil.example.net/books/a.epub")));
    }

    #[test]
    fn test_host_only_entry() {
        let whitelist = Whitelist::parse(&["http://1.1.1.1"]).unwrap();
        assert_eq!(whitelist.entries()[0].path, None);
        assert!(whitelist.allows(&url("http://1.1.1.1/any/path.pdf")));
    }

    #[test]
    fn test_port_is_part_of_host() {
        let whitelist = Whitelist::parse(&["http://127.0.0.1:8080/"]).unwrap();

        assert!(whitelist.allows(&url("http://127.0.0.1:8080/x")));
        assert!(!whitelist.allows(&url("http://127.0.0.1/x")));
        assert!(!whitelist.allows(&url("http://localhost:8080/x")));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(WhitelistEntry::parse("ftp://example.com").is_err());
        assert!(WhitelistEntry::parse("not a url").is_err());
        assert!(WhitelistEntry::parse("file:///etc/passwd").is_err());
    }
}
