//! SSRF-guarded HTTP client
//!
//! Used for the `http`/`https` publication backends and for key-set retrieval.
//!
//! - The allow-list and connection gate run before a request is handed to the
//!   transport, and again on every redirect hop.
//! - Host names resolve through [`SafeResolver`], so a name pointing at a
//!   private address never gets dialed.
//! - The configured `Authorization` value is added to a clone of each request.

mod safe;
mod whitelist;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{redirect, Client, Method, Request, Response};
use url::Url;

use crate::error::{ConfigError, FetchError};

pub use safe::{is_public_ip, RequestGate, SafeResolver, UnsafeResolution};
pub use whitelist::{Whitelist, WhitelistEntry};

/// Maximum redirect hops before the fetch fails
pub const MAX_REDIRECTS: usize = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Construction options for [`SafeFetchClient`]
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Value sent as the `Authorization` header on every request
    pub authorization: Option<String>,
    pub whitelist: Whitelist,
    /// Disable the IP/port gate. Only for deployments that fully control the
    /// paths handed to the server.
    pub unsafe_requests: bool,
}

/// HTTP client that refuses to act as a proxy into private networks
#[derive(Clone)]
pub struct SafeFetchClient {
    client: Client,
    gate: Arc<RequestGate>,
    authorization: Option<HeaderValue>,
}

impl SafeFetchClient {
    pub fn new(options: ClientOptions) -> Result<Self, ConfigError> {
        let gate = Arc::new(RequestGate::new(options.whitelist, options.unsafe_requests));

        let authorization = options
            .authorization
            .filter(|value| !value.is_empty())
            .map(|value| {
                let mut header = HeaderValue::from_str(&value)
                    .map_err(|e| ConfigError::HttpClient(format!("invalid authorization header: {}", e)))?;
                header.set_sensitive(true);
                Ok::<_, ConfigError>(header)
            })
            .transpose()?;

        let redirect_gate = gate.clone();
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(format!("stopped after {} redirects", MAX_REDIRECTS));
            }
            match redirect_gate.check(attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(e) => {
                    tracing::warn!(url = %attempt.url(), error = %e, "Refusing redirect");
                    attempt.error(e)
                }
            }
        });

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 2;

        let mut builder = Client::builder()
            .user_agent(concat!("webpub-server/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(KEEP_ALIVE)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(workers + 1)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .redirect(policy);

        if !options.unsafe_requests {
            // A proxy would be dialed instead of the checked destination
            builder = builder.no_proxy().dns_resolver(Arc::new(SafeResolver));
        }

        let client = builder
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            gate,
            authorization,
        })
    }

    /// Whether the IP/port gate is disabled
    pub fn is_unsafe(&self) -> bool {
        self.gate.is_bypassed()
    }

    /// Run the allow-list and connection gate for a URL without sending anything
    pub fn check(&self, url: &Url) -> Result<(), FetchError> {
        self.gate.check(url)
    }

    /// Build a request that can later be passed to [`SafeFetchClient::execute`]
    pub fn request(&self, method: Method, url: &str) -> Result<Request, FetchError> {
        let url = parse_url(url)?;
        Ok(Request::new(method, url))
    }

    /// Send a request. The caller's request is left untouched; the
    /// authorization header goes on a clone.
    pub async fn execute(&self, request: &Request) -> Result<Response, FetchError> {
        self.gate.check(request.url())?;

        let mut outbound = request.try_clone().ok_or_else(|| FetchError::InvalidUrl {
            url: request.url().to_string(),
            reason: "streaming request bodies cannot be replayed".to_string(),
        })?;
        if let Some(authorization) = &self.authorization {
            outbound.headers_mut().insert(AUTHORIZATION, authorization.clone());
        }

        self.client.execute(outbound).await.map_err(classify)
    }

    /// GET a URL, failing on non-success statuses
    pub async fn get(&self, url: &str) -> Result<Response, FetchError> {
        let request = self.request(Method::GET, url)?;
        let response = self.execute(&request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }

    /// GET a URL and collect the whole body
    pub async fn get_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        self.get_bytes_limited(url, u64::MAX).await
    }

    /// GET a URL, failing once the body exceeds `limit` bytes
    pub async fn get_bytes_limited(&self, url: &str, limit: u64) -> Result<Bytes, FetchError> {
        let response = self.get(url).await?;
        collect_limited(response, limit).await
    }
}

/// Read a response body into memory, at most `limit` bytes of it
pub async fn collect_limited(mut response: Response, limit: u64) -> Result<Bytes, FetchError> {
    let too_large = |response: &Response| FetchError::TooLarge {
        url: response.url().to_string(),
        limit,
    };
    if response.content_length().is_some_and(|length| length > limit) {
        return Err(too_large(&response));
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if (body.len() + chunk.len()) as u64 > limit {
            return Err(too_large(&response));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Surface resolver refusals as gate errors rather than generic transport failures
fn classify(err: reqwest::Error) -> FetchError {
    match safe::unsafe_resolution(&err) {
        Some(address) => FetchError::UnsafeAddress(address),
        None => FetchError::Http(err),
    }
}
