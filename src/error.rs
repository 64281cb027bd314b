//! Error types for the WebPub server

use std::net::IpAddr;
use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type, converted to an HTTP response at the handler boundary
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Publication(#[from] PublicationError),
}

/// Startup configuration errors. The process refuses to start on any of these,
/// except whitelist problems which only disable the HTTP backend.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid scheme {0:?}, acceptable values: file, http, https, s3, gs")]
    UnknownScheme(String),

    #[error("file scheme is enabled, but no local directory was specified with WEBPUB_FILE_DIRECTORY")]
    MissingDirectory,

    #[error("given directory {0} does not exist")]
    DirectoryNotFound(PathBuf),

    #[error("given path {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("invalid URL in whitelist: {entry}: {reason}")]
    InvalidWhitelistEntry { entry: String, reason: String },

    #[error("invalid access mode {0:?}, acceptable values: base64, jwt, jwks")]
    UnknownMode(String),

    #[error("failed to decode hex-encoded JWT shared secret: {0}")]
    InvalidSecret(#[from] hex::FromHexError),

    #[error("length of JWT shared secret is less than 8 bytes")]
    SecretTooShort,

    #[error("jwks-url must be specified in jwks mode")]
    MissingJwksUrl,

    #[error("jwks mode requires the http or https backend client")]
    JwksWithoutClient,

    #[error("failed to load JWKS from {url}: {reason}")]
    JwksUnavailable { url: String, reason: String },

    #[error("S3 credentials retrieval failed: {0}")]
    S3Credentials(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Outbound fetch failures. Safety violations abort before any bytes are sent.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {0} is not allowed by the whitelist")]
    NotWhitelisted(String),

    #[error("{0} is not a public IP address")]
    UnsafeAddress(IpAddr),

    #[error("{0} is not a safe port number")]
    UnsafePort(u16),

    #[error("{0} is not a supported URL scheme")]
    UnsupportedScheme(String),

    #[error("URL {0} has no host")]
    MissingHost(String),

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("remote server answered {status} for {url}")]
    Status { status: reqwest::StatusCode, url: String },

    #[error("{url} is larger than the {limit} byte limit")]
    TooLarge { url: String, limit: u64 },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl FetchError {
    /// True when the fetch was refused by the allow-list or connection gate
    pub fn is_safety_violation(&self) -> bool {
        match self {
            FetchError::NotWhitelisted(_)
            | FetchError::UnsafeAddress(_)
            | FetchError::UnsafePort(_)
            | FetchError::UnsupportedScheme(_)
            | FetchError::MissingHost(_) => true,
            FetchError::Http(e) => e.is_redirect(),
            _ => false,
        }
    }
}

/// Failure to resolve or open a publication.
///
/// Cloneable so that a single failed construction can be handed to every
/// request waiting on the same cache key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublicationError {
    #[error("publication not found: {0}")]
    NotFound(String),

    #[error("invalid publication path: {0}")]
    InvalidPath(String),

    #[error("scheme {0} is not enabled")]
    SchemeDisabled(String),

    #[error("unsupported publication format: {0}")]
    Unsupported(String),

    #[error("fetch refused: {0}")]
    Refused(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("resource not found in publication: {0}")]
    ResourceNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PublicationError {
    pub fn status(&self) -> StatusCode {
        match self {
            PublicationError::NotFound(_) | PublicationError::ResourceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PublicationError::InvalidPath(_) | PublicationError::SchemeDisabled(_) => {
                StatusCode::BAD_REQUEST
            }
            PublicationError::Refused(_) => StatusCode::FORBIDDEN,
            PublicationError::Unsupported(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PublicationError::Backend(_) => StatusCode::BAD_GATEWAY,
            PublicationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PublicationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<FetchError> for PublicationError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Status { status, url } if status == reqwest::StatusCode::NOT_FOUND => {
                PublicationError::NotFound(url)
            }
            e @ FetchError::TooLarge { .. } => PublicationError::Unsupported(e.to_string()),
            e if e.is_safety_violation() => PublicationError::Refused(e.to_string()),
            e => PublicationError::Backend(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for PublicationError {
    fn from(err: tokio::task::JoinError) -> Self {
        PublicationError::Internal(format!("publication construction aborted: {}", err))
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            // Token failures are answered as plain text with the mapped status
            AppError::Auth(e) => return (e.status(), e.to_string()).into_response(),
            AppError::Publication(e) => {
                let status = e.status();
                if status.is_server_error() {
                    tracing::error!(error = %e, "Publication error");
                } else {
                    tracing::debug!(error = %e, "Publication request rejected");
                }
                let error_type = match e {
                    PublicationError::NotFound(_) | PublicationError::ResourceNotFound(_) => {
                        "not_found"
                    }
                    PublicationError::InvalidPath(_) | PublicationError::SchemeDisabled(_) => {
                        "bad_request"
                    }
                    PublicationError::Refused(_) => "fetch_refused",
                    PublicationError::Unsupported(_) => "unsupported_format",
                    PublicationError::Backend(_) | PublicationError::Timeout(_) => "backend_error",
                    PublicationError::Internal(_) => "internal_error",
                };
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "An internal error occurred".to_string()
                } else {
                    e.to_string()
                };
                (status, error_type, message)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
