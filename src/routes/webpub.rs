//! Publication routes
//!
//! `/webpub/{token}` (with or without a trailing slash) redirects to the
//! manifest, `/webpub/{token}/{asset}` serves the manifest or a resource of
//! the publication the token grants.

use std::collections::HashMap;

use axum::{
    body::{Body, HttpBody},
    extract::{OriginalUri, Path, Request, State},
    http::{header, HeaderValue, Response as HttpResponse, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use tower_http::compression::{
    predicate::{Predicate, SizeAbove},
    CompressionLayer,
};

use crate::error::{AppError, PublicationError, Result};
use crate::publication::{MANIFEST_HREF, WEBPUB_MEDIA_TYPE};
use crate::state::AppState;
use crate::storage::CanonicalPath;

/// Content types worth compressing
pub const COMPRESSIBLE_MIMES: &[&str] = &[
    "application/javascript",
    "application/json",
    "application/ld+json",
    "application/oebps-package+xml",
    "application/smil+xml",
    "application/webpub+json",
    "application/x-dtbncx+xml",
    "application/xhtml+xml",
    "application/xml",
    "font/otf",
    "font/ttf",
    "image/svg+xml",
    "text/css",
    "text/html",
    "text/javascript",
    "text/plain",
    "text/xml",
];

/// Compress only the content types in [`COMPRESSIBLE_MIMES`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressibleMimes;

impl Predicate for CompressibleMimes {
    fn should_compress<B>(&self, response: &HttpResponse<B>) -> bool
    where
        B: HttpBody,
    {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
            .map_or(false, |essence| COMPRESSIBLE_MIMES.contains(&essence.as_str()))
    }
}

/// Create the publication router
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/:token", get(redirect_to_manifest))
        .route("/:token/", get(redirect_to_manifest))
        .route("/:token/*asset", get(serve))
        .route_layer(middleware::from_fn_with_state(state, resolve_token))
        .layer(CompressionLayer::new().compress_when(SizeAbove::new(256).and(CompressibleMimes)))
}

/// Turn the `{token}` segment into a canonical path, or answer with the
/// validator's status
async fn resolve_token(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = params.get("token").map(String::as_str).unwrap_or_default();
    match state.validator().validate(token) {
        Ok(path) => {
            request.extensions_mut().insert(path);
            next.run(request).await
        }
        Err(e) => {
            tracing::debug!(error = %e, "Token rejected");
            AppError::from(e).into_response()
        }
    }
}

/// The manifest is the single documented entry point
async fn redirect_to_manifest(OriginalUri(uri): OriginalUri) -> Response {
    let location = format!("{}/{}", uri.path().trim_end_matches('/'), MANIFEST_HREF);
    match HeaderValue::from_str(&location) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(e) => AppError::Internal(format!("invalid redirect location: {}", e)).into_response(),
    }
}

async fn serve(
    State(state): State<AppState>,
    Extension(path): Extension<CanonicalPath>,
    Path((_token, asset)): Path<(String, String)>,
) -> Result<Response> {
    let publication = state.publication(&path).await?;

    if asset == MANIFEST_HREF {
        let body = publication.manifest().to_json(state.config().server.indent.as_deref())?;
        return build_response(WEBPUB_MEDIA_TYPE, Body::from(body));
    }

    // Inflating an entry can be slow, keep it off the async workers
    let resource = tokio::task::spawn_blocking(move || publication.resource(&asset))
        .await
        .map_err(PublicationError::from)??;
    build_response(&resource.media_type, Body::from(resource.data))
}

fn build_response(content_type: &str, body: Body) -> Result<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(content_type: &str) -> HttpResponse<Body> {
        HttpResponse::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_compression_predicate() {
        assert!(CompressibleMimes.should_compress(&response_with("application/webpub+json")));
        assert!(CompressibleMimes.should_compress(&response_with("text/html; charset=utf-8")));
        assert!(CompressibleMimes.should_compress(&response_with("Application/XHTML+XML")));
        assert!(!CompressibleMimes.should_compress(&response_with("image/jpeg")));
        assert!(!CompressibleMimes.should_compress(&response_with("application/zip")));
        assert!(!CompressibleMimes.should_compress(&HttpResponse::new(Body::empty())));
    }
}
