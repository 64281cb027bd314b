use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use reqwest::Method;
use std::net::SocketAddr;
use webpub_server::client::{ClientOptions, SafeFetchClient, Whitelist};
use webpub_server::error::{FetchError, PublicationError};

fn redirect(location: String) -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, location)])
}

// Local origin. The gate itself is bypassed so 127.0.0.1 is reachable; the
// allow-list still applies to every hop.
async fn spawn_origin() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let app = Router::new()
        .route("/books/a.epub", get(|| async { "epub bytes" }))
        .route("/other/a.epub", get(|| async { "other bytes" }))
        .route(
            "/books/inside",
            get(move || async move { redirect(format!("http://{}/books/a.epub", addr)) }),
        )
        .route(
            "/books/escape",
            get(move || async move { redirect(format!("http://{}/other/a.epub", addr)) }),
        )
        .route(
            "/books/offsite",
            get(move || async move { redirect(format!("http://localhost:{}/books/a.epub", addr.port())) }),
        )
        .route(
            "/books/loop",
            get(move || async move { redirect(format!("http://{}/books/loop", addr)) }),
        )
        .route(
            "/books/streamed",
            get(|| async {
                let chunks = (0..4).map(|_| Ok::<_, std::io::Error>(vec![b'x'; 16]));
                axum::body::Body::from_stream(futures::stream::iter(chunks))
            }),
        )
        .route(
            "/books/whoami",
            get(|headers: HeaderMap| async move {
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("anonymous")
                    .to_string()
            }),
        );

    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn client_for(addr: SocketAddr, authorization: Option<&str>) -> SafeFetchClient {
    SafeFetchClient::new(ClientOptions {
        authorization: authorization.map(String::from),
        whitelist: Whitelist::parse(&[format!("http://{}/books", addr)]).unwrap(),
        unsafe_requests: true,
    })
    .unwrap()
}

#[tokio::test]
async fn test_whitelisted_path_is_fetched() {
    let addr = spawn_origin().await;
    let client = client_for(addr, None);

    let body = client.get_bytes(&format!("http://{}/books/a.epub", addr)).await.unwrap();
    assert_eq!(&body[..], b"epub bytes");
}

#[tokio::test]
async fn test_path_outside_whitelist_is_refused() {
    let addr = spawn_origin().await;
    let client = client_for(addr, None);

    let err = client
        .get_bytes(&format!("http://{}/other/a.epub", addr))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NotWhitelisted(_)));
    assert!(matches!(PublicationError::from(err), PublicationError::Refused(_)));
}

#[tokio::test]
async fn test_redirect_within_whitelist_is_followed() {
    let addr = spawn_origin().await;
    let client = client_for(addr, None);

    let body = client.get_bytes(&format!("http://{}/books/inside", addr)).await.unwrap();
    assert_eq!(&body[..], b"epub bytes");
}

#[tokio::test]
async fn test_redirect_out_of_whitelist_fails_closed() {
    let addr = spawn_origin().await;
    let client = client_for(addr, None);

    for path in ["/books/escape", "/books/offsite"] {
        let err = client
            .get_bytes(&format!("http://{}{}", addr, path))
            .await
            .unwrap_err();
        assert!(matches!(&err, FetchError::Http(e) if e.is_redirect()), "{}: {:?}", path, err);
        assert!(err.is_safety_violation());
        assert!(format!("{:?}", err).contains("NotWhitelisted"));
    }
}

#[tokio::test]
async fn test_redirect_limit() {
    let addr = spawn_origin().await;
    let client = client_for(addr, None);

    let err = client
        .get_bytes(&format!("http://{}/books/loop", addr))
        .await
        .unwrap_err();
    assert!(matches!(&err, FetchError::Http(e) if e.is_redirect()));
}

#[tokio::test]
async fn test_authorization_sent_on_clone() {
    let addr = spawn_origin().await;
    let client = client_for(addr, Some("Bearer library-token"));

    let request = client
        .request(Method::GET, &format!("http://{}/books/whoami", addr))
        .unwrap();
    let response = client.execute(&request).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "Bearer library-token");

    // The caller's request never gains the header
    assert!(request.headers().get(header::AUTHORIZATION).is_none());
}

#[tokio::test]
async fn test_gate_refuses_loopback_when_safe() {
    let addr = spawn_origin().await;
    let client = SafeFetchClient::new(ClientOptions {
        whitelist: Whitelist::parse(&[format!("http://{}/books", addr)]).unwrap(),
        ..Default::default()
    })
    .unwrap();

    let err = client
        .get_bytes(&format!("http://{}/books/a.epub", addr))
        .await
        .unwrap_err();
    // Random test port is refused before the address is even considered
    assert!(matches!(err, FetchError::UnsafePort(_) | FetchError::UnsafeAddress(_)));
}

#[tokio::test]
async fn test_body_size_limit() {
    let addr = spawn_origin().await;
    let client = client_for(addr, None);

    let sized = format!("http://{}/books/a.epub", addr);
    let err = client.get_bytes_limited(&sized, 4).await.unwrap_err();
    assert!(matches!(err, FetchError::TooLarge { limit: 4, .. }));
    assert!(matches!(PublicationError::from(err), PublicationError::Unsupported(_)));
    assert_eq!(&client.get_bytes_limited(&sized, 10).await.unwrap()[..], b"epub bytes");

    // No Content-Length: the limit applies while streaming
    let streamed = format!("http://{}/books/streamed", addr);
    let err = client.get_bytes_limited(&streamed, 40).await.unwrap_err();
    assert!(matches!(err, FetchError::TooLarge { .. }));
    assert_eq!(client.get_bytes_limited(&streamed, 64).await.unwrap().len(), 64);
}
