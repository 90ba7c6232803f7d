use axum::body::Body;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{self, StreamExt};
use hashtag_counter::source::{HttpPostSource, PostSource, SourceError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn posts(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer secret");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let track = params.get("track").cloned().unwrap_or_default();
    let body = format!(
        "{{\"text\":\"#{track} first\"}}\r\n\r\n{{\"text\":\"#{track} second\"}}\n"
    );
    body.into_response()
}

#[tokio::test]
async fn test_streams_lines_for_track() {
    let addr = serve(Router::new().route("/stream", get(posts))).await;
    let source = HttpPostSource::new(
        &format!("http://{}/stream", addr),
        "secret",
        Duration::from_secs(5),
    )
    .unwrap();

    let lines: Vec<String> = source
        .connect("charity")
        .await
        .unwrap()
        .map(|line| line.unwrap())
        .collect()
        .await;

    assert_eq!(
        lines,
        vec![
            "{\"text\":\"#charity first\"}".to_string(),
            "{\"text\":\"#charity second\"}".to_string()
        ]
    );
}

#[tokio::test]
async fn test_status_codes_are_classified() {
    let app = Router::new()
        .route("/limited", get(|| async { StatusCode::from_u16(420).unwrap() }))
        .route("/busy", get(|| async { StatusCode::TOO_MANY_REQUESTS }))
        .route("/stream", get(posts));
    let addr = serve(app).await;

    let connect = |path: &str, token: &str| {
        HttpPostSource::new(&format!("http://{}{}", addr, path), token, Duration::from_secs(5)).unwrap()
    };

    let limited = connect("/limited", "secret").connect("x").await;
    assert!(matches!(limited, Err(SourceError::RateLimited(420))));

    let busy = connect("/busy", "secret").connect("x").await;
    assert!(matches!(busy, Err(SourceError::RateLimited(429))));

    let unauthorized = connect("/stream", "wrong").connect("x").await;
    assert!(matches!(unauthorized, Err(SourceError::Status(401))));
}

#[tokio::test]
async fn test_stalled_stream_times_out() {
    let app = Router::new().route(
        "/stall",
        get(|| async {
            let chunks = stream::once(async { Ok::<_, std::io::Error>("{\"text\":\"#early\"}\n") })
                .chain(stream::pending());
            Body::from_stream(chunks)
        }),
    );
    let addr = serve(app).await;
    let source = HttpPostSource::new(
        &format!("http://{}/stall", addr),
        "secret",
        Duration::from_millis(200),
    )
    .unwrap();

    let mut stream = source.connect("x").await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "{\"text\":\"#early\"}");
    assert!(matches!(stream.next().await, Some(Err(SourceError::Timeout(_)))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_unreachable_upstream_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = HttpPostSource::new(&format!("http://{}/stream", addr), "secret", Duration::from_secs(1)).unwrap();
    assert!(matches!(source.connect("x").await, Err(SourceError::Transport(_))));
}
