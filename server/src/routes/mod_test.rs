use super::*;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;

use crate::relay::{Relay, spawn_relay};
use crate::store::StateStore;

fn test_app(root: &std::path::Path) -> Router {
    let (relay, _task) = spawn_relay(Relay::new(StateStore::new()));
    app(AppState::new(relay, root))
}

fn site() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("index.html"), "<h1>clocks</h1>").expect("write index");
    std::fs::create_dir(dir.path().join("faces")).expect("mkdir");
    std::fs::write(dir.path().join("faces").join("index.html"), "faces").expect("write nested index");
    std::fs::write(dir.path().join("style.css"), "body{}").expect("write css");
    dir
}

async fn get(app: Router, uri: &str) -> axum::response::Response {
    app.oneshot(Request::get(uri).body(Body::empty()).expect("request"))
        .await
        .expect("router is infallible")
}

#[tokio::test]
async fn plain_get_on_root_serves_index() {
    let dir = site();
    let response = get(test_app(dir.path()), "/").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&body[..], b"<h1>clocks</h1>");
}

#[tokio::test]
async fn directory_request_serves_its_index() {
    let dir = site();
    let response = get(test_app(dir.path()), "/faces/").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    assert_eq!(&body[..], b"faces");
}

#[tokio::test]
async fn css_has_its_content_type() {
    let dir = site();
    let response = get(test_app(dir.path()), "/style.css").await;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().expect("header");
    assert!(content_type.starts_with("text/css"), "got {content_type}");
}

#[tokio::test]
async fn healthz_needs_no_assets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let response = get(test_app(dir.path()), "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let dir = site();
    let response = get(test_app(dir.path()), "/missing.js").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
