use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use courier_server::auth::SmsGateway;
use courier_server::config::{AppState, ChatServerConfig};
use courier_server::error::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

/// Keeps every SMS so tests can read the code back.
#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<String>>,
}

impl Outbox {
    fn last_code(&self) -> String {
        let sent = self.sent.lock();
        sent.last().unwrap().rsplit(' ').next().unwrap().to_string()
    }
}

#[async_trait]
impl SmsGateway for Outbox {
    async fn send(&self, _to: &str, body: &str) -> Result<()> {
        self.sent.lock().push(body.to_string());
        Ok(())
    }
}

struct TestApp {
    router: Router,
    outbox: Arc<Outbox>,
    _dir: TempDir,
}

async fn test_app() -> TestApp {
    let dir = tempdir().unwrap();
    let outbox = Arc::new(Outbox::default());
    let mut config = ChatServerConfig::with_base_dir(dir.path());
    config.max_media_mb = 1;
    let state = AppState::build(config, outbox.clone()).await.unwrap();
    TestApp {
        router: courier_server::app(state),
        outbox,
        _dir: dir,
    }
}

async fn call(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn register(app: &TestApp, phone: &str, first: &str, last: &str) {
    let (status, _) = call(app, Method::POST, "/auth/send-otp", Some(json!({ "phone": phone }))).await;
    assert_eq!(status, StatusCode::OK);
    let code = app.outbox.last_code();
    let (status, body) = call(
        app,
        Method::POST,
        "/auth/login",
        Some(json!({ "phone": phone, "otp": code, "firstName": first, "lastName": last })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], true);
}

#[tokio::test]
async fn test_health() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_otp_login_and_contacts() {
    let app = test_app().await;

    let (_, body) = call(&app, Method::POST, "/auth/check-user", Some(json!({ "phone": "111" }))).await;
    assert_eq!(body["exists"], false);

    register(&app, "111", "Asha", "Rao").await;
    register(&app, "222", "Bilal", "Khan").await;

    // A wrong code is rejected with 401.
    call(&app, Method::POST, "/auth/send-otp", Some(json!({ "phone": "111" }))).await;
    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/login",
        Some(json!({ "phone": "111", "otp": "not-a-code" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "invalid_otp");

    let (_, body) = call(&app, Method::POST, "/auth/check-user", Some(json!({ "phone": "111" }))).await;
    assert_eq!(body["exists"], true);

    let (_, body) = call(
        &app,
        Method::POST,
        "/contacts/check",
        Some(json!({ "phones": ["222", "999"] })),
    )
    .await;
    let registered = body["registered"].as_array().unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0]["name"], "Bilal Khan");

    let (status, body) = call(&app, Method::GET, "/contacts/111", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_message_routes_map_errors_to_statuses() {
    let app = test_app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/messages",
        Some(json!({ "from": "A", "to": "B", "groupId": "G", "text": "both" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_failed");

    let (status, sent) = call(
        &app,
        Method::POST,
        "/messages",
        Some(json!({ "from": "A", "to": "B", "text": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["status"], "sent");
    let id = sent["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        Method::PUT,
        "/messages/edit",
        Some(json!({ "messageId": id, "actor": "B", "newText": "hijack" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        Method::PUT,
        "/messages/edit",
        Some(json!({ "messageId": "ghost", "actor": "A", "newText": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Legacy key: the actor defaults to `from`.
    let (status, edited) = call(
        &app,
        Method::PUT,
        "/messages/edit",
        Some(json!({
            "from": "A",
            "to": "B",
            "timestamp": sent["timestamp"],
            "newText": "hello"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["edited"], true);

    let (_, report) = call(
        &app,
        Method::POST,
        "/messages/seen",
        Some(json!({ "messageIds": [id, "ghost"], "viewer": "B" })),
    )
    .await;
    assert_eq!(report["updated"], json!([id]));
    assert_eq!(report["failed"][0]["kind"], "not_found");

    let (status, _) = call(
        &app,
        Method::PUT,
        "/messages/delete-for-me",
        Some(json!({ "messageId": id, "user": "B" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, b_view) = call(&app, Method::GET, "/messages/B/A", None).await;
    assert!(b_view.as_array().unwrap().is_empty());
    let (_, a_view) = call(&app, Method::GET, "/messages/B/A?viewer=A", None).await;
    assert_eq!(a_view[0]["status"], "seen");

    let (status, _) = call(&app, Method::GET, "/messages/B/A?viewer=C", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, tomb) = call(
        &app,
        Method::PUT,
        "/messages/delete-for-everyone",
        Some(json!({ "messageId": id, "actor": "A" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tomb["deletedForEveryone"], true);
}

#[tokio::test]
async fn test_presence_routes() {
    let app = test_app().await;

    let (_, body) = call(&app, Method::GET, "/presence/online", None).await;
    assert_eq!(body["online"], json!([]));

    let (status, _) = call(&app, Method::POST, "/presence/A/heartbeat", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, Method::GET, "/presence/online", None).await;
    assert_eq!(body["online"], json!(["A"]));

    let (_, seen) = call(&app, Method::GET, "/presence/A", None).await;
    assert_eq!(seen["online"], true);
    assert_eq!(seen["source"], "live");

    let (_, ghost) = call(&app, Method::GET, "/presence/nobody", None).await;
    assert_eq!(ghost["source"], "unknown");
}

#[tokio::test]
async fn test_media_upload_and_download() {
    let app = test_app().await;
    let boundary = "courier-boundary";
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"note.txt\"\r\nContent-Type: text/plain\r\n\r\nhello media\r\n--{b}--\r\n",
        b = boundary
    );
    let request = Request::post("/media")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let media: Value = serde_json::from_slice(&bytes).unwrap();
    let url = media["url"].as_str().unwrap().to_string();

    let response = app
        .router
        .clone()
        .oneshot(Request::get(url.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"hello media");

    let (status, _) = call(&app, Method::GET, "/media/not-a-hash", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
