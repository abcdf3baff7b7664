//! Integration tests for the upload and serve flow.
//!
//! These tests start an in-process server and drive it over HTTP.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use jsonwebtoken::{EncodingKey, Header, encode};
use reqwest::StatusCode;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::oneshot;

use lapse_server::auth::TokenVerifier;
use lapse_server::{AppState, FileManager, MetadataDb, MetadataStore, UploadPolicy, router};

const SECRET: &str = "integration-secret";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    request_id: String,
    #[serde(default)]
    url: Option<String>,
    file: UploadedFile,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    owner_id: String,
    expires_at: i64,
    mime_type: String,
    filename: String,
    upload_method: String,
    private: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    request_id: Option<String>,
}

/// Test server handle that manages the server lifecycle.
struct TestServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    runtime: Arc<tokio::runtime::Runtime>,
    files: Arc<FileManager>,
    db: Arc<MetadataDb>,
    storage_dir: TempDir,
}

impl TestServer {
    fn start() -> Self {
        Self::with_policy(UploadPolicy::default())
    }

    fn with_policy(policy: UploadPolicy) -> Self {
        let runtime = Arc::new(tokio::runtime::Runtime::new().unwrap());
        let storage_dir = TempDir::new().expect("Failed to create temp storage dir");

        let db = Arc::new(
            MetadataDb::open(&storage_dir.path().join("database.db")).expect("Failed to open db"),
        );
        let files = Arc::new(
            FileManager::for_mode(
                "on-disk",
                storage_dir.path(),
                db.clone(),
                Duration::from_millis(200),
            )
            .expect("Failed to build file manager"),
        );
        runtime.block_on(async { files.scheduler().start() });

        let app = router(AppState::new(
            Arc::clone(&files),
            db.clone(),
            policy,
            Some(TokenVerifier::new(SECRET)),
        ));

        let listener = runtime.block_on(async {
            tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("Failed to bind")
        });
        let addr = listener.local_addr().expect("Failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let rt = Arc::clone(&runtime);
        std::thread::spawn(move || {
            rt.block_on(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                    .expect("Server error");
            });
        });

        // Give server a moment to start
        std::thread::sleep(Duration::from_millis(50));

        TestServer {
            addr,
            shutdown_tx: Some(shutdown_tx),
            runtime,
            files,
            db,
            storage_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn storage_path(&self) -> &Path {
        self.storage_dir.path()
    }

    fn upload(&self, token: Option<&str>, filename: &str, data: &[u8]) -> Response {
        self.upload_form(token, file_form(filename, data))
    }

    fn upload_form(&self, token: Option<&str>, form: Form) -> Response {
        let mut request = Client::new().post(self.url("/api/v1/upload")).multipart(form);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().expect("Upload request failed")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let files = Arc::clone(&self.files);
        self.runtime.block_on(async move { files.scheduler().stop().await });
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn png(extra: usize) -> Vec<u8> {
    let mut data = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
    data.extend((0..extra).map(|i| (i % 251) as u8));
    data
}

fn file_form(filename: &str, data: &[u8]) -> Form {
    Form::new().part(
        "file",
        Part::bytes(data.to_vec()).file_name(filename.to_string()),
    )
}

fn token(user_id: &str) -> String {
    encode(
        &Header::default(),
        &json!({ "user_id": user_id }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

#[test]
fn test_heartbeat() {
    let server = TestServer::start();
    let response = Client::new()
        .head(server.url("/api/v1/heartbeat"))
        .send()
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[test]
fn test_guest_upload_and_serve() {
    let server = TestServer::start();
    let data = png(4096);

    let response = server.upload(None, "holiday.png", &data);
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: UploadResponse = response.json().unwrap();

    assert_eq!(body.request_id.len(), 10);
    assert_eq!(body.file.owner_id, "");
    assert_eq!(body.file.mime_type, "image/png");
    assert_eq!(body.file.upload_method, "on-disk");
    assert!(!body.file.private);
    assert!(body.file.expires_at > Timestamp::now().as_second());

    // guests get a random name that keeps the extension
    assert_ne!(body.file.filename, "holiday.png");
    assert!(body.file.filename.ends_with(".png"));
    assert!(
        server
            .storage_path()
            .join("files/guest_uploads")
            .join(&body.file.filename)
            .exists()
    );

    let url = body.url.expect("public upload has a url");
    let response = Client::new().get(server.url(&url)).send().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "image/png"
    );
    assert_eq!(response.bytes().unwrap().as_ref(), data.as_slice());

    assert_eq!(server.files.scheduler().pending(), 1);
}

#[test]
fn test_user_uploads_get_suffixes() {
    let server = TestServer::start();
    let user = server.db.create_user("alice").unwrap();
    let token = token("alice");

    let mut names = Vec::new();
    for _ in 0..3 {
        let response = server.upload(Some(&token), "photo.png", &png(64));
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: UploadResponse = response.json().unwrap();
        assert_eq!(body.file.owner_id, "alice");
        assert_eq!(body.file.expires_at, 0);
        names.push(body.file.filename);
    }
    assert_eq!(names, ["photo.png", "photo.png_(1)", "photo.png_(2)"]);

    let namespace = server.storage_path().join("files").join(&user.storage_id);
    for name in &names {
        assert!(namespace.join(name).exists());
    }

    // user uploads never expire
    assert_eq!(server.files.scheduler().pending(), 0);
}

#[test]
fn test_private_upload_is_not_served() {
    let server = TestServer::start();
    server.db.create_user("bob").unwrap();

    let form = file_form("secret.png", &png(16)).text("private", "true");
    let response = server.upload_form(Some(&token("bob")), form);
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: UploadResponse = response.json().unwrap();
    assert!(body.file.private);
    assert!(body.url.is_none());

    let response = Client::new()
        .get(server.url("/api/v1/secret.png"))
        .send()
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test]
fn test_serve_missing_file() {
    let server = TestServer::start();
    let response = Client::new()
        .get(server.url("/api/v1/nothing-here.png"))
        .send()
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test]
fn test_disallowed_type() {
    let server = TestServer::start();
    let response = server.upload(None, "notes.txt", b"just some text");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: ErrorResponse = response.json().unwrap();
    assert_eq!(body.error, "File type not allowed");
    assert_eq!(body.request_id.map(|id| id.len()), Some(10));

    let guest_dir = server.storage_path().join("files/guest_uploads");
    assert!(!guest_dir.exists() || guest_dir.read_dir().unwrap().next().is_none());
}

#[test]
fn test_missing_file_part() {
    let server = TestServer::start();
    let form = Form::new().text("private", "false");
    let response = server.upload_form(None, form);
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[test]
fn test_unknown_user() {
    let server = TestServer::start();
    let response = server.upload(Some(&token("mallory")), "photo.png", &png(16));
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: ErrorResponse = response.json().unwrap();
    assert_eq!(body.error, "User not found");
}

#[test]
fn test_invalid_token() {
    let server = TestServer::start();
    server.db.create_user("alice").unwrap();

    let forged = encode(
        &Header::default(),
        &json!({ "user_id": "alice" }),
        &EncodingKey::from_secret(b"wrong secret"),
    )
    .unwrap();
    let response = server.upload(Some(&forged), "photo.png", &png(16));
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(server.db.find_filenames("alice").unwrap().is_empty());
}

#[test]
fn test_guest_uploads_disabled() {
    let server = TestServer::with_policy(UploadPolicy {
        allow_guest_uploads: false,
        ..UploadPolicy::default()
    });

    let response = server.upload(None, "photo.png", &png(16));
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // registered users are unaffected
    server.db.create_user("alice").unwrap();
    let response = server.upload(Some(&token("alice")), "photo.png", &png(16));
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[test]
fn test_too_large() {
    let server = TestServer::with_policy(UploadPolicy {
        max_file_size: Some(64 * 1024),
        max_guest_file_size: Some(1024),
        ..UploadPolicy::default()
    });

    let response = server.upload(None, "big.png", &png(4096));
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // the user limit is higher than the guest one
    server.db.create_user("alice").unwrap();
    let response = server.upload(Some(&token("alice")), "big.png", &png(4096));
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = server.upload(Some(&token("alice")), "huge.png", &png(80 * 1024));
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[test]
fn test_guest_upload_expires() {
    let server = TestServer::with_policy(UploadPolicy {
        guest_file_lifetime: Some(Duration::from_secs(1)),
        ..UploadPolicy::default()
    });

    let response = server.upload(None, "brief.png", &png(256));
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: UploadResponse = response.json().unwrap();
    let path = server
        .storage_path()
        .join("files/guest_uploads")
        .join(&body.file.filename);
    assert!(path.exists());

    std::thread::sleep(Duration::from_secs(3));

    assert!(!path.exists());
    assert!(
        server
            .db
            .find_record_by_filename("", &body.file.filename)
            .unwrap()
            .is_none()
    );
    let response = Client::new()
        .get(server.url(&format!("/api/v1/{}", body.file.filename)))
        .send()
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(server.files.scheduler().pending(), 0);
}
