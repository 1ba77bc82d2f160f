//! HTTP-level checks of key gating, roles and error bodies against a live router.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration, TimeZone, Utc};
use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};
use serde_json::{json, Value};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_service::config::ApiConfig;
use telemetry_service::{
    create_router, AppState, Classification, Database, FilesystemBlobStore, FrameClassifier,
    FrameStore, IngestionService, LiveSnapshots, RetentionThrottle, Role, SensorStore,
    SqliteFrameStore, TimelapseReconstructor, User, UserStore,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Server {
    addr: SocketAddr,
    admin: User,
    grower: User,
    frames: SqliteFrameStore,
    blob_dir: TempDir,
}

async fn start() -> Server {
    let database = Database::in_memory().await.unwrap();
    database.run_migrations().await.unwrap();

    let users = UserStore::new(database.pool().clone());
    let admin = users.create("admin", Role::Admin, Some("admin-key".to_string())).await.unwrap();
    let grower = users.create("grower", Role::User, Some("grower-key".to_string())).await.unwrap();

    let blob_dir = tempfile::tempdir().unwrap();
    let frames = SqliteFrameStore::new(database.pool().clone());
    let blobs = Arc::new(FilesystemBlobStore::with_root(blob_dir.path()));

    let state = AppState {
        database: database.clone(),
        users,
        frames: frames.clone(),
        sensors: SensorStore::new(database.pool().clone()),
        blobs: blobs.clone(),
        ingestion: Arc::new(IngestionService::new(
            FrameClassifier::default(),
            RetentionThrottle::new(Duration::seconds(1740)),
            Arc::new(frames.clone()),
            blobs,
            Arc::new(LiveSnapshots::new()),
        )),
        timelapse: Arc::new(TimelapseReconstructor::new(Arc::new(frames.clone()))),
        timelapse_timeout: std::time::Duration::from_secs(10),
        uploads_root: blob_dir.path().to_path_buf(),
    };

    let router = create_router(state, &ApiConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });

    Server {
        addr,
        admin,
        grower,
        frames,
        blob_dir,
    }
}

fn dechunk(body: &str) -> String {
    let mut out = String::new();
    let mut rest = body;
    while let Some((size, tail)) = rest.split_once("\r\n") {
        let size = usize::from_str_radix(size.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        out.push_str(&tail[..size]);
        rest = &tail[size + 2..];
    }
    out
}

impl Server {
    /// Send one request and return the status and the JSON body (Null if none)
    async fn send(&self, method: &str, path: &str, key: Option<&str>, body: Option<Value>) -> (u16, Value) {
        self.send_raw(method, path, key, body.map(|b| b.to_string())).await
    }

    async fn send_raw(&self, method: &str, path: &str, key: Option<&str>, body: Option<String>) -> (u16, Value) {
        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
        if let Some(key) = key {
            request.push_str(&format!("x-api-key: {key}\r\n"));
        }
        let body = body.unwrap_or_default();
        if !body.is_empty() {
            request.push_str("Content-Type: application/json\r\n");
        }
        request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));

        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8_lossy(&raw).to_string();

        let (head, payload) = raw.split_once("\r\n\r\n").unwrap();
        let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
        let payload = if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
            dechunk(payload)
        } else {
            payload.to_string()
        };

        (status, serde_json::from_str(&payload).unwrap_or(Value::Null))
    }
}

fn png_base64(value: u8) -> String {
    let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([value])));
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .unwrap();
    STANDARD.encode(buf)
}

#[tokio::test]
async fn test_missing_or_unknown_key_is_forbidden() {
    let server = start().await;

    let (status, body) = server.send("GET", "/pictures", None, None).await;
    assert_eq!(status, 403);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, _) = server.send("GET", "/pictures", Some("nope"), None).await;
    assert_eq!(status, 403);

    let (status, body) = server.send("GET", "/pictures?key=grower-key", None, None).await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], 0);

    // Health stays public
    let (status, _) = server.send("GET", "/health", None, None).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let server = start().await;

    let (status, body) = server.send("GET", "/admin/users", Some("grower-key"), None).await;
    assert_eq!(status, 403);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, _) = server
        .send("POST", "/admin/users", Some("grower-key"), Some(json!({ "username": "eve" })))
        .await;
    assert_eq!(status, 403);

    let path = format!("/admin/users/{}", server.admin.id);
    let (status, _) = server.send("DELETE", &path, Some("grower-key"), None).await;
    assert_eq!(status, 403);

    let (status, body) = server.send("GET", "/admin/users", Some("admin-key"), None).await;
    assert_eq!(status, 200);
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_timelapse_defaults_to_germination_date() {
    let server = start().await;
    let germination = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    for (hours, classification) in [(2, Classification::Day), (3, Classification::Night), (26, Classification::Day)] {
        let at = germination + Duration::hours(hours);
        server
            .frames
            .insert(server.grower.id, at, &format!("user_{}/{hours}.png", server.grower.id), classification)
            .await
            .unwrap();
    }

    let (status, body) = server.send("GET", "/timelapse", Some("grower-key"), None).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, _) = server
        .send(
            "POST",
            "/user/preferences",
            Some("grower-key"),
            Some(json!({ "germination_date": "2024-05-01T00:00:00Z" })),
        )
        .await;
    assert_eq!(status, 200);

    let (status, body) = server.send("GET", "/timelapse", Some("grower-key"), None).await;
    assert_eq!(status, 200);
    let days: Vec<i64> = body["pictures"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["day"].as_i64().unwrap())
        .collect();
    assert_eq!(days, vec![1, 2]);

    // Another stream sees none of these frames
    let (status, body) = server
        .send("GET", "/timelapse?start_date=2024-05-01", Some("admin-key"), None)
        .await;
    assert_eq!(status, 200);
    assert!(body["pictures"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_requests_get_json_errors() {
    let server = start().await;

    for path in [
        "/pictures?page=abc",
        "/pictures?classification=Day",
        "/pictures?page=9223372036854775807&limit=1000",
    ] {
        let (status, body) = server.send("GET", path, Some("grower-key"), None).await;
        assert_eq!(status, 400, "{path}");
        assert_eq!(body["code"], "BAD_REQUEST", "{path}");
    }

    let (status, body) = server.send("DELETE", "/pictures/abc", Some("grower-key"), None).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = server
        .send_raw("POST", "/upload_sensor_data", Some("grower-key"), Some("{not json".to_string()))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_duplicate_api_key_is_a_conflict() {
    let server = start().await;

    let (status, body) = server
        .send(
            "POST",
            "/admin/users",
            Some("admin-key"),
            Some(json!({ "username": "second", "api_key": "grower-key" })),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn test_username_update_is_trimmed() {
    let server = start().await;
    let path = format!("/admin/users/{}", server.grower.id);

    let (status, body) = server
        .send("PUT", &path, Some("admin-key"), Some(json!({ "username": "  greenhouse-2  " })))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["username"], "greenhouse-2");

    // Padding does not dodge the duplicate check
    let admin_path = format!("/admin/users/{}", server.admin.id);
    let (status, _) = server
        .send("PUT", &admin_path, Some("admin-key"), Some(json!({ "username": " greenhouse-2 " })))
        .await;
    assert_eq!(status, 409);
}

#[tokio::test]
async fn test_deleting_user_removes_their_images() {
    let server = start().await;

    let (status, body) = server
        .send("POST", "/upload_picture", Some("grower-key"), Some(json!({ "image": png_base64(200) })))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["persisted"], true);

    let user_dir = server.blob_dir.path().join(format!("user_{}", server.grower.id));
    assert!(user_dir.exists());

    let path = format!("/admin/users/{}", server.grower.id);
    let (status, _) = server.send("DELETE", &path, Some("admin-key"), None).await;
    assert_eq!(status, 200);

    assert!(!user_dir.exists());
    let (status, _) = server.send("GET", "/pictures", Some("grower-key"), None).await;
    assert_eq!(status, 403);
}
