//! Integration tests for the one-shot `/api` endpoints.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

use ccw::api::AppState;

fn app(proc_root: &std::path::Path) -> axum::Router {
    test_router(AppState::new(test_settings(proc_root)))
}

fn p(dir: &tempfile::TempDir, rel: &str) -> String {
    dir.path().join(rel).display().to_string()
}

// ── filesystem ────────────────────────────────────────────────────

#[tokio::test]
async fn create_read_write_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, body) = call(
        app.clone(),
        json("POST", "/api/fs/create", json!({"path": p(&dir, "a/b/note.txt"), "content": "one"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body.get("data").is_none());

    let (_, body) = call(app.clone(), get(&format!("/api/fs/read?path={}", p(&dir, "a/b/note.txt")))).await;
    assert_eq!(body["data"], "one");

    let (status, _) = call(
        app.clone(),
        json("POST", "/api/fs/write", json!({"path": p(&dir, "a/b/note.txt"), "content": "two"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(std::fs::read_to_string(dir.path().join("a/b/note.txt")).unwrap(), "two");

    let (status, body) = call(app, get(&format!("/api/fs/listdir?path={}", p(&dir, "a/b")))).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "note.txt");
    assert_eq!(entries[0]["size"], 3);
    assert_eq!(entries[0]["isDir"], false);
    assert!(entries[0]["mode"].as_str().unwrap().starts_with('-'));
    assert!(entries[0]["modTime"].is_string());
}

#[tokio::test]
async fn relative_paths_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(app(dir.path()), get("/api/fs/read?path=etc/passwd")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "path_not_absolute");
}

#[tokio::test]
async fn missing_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(app(dir.path()), get(&format!("/api/fs/read?path={}", p(&dir, "nope")))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn mkdir_rename_copy_move_delete() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, _) = call(app.clone(), json("POST", "/api/fs/mkdir", json!({"path": p(&dir, "src/deep")}))).await;
    assert_eq!(status, StatusCode::OK);
    std::fs::write(dir.path().join("src/deep/file"), "payload").unwrap();

    let (status, _) = call(
        app.clone(),
        json("PUT", "/api/fs/rename", json!({"oldPath": p(&dir, "src"), "newPath": p(&dir, "renamed")})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(dir.path().join("renamed/deep/file").exists());

    let (status, _) = call(
        app.clone(),
        json("POST", "/api/fs/copy", json!({"source": p(&dir, "renamed"), "destination": p(&dir, "copy")})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(std::fs::read_to_string(dir.path().join("copy/deep/file")).unwrap(), "payload");
    assert!(dir.path().join("renamed/deep/file").exists());

    let (status, _) = call(
        app.clone(),
        json("POST", "/api/fs/move", json!({"source": p(&dir, "copy"), "destination": p(&dir, "moved/here")})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!dir.path().join("copy").exists());
    assert!(dir.path().join("moved/here/deep/file").exists());

    let (status, _) = call(app.clone(), delete(&format!("/api/fs/delete?path={}", p(&dir, "moved")))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!dir.path().join("moved").exists());

    // Deleting again is not an error.
    let (status, _) = call(app, delete(&format!("/api/fs/delete?path={}", p(&dir, "moved")))).await;
    assert_eq!(status, StatusCode::OK);
}

// ── exec ──────────────────────────────────────────────────────────

#[tokio::test]
async fn exec_returns_command_result() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(
        app(dir.path()),
        json("POST", "/api/shell/exec", json!({"command": "echo hi; exit 2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let data = &body["data"];
    assert_eq!(data["command"], "echo hi; exit 2");
    assert_eq!(data["exitCode"], 2);
    assert_eq!(data["stdout"], "hi\n");
    assert_eq!(data["terminated"], false);
    assert!(data["duration"].is_string());
}

#[tokio::test]
async fn exec_timeout_marks_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let (_, body) = call(
        app(dir.path()),
        json("POST", "/api/shell/exec", json!({"command": "sleep 20", "timeoutSeconds": 1})),
    )
    .await;
    assert_eq!(body["data"]["terminated"], true);
    assert_eq!(body["data"]["exitCode"], -1);
}

#[tokio::test]
async fn exec_requires_command() {
    let dir = tempfile::tempdir().unwrap();
    let (status, body) = call(
        app(dir.path()),
        json("POST", "/api/shell/exec", json!({"command": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

// ── network ───────────────────────────────────────────────────────

#[tokio::test]
async fn ports_reads_socket_tables() {
    let proc_root = tempfile::tempdir().unwrap();
    write_tcp_table(
        proc_root.path(),
        &[("0100007F", 8080), ("00000000", 22), ("0100007F", 8080)],
    );

    let (status, body) = call(app(proc_root.path()), get("/api/net/ports")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["protocol"], "tcp");
    assert_eq!(body["data"]["interface"], "127.0.0.1");
    assert_eq!(body["data"]["ports"], json!([8080]));
    assert_eq!(body["data"]["count"], 1);

    let (_, body) = call(app(proc_root.path()), get("/api/net/ports?protocol=both&interface=any")).await;
    assert_eq!(body["data"]["ports"], json!([22, 8080]));
}

#[tokio::test]
async fn ports_rejects_unknown_protocol() {
    let proc_root = tempfile::tempdir().unwrap();
    let (status, body) = call(app(proc_root.path()), get("/api/net/ports?protocol=icmp")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

async fn file_server() -> std::net::SocketAddr {
    let upstream = axum::Router::new()
        .route(
            "/blob.bin",
            axum::routing::get(|| async { ([("content-type", "application/octet-stream")], vec![7u8; 70_000]) }),
        )
        .route(
            "/missing",
            axum::routing::get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        )
        .route(
            "/truncated",
            axum::routing::get(|| async {
                let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
                    Ok(vec![1u8; 4096]),
                    Err(std::io::Error::other("upstream reset")),
                ];
                axum::body::Body::from_stream(futures::stream::iter(parts))
            }),
        );
    start_server(upstream).await
}

#[tokio::test]
async fn download_streams_to_path() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = file_server().await;
    let target = p(&dir, "downloads/nested/blob.bin");

    let (status, body) = call(
        app(dir.path()),
        json(
            "POST",
            "/api/net/download",
            json!({"url": format!("http://{}/blob.bin", upstream), "path": target}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["bytesWritten"], 70_000);
    assert_eq!(body["data"]["contentType"], "application/octet-stream");
    assert_eq!(body["data"]["filePath"], target.as_str());
    assert_eq!(std::fs::metadata(&target).unwrap().len(), 70_000);
}

#[tokio::test]
async fn download_reports_upstream_status() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = file_server().await;

    let (status, body) = call(
        app(dir.path()),
        json(
            "POST",
            "/api/net/download",
            json!({"url": format!("http://{}/missing", upstream), "path": p(&dir, "fresh/x")}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "upstream_status");
    assert!(!dir.path().join("fresh").exists());
}

#[tokio::test]
async fn failed_download_leaves_no_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = file_server().await;
    let target = dir.path().join("partial.bin");

    let (status, body) = call(
        app(dir.path()),
        json(
            "POST",
            "/api/net/download",
            json!({"url": format!("http://{}/truncated", upstream), "path": target.to_str().unwrap()}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "download_failed");
    assert!(!target.exists());
}
