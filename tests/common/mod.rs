#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use ccw::api::{self, AppState, RouterConfig};
use ccw::config::SessionSettings;

pub const SECRET: &str = "test-secret";

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings with a fixed shell, a fake proc root and a short kill grace.
pub fn test_settings(proc_root: &Path) -> SessionSettings {
    SessionSettings {
        shell: "/bin/sh".into(),
        proc_root: proc_root.to_path_buf(),
        kill_grace: Duration::from_millis(200),
        ..SessionSettings::default()
    }
}

/// Create a fake proc root whose `net/tcp` lists the given `(hex_addr, port)`
/// pairs and whose `net/udp` is empty.
pub fn write_tcp_table(root: &Path, entries: &[(&str, u16)]) {
    std::fs::create_dir_all(root.join("net")).unwrap();
    let mut table = String::from(
        "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
    );
    for (i, (addr, port)) in entries.iter().enumerate() {
        table.push_str(&format!(
            "   {}: {}:{:04X} 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 {} 1 0000000000000000 100 0 0 10 0\n",
            i, addr, port, 1000 + i
        ));
    }
    std::fs::write(root.join("net/tcp"), table).unwrap();
    std::fs::write(root.join("net/udp"), "  sl  local_address rem_address\n").unwrap();
}

pub fn test_router(state: AppState) -> axum::Router {
    api::router(state, RouterConfig::new(SECRET))
}

/// Serve the router on an ephemeral port with connect info enabled.
pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

pub async fn connect(addr: SocketAddr) -> Socket {
    let url = format!("ws://{}/ws?auth={}", addr, SECRET);
    let (ws, _response) = connect_async(&url)
        .await
        .expect("Failed to connect WebSocket");
    ws
}

pub async fn send_event(ws: &mut Socket, event: serde_json::Value) {
    ws.send(Message::Text(event.to_string().into()))
        .await
        .expect("Failed to send event");
}

/// Next JSON text frame, failing the test after five seconds.
pub async fn recv_json(ws: &mut Socket) -> serde_json::Value {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("socket closed: {:?}", frame),
            _ => continue,
        }
    }
}

/// Read events until one named `name` arrives, returning it.
pub async fn recv_until(ws: &mut Socket, name: &str) -> serde_json::Value {
    loop {
        let event = recv_json(ws).await;
        if event["event"] == name {
            return event;
        }
    }
}

/// Run one authenticated request through the router.
pub async fn call(app: axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {}", SECRET))
        .body(Body::empty())
        .unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header("authorization", format!("Bearer {}", SECRET))
        .body(Body::empty())
        .unwrap()
}

pub fn json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", SECRET))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
