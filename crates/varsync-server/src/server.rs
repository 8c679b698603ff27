use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use varsync_engine::{Backend, WrapperRegistry};

use crate::client::ConnectionHub;
use crate::config::ServerConfig;
use crate::sessions::SessionManager;
use crate::transport::{text, Transport};
use crate::websocket;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(text::create_session))
        .route("/api/{session}", post(text::post_batch))
        .route("/api/{session}/poll", get(text::poll))
        .route("/ws/{session}", get(websocket::ws_handler))
        .route("/health", get(text::health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the TCP listener, the local socket (if configured) and the cleanup
/// task.
pub async fn start(
    config: ServerConfig,
    wrappers: Arc<WrapperRegistry>,
    backend: Option<Arc<dyn Backend>>,
) -> Result<ServerHandle, std::io::Error> {
    let config = Arc::new(config);
    let hub = Arc::new(ConnectionHub::new(config.max_send_queue));
    let manager = Arc::new(SessionManager::new(Arc::clone(&config), hub, wrappers, backend));
    let cleanup = manager.start_cleanup_task();

    let router = build_router(AppState {
        manager: Arc::clone(&manager),
        config: Arc::clone(&config),
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    let tcp_router = router.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, tcp_router).await {
            tracing::error!(error = %e, "http server stopped");
        }
    });

    let mut tasks = vec![server, cleanup];
    if let Some(path) = &config.socket_path {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let socket = UnixListener::bind(path)?;
        let transport = Transport::new(Arc::clone(&manager), router);
        tasks.push(tokio::spawn(transport.serve(socket)));
    }

    tracing::info!(
        port = local_addr.port(),
        socket = ?config.socket_path,
        "varsync server started"
    );

    Ok(ServerHandle {
        port: local_addr.port(),
        socket_path: config.socket_path.clone(),
        manager,
        tasks,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub socket_path: Option<PathBuf>,
    manager: Arc<SessionManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Stop accepting, tear every session down and remove the socket file.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.manager.close_all().await;
        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!(error = %e, "socket file already gone");
            }
        }
        tracing::info!("varsync server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;
    use tokio_util::codec::Framed;
    use varsync_core::message::Properties;
    use varsync_core::{Message, ObjectRef, Outgoing, ProtocolError, Response, Value, VarId};
    use varsync_engine::SessionState;

    use crate::transport::packet;

    struct Named;

    impl Backend for Named {
        fn name(&self) -> &str {
            "named"
        }

        fn start(&self, state: &mut SessionState) -> Result<(), ProtocolError> {
            let root = ObjectRef::with_fields([("name", "fred")]);
            state.create_root(Value::from(root), Properties::new())?;
            Ok(())
        }
    }

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("varsync-{tag}-{}.sock", uuid::Uuid::now_v7()))
    }

    async fn start_test_server(socket: Option<PathBuf>) -> ServerHandle {
        let config = ServerConfig {
            port: 0,
            socket_path: socket,
            ..ServerConfig::default()
        };
        start(config, Arc::new(WrapperRegistry::new()), Some(Arc::new(Named)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start_test_server(None).await;
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn text_api_update_reaches_watcher_once() {
        let handle = start_test_server(None).await;
        let base = format!("http://127.0.0.1:{}", handle.port);
        let http = reqwest::Client::new();

        let created: Response = http
            .post(format!("{base}/api/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let session = created.session.unwrap();

        let watched: Response = http
            .post(format!("{base}/api/{session}"))
            .header(text::CONNECTION_HEADER, "watcher")
            .body(json!({"type": "watch", "data": {"varId": 1}}).to_string())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            watched.pending,
            vec![Outgoing::Message(Message::update(
                VarId::ROOT,
                Some(json!({"name": "fred"})),
                Properties::new()
            ))]
        );

        let written: Response = http
            .post(format!("{base}/api/{session}"))
            .header(text::CONNECTION_HEADER, "writer")
            .body(json!([{"type": "update", "data": {"varId": 1, "value": {"name": "wilma"}}}]).to_string())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(written.pending.is_empty());

        let polled: Response = http
            .get(format!("{base}/api/{session}/poll?wait=1s"))
            .header(text::CONNECTION_HEADER, "watcher")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            polled.pending,
            vec![Outgoing::Message(Message::update(
                VarId::ROOT,
                Some(json!({"name": "wilma"})),
                Properties::new()
            ))]
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let handle = start_test_server(None).await;
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/api/99", handle.port))
            .body("[]")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Response = resp.json().await.unwrap();
        assert!(body.error.unwrap().contains("99"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn socket_serves_text_requests() {
        let path = socket_path("text");
        let handle = start_test_server(Some(path.clone())).await;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("healthy"));
        handle.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn socket_serves_packets() {
        let path = socket_path("packet");
        let handle = start_test_server(Some(path.clone())).await;

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut framed = Framed::new(stream, packet::codec(1 << 20));
        let body = json!({"session": "new", "messages": [{"type": "get", "data": {"varIds": [1]}}]});
        framed.send(Bytes::from(body.to_string())).await.unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&frame).unwrap();
        assert_eq!(response.session.as_deref(), Some("1"));
        assert_eq!(response.result, Some(json!([[{"id": 1, "value": {"name": "fred"}}]])));
        handle.shutdown().await;
    }
}
