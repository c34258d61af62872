//! Test utilities and common setup.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use ridenow::auth::AuthState;
use ridenow::db::Database;
use ridenow::rides::{NewUser, RideRepository};
use ridenow::{App, AppConfig, Role};
use ridenow_protocol::UserId;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RIDER: &str = "1";
pub const DRIVER: &str = "2";
pub const OTHER_DRIVER: &str = "3";
pub const OTHER_RIDER: &str = "4";

const WAIT: Duration = Duration::from_secs(5);

/// Config for tests: signed tokens, local relay, no embedded workers.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.dev_mode = false;
    config.auth.jwt_secret = Some("test-secret-for-integration-tests-minimum-32-chars".to_string());
    config.auth.allowed_origins = vec![];
    config.worker.embedded = false;
    config.worker.max_attempts = 2;
    config.worker.retry_delay_ms = 20;
    config.worker.poll_timeout_secs = 1;
    config.worker.error_backoff_ms = 20;
    config
}

/// In-memory database seeded with two riders and two drivers.
pub async fn seeded_database() -> Database {
    let database = Database::in_memory().await.unwrap();
    let repo = RideRepository::new(database.pool().clone());
    for (id, is_driver) in [
        (RIDER, false),
        (DRIVER, true),
        (OTHER_DRIVER, true),
        (OTHER_RIDER, false),
    ] {
        repo.upsert_user(&NewUser {
            id: UserId::from(id),
            name: format!("user {id}"),
            email: Some(format!("user{id}@example.com")),
            is_driver,
        })
        .await
        .unwrap();
    }
    database
}

/// A RideNow server listening on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub app: App,
    pub database: Database,
    auth: AuthState,
    server: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: AppConfig) -> Self {
        let database = seeded_database().await;
        let auth = AuthState::new(config.auth.clone());
        let mut app = App::build(config, &database, Role::Server).await.unwrap();
        app.start_background();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app.router();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            addr,
            app,
            database,
            auth,
            server,
        }
    }

    pub fn token(&self, user_id: &str) -> String {
        self.auth
            .generate_token(&UserId::from(user_id), None)
            .unwrap()
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Open a gateway session for `user_id` and consume the `connected` event.
    pub async fn connect(&self, user_id: &str) -> WsClient {
        let mut ws = self.connect_raw(&format!("token={}", self.token(user_id))).await;
        let connected = next_event(&mut ws).await;
        assert_eq!(connected["event"], "connected", "{connected}");
        ws
    }

    /// Open a gateway connection with an arbitrary query string.
    pub async fn connect_raw(&self, query: &str) -> WsClient {
        let url = format!("ws://{}/ws?{}", self.addr, query);
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    pub async fn stop(self) {
        self.server.abort();
        self.app.shutdown().await;
    }
}

/// Send a JSON frame.
pub async fn send_json(ws: &mut WsClient, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next server event, skipping keepalive pings.
pub async fn next_event(ws: &mut WsClient) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["event"] != "ping" {
                        return value;
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

/// Assert nothing but pings arrives within `window`.
pub async fn assert_silent(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["event"] != "ping" {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await;
    if let Ok(event) = result {
        panic!("unexpected event: {event}");
    }
}

/// Close code of the next close frame.
pub async fn close_code(ws: &mut WsClient) -> u16 {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(Message::Close(None))) | None => panic!("closed without a code"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("websocket error before close: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}

/// Poll `check` until it returns true.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
