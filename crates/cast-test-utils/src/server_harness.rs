//! Test server harness for E2E testing.
//!
//! Provides `TestCastServer` for spawning real cast service instances backed
//! by `LocalMediaEngine` and a `MockEncoder`, and `SignalingClient` for
//! talking to `/ws` like a participant would.

use crate::fixtures::{self, TestWorkspace};
use crate::mock_encoder::MockEncoder;
use cast_service::actors::RouterExit;
use cast_service::config::Config;
use cast_service::engine::{LocalMediaEngine, MediaEngine};
use cast_service::routes::AppState;
use cast_service::runtime::CastRuntime;
use common::types::{MediaKind, TransportDirection};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long a client waits for a reply or event before giving up.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Test harness for spawning the cast service in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_watch_flow() -> Result<(), anyhow::Error> {
///     let server = TestCastServer::spawn().await?;
///     let mut alice = server.connect("alice").await?;
///     alice.publish(MediaKind::Audio).await?;
///
///     let response = reqwest::Client::new()
///         .post(format!("{}/watch", server.url()))
///         .send()
///         .await?;
///     assert_eq!(response.status(), 409);
///     Ok(())
/// }
/// ```
pub struct TestCastServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    engine: Arc<LocalMediaEngine>,
    encoder: MockEncoder,
    workspace: TestWorkspace,
    runtime: Option<CastRuntime>,
    handle: JoinHandle<()>,
}

/// Builder for `TestCastServer`.
#[derive(Default)]
pub struct TestCastServerBuilder {
    vars: HashMap<String, String>,
    encoder: Option<MockEncoder>,
}

impl TestCastServerBuilder {
    /// Override a `CAST_*` variable.
    #[must_use]
    pub fn with_var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn with_encoder(mut self, encoder: MockEncoder) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Bind to a random port on 127.0.0.1 and start serving.
    pub async fn spawn(self) -> Result<TestCastServer, anyhow::Error> {
        let workspace = TestWorkspace::new();
        let mut vars = workspace.config_vars();
        vars.extend(self.vars);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let engine = Arc::new(LocalMediaEngine::new());
        let dyn_engine: Arc<dyn MediaEngine> = engine.clone();
        let encoder = self.encoder.unwrap_or_else(MockEncoder::ready);

        // No recorder: it can only be installed once per process
        let runtime = CastRuntime::start(config, dyn_engine, Arc::new(encoder.clone()), None);
        let state = Arc::clone(runtime.state());
        let app = runtime.router();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(TestCastServer {
            addr,
            state,
            engine,
            encoder,
            workspace,
            runtime: Some(runtime),
            handle,
        })
    }
}

impl TestCastServer {
    /// Spawn with default test configuration and an always-ready encoder.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::builder().spawn().await
    }

    #[must_use]
    pub fn builder() -> TestCastServerBuilder {
        TestCastServerBuilder::default()
    }

    /// Base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, username: &str) -> String {
        format!("ws://{}/ws?username={}", self.addr, username)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn engine(&self) -> &Arc<LocalMediaEngine> {
        &self.engine
    }

    pub fn encoder(&self) -> &MockEncoder {
        &self.encoder
    }

    pub fn workspace(&self) -> &TestWorkspace {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    /// Open a signaling connection and wait for its `connected` event.
    pub async fn connect(&self, username: &str) -> Result<SignalingClient, anyhow::Error> {
        SignalingClient::connect(&self.ws_url(username)).await
    }

    /// Poll `condition` until it holds or `CLIENT_TIMEOUT` passes.
    pub async fn wait_until<F>(&self, mut condition: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + CLIENT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    /// Run the service shutdown sequence.
    pub async fn shutdown(mut self) -> RouterExit {
        let exit = match self.runtime.take() {
            Some(runtime) => runtime.shutdown().await,
            None => RouterExit::Shutdown,
        };
        self.handle.abort();
        exit
    }
}

impl Drop for TestCastServer {
    fn drop(&mut self) {
        if let Some(runtime) = &self.runtime {
            runtime.cancel_token().cancel();
        }
        self.handle.abort();
    }
}

/// Error reply to a signaling request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

/// A participant's signaling connection.
pub struct SignalingClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    events: VecDeque<Value>,
    session_id: String,
    send_transport: Option<String>,
    recv_transport: Option<String>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;

        let mut client = Self {
            stream,
            next_id: 0,
            events: VecDeque::new(),
            session_id: String::new(),
            send_transport: None,
            recv_transport: None,
        };

        let connected = client
            .expect_event("connected")
            .await
            .ok_or_else(|| anyhow::anyhow!("No connected event"))?;
        client.session_id = connected["sessionId"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("connected event without sessionId"))?
            .to_string();
        Ok(client)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send a request and wait for its reply. Events read meanwhile are kept.
    ///
    /// # Panics
    ///
    /// If no reply arrives within `CLIENT_TIMEOUT` or the socket closes.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = json!({"id": id, "method": method, "params": params});
        self.send_raw(&frame.to_string()).await;

        loop {
            let value = self.read_frame().await.expect("socket closed awaiting reply");
            if value.get("event").is_some() {
                self.events.push_back(value);
                continue;
            }
            if value["id"].as_u64() != Some(id) {
                continue;
            }
            if let Some(error) = value.get("error") {
                return Err(RpcError {
                    code: error["code"].as_str().unwrap_or_default().to_string(),
                    message: error["message"].as_str().unwrap_or_default().to_string(),
                });
            }
            return Ok(value["result"].clone());
        }
    }

    /// Send a text frame as is.
    pub async fn send_raw(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .expect("send frame");
    }

    /// Next event envelope (`{"event", "data"}`), if one arrives in time.
    pub async fn next_event(&mut self) -> Option<Value> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        loop {
            let value = self.read_frame().await?;
            if value.get("event").is_some() {
                return Some(value);
            }
        }
    }

    /// Data of the next event named `name`, skipping others.
    pub async fn expect_event(&mut self, name: &str) -> Option<Value> {
        loop {
            let event = self.next_event().await?;
            if event["event"] == name {
                return Some(event["data"].clone());
            }
        }
    }

    /// True if no event arrives within `wait`.
    pub async fn no_event_within(&mut self, wait: Duration) -> bool {
        if !self.events.is_empty() {
            return false;
        }
        match tokio::time::timeout(wait, self.stream.next()).await {
            Err(_) => true,
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                let is_event = value.get("event").is_some();
                if is_event {
                    self.events.push_back(value);
                }
                !is_event
            }
            Ok(_) => true,
        }
    }

    /// True once the server closed the socket.
    pub async fn is_closed_by_server(&mut self) -> bool {
        loop {
            match tokio::time::timeout(CLIENT_TIMEOUT, self.stream.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    pub async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<String, RpcError> {
        let result = self
            .request("create-webrtc-transport", json!({"direction": direction}))
            .await?;
        Ok(result["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn connect_transport(&mut self, transport_id: &str) -> Result<Value, RpcError> {
        self.request(
            "transport-connect",
            json!({"transportId": transport_id, "dtlsParameters": fixtures::dtls_parameters()}),
        )
        .await
    }

    /// Produce one track on this client's send transport, creating it first
    /// if needed. Returns the producer id.
    pub async fn publish(&mut self, kind: MediaKind) -> Result<String, RpcError> {
        let transport_id = match &self.send_transport {
            Some(id) => id.clone(),
            None => {
                let id = self.create_transport(TransportDirection::Send).await?;
                self.send_transport = Some(id.clone());
                id
            }
        };
        let result = self
            .request(
                "produce",
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": fixtures::rtp_parameters(kind),
                    "appData": {},
                }),
            )
            .await?;
        Ok(result["id"].as_str().unwrap_or_default().to_string())
    }

    /// Consume a producer on this client's receive transport, creating it
    /// first if needed.
    pub async fn subscribe(&mut self, producer_id: &str) -> Result<Value, RpcError> {
        let transport_id = match &self.recv_transport {
            Some(id) => id.clone(),
            None => {
                let id = self.create_transport(TransportDirection::Recv).await?;
                self.recv_transport = Some(id.clone());
                id
            }
        };
        self.request(
            "consume",
            json!({
                "transportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": fixtures::receive_capabilities(),
            }),
        )
        .await
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }

    async fn read_frame(&mut self) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(CLIENT_TIMEOUT, self.stream.next())
                .await
                .ok()??
                .ok()?;
            match message {
                Message::Text(text) => return serde_json::from_str(&text).ok(),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }
}
