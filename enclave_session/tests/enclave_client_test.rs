//
// Copyright 2026 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use assert_matches::assert_matches;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use enclave_attestation::{
    AttestationDocument, AttestationError, AttestationFetcher, PublicKey,
};
use enclave_crypto::noise_handshake::{respond_nk, X25519Secret};
use enclave_session::{
    directory::{EnclaveAllocation, EnclaveConfig, EnclaveHost, EnclaveRpc, ModelInfo},
    streaming::{ChatMessage, ChatRequest, StreamEvent},
    transport::{FrameTransport, InboundFrame, TransportClient, TransportState},
    ChannelError, EnclaveClient, SessionConfig,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{tungstenite::protocol::Message, WebSocketStream};

/// How the mock enclave answers each chat request.
#[derive(Clone)]
struct Script {
    chunks: Vec<serde_json::Value>,
    /// Drop the connection after the chunks instead of ending the stream.
    hang_up: bool,
}

impl Script {
    fn reply(text: &[&str]) -> Self {
        let mut chunks: Vec<_> =
            text.iter().map(|text| json!({"type": "text-delta", "text": text})).collect();
        chunks.push(json!({
            "type": "finish",
            "finishReason": "stop",
            "usage": {"promptTokens": 3, "completionTokens": text.len()}
        }));
        Self { chunks, hang_up: false }
    }
}

/// An enclave served over a local WebSocket.
struct MockEnclave {
    address: SocketAddr,
    public_key: PublicKey,
    connections: Arc<AtomicUsize>,
    /// Connections still being served.
    open: Arc<AtomicUsize>,
    requests: Arc<tokio::sync::Mutex<Vec<serde_json::Value>>>,
}

/// Counts a served connection until it ends.
struct OpenConnection(Arc<AtomicUsize>);

impl OpenConnection {
    fn new(open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(open)
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockEnclave {
    async fn start(script: Script) -> Self {
        let identity = Arc::new(X25519Secret::generate());
        let public_key = PublicKey::new(identity.public_key());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let (counter, gauge, log) = (connections.clone(), open.clone(), requests.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let connection = OpenConnection::new(gauge.clone());
                let (identity, script, log) = (identity.clone(), script.clone(), log.clone());
                tokio::spawn(async move {
                    serve(stream, identity, script, log).await;
                    drop(connection);
                });
            }
        });
        Self { address, public_key, connections, open, requests }
    }

    fn config(&self) -> EnclaveConfig {
        EnclaveConfig {
            id: "mock-enclave".to_owned(),
            ws_endpoint: format!("ws://{}", self.address),
            attestation_endpoint: format!("https://{}/attestation", self.address),
            allow_unverified: false,
            expected_measurements: vec![],
        }
    }

    fn document(&self) -> AttestationDocument {
        mock_document(&hex::encode(self.public_key.as_bytes()), &self.public_key)
    }
}

fn mock_document(encoded_key: &str, bound_key: &PublicKey) -> AttestationDocument {
    AttestationDocument {
        attestation_type: "mock-sev-snp".to_owned(),
        quote: STANDARD.encode([0x5A; 80]),
        public_key: encoded_key.to_owned(),
        report_data: Some(format!("{}{}", bound_key.sha256_hex(), "0".repeat(64))),
    }
}

async fn next_binary(ws: &mut WebSocketStream<TcpStream>) -> Option<Vec<u8>> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Binary(bytes)) => return Some(bytes.to_vec()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn serve(
    stream: TcpStream,
    identity: Arc<X25519Secret>,
    script: Script,
    requests: Arc<tokio::sync::Mutex<Vec<serde_json::Value>>>,
) {
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let Some(initial) = next_binary(&mut ws).await else {
        return;
    };
    // A client that holds the wrong key is hung up on.
    let Ok(response) = respond_nk(&identity, &initial, &[]) else {
        return;
    };
    ws.send(Message::Binary(response.response.to_bytes().into())).await.unwrap();
    let mut crypter = response.crypter;

    while let Some(frame) = next_binary(&mut ws).await {
        let request = crypter.decrypt(&frame).unwrap();
        requests.lock().await.push(serde_json::from_slice(&request).unwrap());
        for chunk in &script.chunks {
            let frame = crypter.encrypt(chunk.to_string().as_bytes()).unwrap();
            ws.send(Message::Binary(frame.into())).await.unwrap();
        }
        if script.hang_up {
            return;
        }
        ws.send(Message::Binary(Vec::new().into())).await.unwrap();
    }
}

struct StaticFetcher {
    document: AttestationDocument,
}

#[async_trait]
impl AttestationFetcher for StaticFetcher {
    async fn fetch(&self, _endpoint: &str) -> Result<AttestationDocument, AttestationError> {
        Ok(self.document.clone())
    }
}

/// Hands out the mock enclave and counts live assignments.
struct MockRpc {
    ws_endpoint: String,
    live: AtomicUsize,
}

#[async_trait]
impl EnclaveRpc for MockRpc {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo { id: "llama".into(), name: "Llama".into(), tier: None }])
    }

    async fn request_enclave(
        &self,
        model_id: &str,
        _tier: &str,
        _session_id: &str,
    ) -> anyhow::Result<EnclaveAllocation> {
        anyhow::ensure!(model_id == "llama", "unknown model {model_id}");
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(EnclaveAllocation {
            assignment_id: "assignment-1".into(),
            enclave: EnclaveHost { id: "mock-enclave".into(), host: "127.0.0.1".into(), port: 0 },
            ws_endpoint: self.ws_endpoint.clone(),
            attestation_endpoint: "https://mock/attestation".into(),
            allow_unverified: false,
            expected_measurements: vec![],
        })
    }

    async fn release_enclave(&self, _assignment_id: &str) -> anyhow::Result<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn session_config() -> SessionConfig {
    SessionConfig {
        handshake_timeout_secs: 5,
        response_drain_timeout_secs: 1,
        require_quote_verification: false,
        accept_mock_attestation: true,
        ..SessionConfig::default()
    }
}

fn client(enclave: &MockEnclave, document: AttestationDocument) -> (EnclaveClient, Arc<MockRpc>) {
    let rpc = Arc::new(MockRpc { ws_endpoint: enclave.config().ws_endpoint, live: 0.into() });
    let client =
        EnclaveClient::new(session_config(), rpc.clone(), Arc::new(StaticFetcher { document }));
    (client, rpc)
}

fn request(prompt: &str) -> ChatRequest {
    ChatRequest::new("llama", vec![ChatMessage::user(prompt)]).with_temperature(0.5)
}

#[tokio::test]
async fn streams_a_chat_completion_from_an_attested_enclave() {
    let enclave = MockEnclave::start(Script::reply(&["Hel", "lo"])).await;
    let (client, _) = client(&enclave, enclave.document());

    client.connect(&enclave.config()).await.unwrap();
    assert!(client.is_connected().await);

    let events: Vec<StreamEvent> = client.stream_chat(&request("hi")).await.unwrap().collect().await;
    assert_eq!(
        events,
        vec![
            StreamEvent::TextDelta("Hel".to_owned()),
            StreamEvent::TextDelta("lo".to_owned()),
            StreamEvent::Finish {
                reason: Some("stop".to_owned()),
                prompt_tokens: Some(3),
                completion_tokens: Some(2),
            },
        ]
    );
    assert_eq!(
        enclave.requests.lock().await[0],
        json!({
            "model": "llama",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "temperature": 0.5
        })
    );

    // The end-of-stream marker left behind by the first response does not
    // leak into the second.
    let events: Vec<StreamEvent> =
        client.stream_chat(&request("again")).await.unwrap().collect().await;
    assert_eq!(events.len(), 3);
    assert!(client.is_connected().await);
}

#[tokio::test]
async fn abandoned_stream_does_not_leak_into_next_response() {
    let enclave = MockEnclave::start(Script::reply(&["a", "b", "c"])).await;
    let (client, _) = client(&enclave, enclave.document());
    client.connect(&enclave.config()).await.unwrap();

    let mut events = client.stream_chat(&request("one")).await.unwrap();
    assert_eq!(events.next().await, Some(StreamEvent::TextDelta("a".to_owned())));
    drop(events);

    let events: Vec<StreamEvent> = client.stream_chat(&request("two")).await.unwrap().collect().await;
    assert_eq!(events.first(), Some(&StreamEvent::TextDelta("a".to_owned())));
    assert_eq!(events.len(), 4);
}

#[tokio::test]
async fn short_public_key_fails_before_connecting() {
    let enclave = MockEnclave::start(Script::reply(&["unused"])).await;
    let document = mock_document(&hex::encode([1u8; 16]), &enclave.public_key);
    let (client, _) = client(&enclave, document);

    let result = client.connect(&enclave.config()).await;

    assert_matches!(
        result,
        Err(ChannelError::AttestationFailed(AttestationError::InvalidPublicKey(_)))
    );
    assert_eq!(enclave.connections.load(Ordering::SeqCst), 0);
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn substituted_key_fails_binding() {
    let enclave = MockEnclave::start(Script::reply(&["unused"])).await;
    let impostor = PublicKey::new(X25519Secret::generate().public_key());
    let document = mock_document(&hex::encode(impostor.as_bytes()), &enclave.public_key);
    let (client, _) = client(&enclave, document);

    assert_matches!(
        client.connect(&enclave.config()).await,
        Err(ChannelError::AttestationFailed(AttestationError::BindingFailed(_)))
    );
    assert_eq!(enclave.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handshake_against_wrong_key_fails() {
    let enclave = MockEnclave::start(Script::reply(&["unused"])).await;
    // Correctly bound, but not the key the enclave holds.
    let other = PublicKey::new(X25519Secret::generate().public_key());
    let (client, _) = client(&enclave, mock_document(&hex::encode(other.as_bytes()), &other));

    let result = client.connect(&enclave.config()).await;

    assert_matches!(result, Err(ChannelError::HandshakeFailed(_) | ChannelError::ConnectionClosed));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn connection_loss_mid_stream_ends_with_one_error() {
    let mut script = Script::reply(&["partial"]);
    script.chunks.truncate(1);
    script.hang_up = true;
    let enclave = MockEnclave::start(script).await;
    let (client, _) = client(&enclave, enclave.document());
    client.connect(&enclave.config()).await.unwrap();

    let events: Vec<StreamEvent> = client.stream_chat(&request("hi")).await.unwrap().collect().await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], StreamEvent::TextDelta("partial".to_owned()));
    assert_matches!(events[1], StreamEvent::Error(_));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn connect_model_and_shutdown_manage_the_assignment() {
    let enclave = MockEnclave::start(Script::reply(&["ok"])).await;
    let (client, rpc) = client(&enclave, enclave.document());

    client.connect_model("llama", "session-1").await.unwrap();
    assert!(client.is_connected().await);
    assert_eq!(rpc.live.load(Ordering::SeqCst), 1);
    assert_eq!(client.directory().assignment("llama").await.unwrap().session_id, "session-1");

    client.shutdown().await;
    assert!(!client.is_connected().await);
    assert_eq!(rpc.live.load(Ordering::SeqCst), 0);
    assert_matches!(client.stream_chat(&request("hi")).await.err(), Some(ChannelError::NotConnected));
}

#[tokio::test]
async fn failed_connect_releases_the_assignment() {
    let enclave = MockEnclave::start(Script::reply(&["unused"])).await;
    let impostor = PublicKey::new(X25519Secret::generate().public_key());
    let document = mock_document(&hex::encode(impostor.as_bytes()), &enclave.public_key);
    let (client, rpc) = client(&enclave, document);

    assert_matches!(
        client.connect_model("llama", "session-1").await,
        Err(ChannelError::AttestationFailed(_))
    );
    assert_eq!(rpc.live.load(Ordering::SeqCst), 0);
    assert_matches!(
        client.directory().assignment("llama").await,
        Err(ChannelError::AssignmentNotFound(_))
    );
}

#[tokio::test]
async fn concurrent_connects_leave_one_channel_open() {
    let enclave = MockEnclave::start(Script::reply(&["ok"])).await;
    let (client, _) = client(&enclave, enclave.document());
    let config = enclave.config();

    let (first, second) = tokio::join!(client.connect(&config), client.connect(&config));
    first.unwrap();
    second.unwrap();

    assert!(client.is_connected().await);
    tokio::time::timeout(Duration::from_secs(2), async {
        while enclave.open.load(Ordering::SeqCst) > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the replaced channel was left open");
    let events: Vec<StreamEvent> = client.stream_chat(&request("hi")).await.unwrap().collect().await;
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn connect_shares_one_deadline_between_socket_and_handshake() {
    // Completes the WebSocket upgrade late and never answers the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            tokio::time::sleep(Duration::from_millis(700)).await;
            held.push(tokio_tungstenite::accept_async(stream).await.unwrap());
        }
    });
    let enclave = MockEnclave::start(Script::reply(&["unused"])).await;
    let config = EnclaveConfig { ws_endpoint: format!("ws://{address}"), ..enclave.config() };
    let client = EnclaveClient::new(
        SessionConfig { handshake_timeout_secs: 1, ..session_config() },
        Arc::new(MockRpc { ws_endpoint: config.ws_endpoint.clone(), live: 0.into() }),
        Arc::new(StaticFetcher { document: enclave.document() }),
    );

    let started = std::time::Instant::now();
    let result = client.connect(&config).await;

    assert_eq!(result.err(), Some(ChannelError::ConnectionTimeout));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn transport_pings_an_idle_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let (pinged, ping_seen) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut pinged = Some(pinged);
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Ping(_) = message {
                if let Some(pinged) = pinged.take() {
                    let _ = pinged.send(());
                }
            }
        }
    });
    let transport = TransportClient::new(Duration::from_millis(50));
    transport.establish(&format!("ws://{address}")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), ping_seen)
        .await
        .expect("no keep-alive ping")
        .unwrap();
    assert!(transport.is_open());
    transport.close().await;
}

#[tokio::test]
async fn connect_model_reports_failed_assignment() {
    let enclave = MockEnclave::start(Script::reply(&["ok"])).await;
    let (client, _) = client(&enclave, enclave.document());

    assert_matches!(
        client.connect_model("unknown", "session-1").await,
        Err(ChannelError::AssignmentFailed(_))
    );
}

#[tokio::test]
async fn transport_delivers_frames_in_order_then_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Binary(b"abc".to_vec().into())).await.unwrap();
        ws.send(Message::Binary(Vec::new().into())).await.unwrap();
        ws.send(Message::Text("hi".to_owned().into())).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let transport = TransportClient::new(Duration::from_secs(15));
    let mut states = transport.subscribe();
    assert_eq!(transport.state(), TransportState::Idle);
    assert_eq!(transport.send(b"early".to_vec()).await, Err(ChannelError::NotConnected));

    transport.establish(&format!("ws://{address}")).await.unwrap();
    assert_eq!(transport.state(), TransportState::Open);

    assert_eq!(transport.receive().await, Ok(InboundFrame::Data(b"abc".to_vec())));
    assert_eq!(transport.receive().await, Ok(InboundFrame::EndOfStream));
    assert_eq!(transport.receive().await, Ok(InboundFrame::Data(b"hi".to_vec())));
    assert_eq!(transport.receive().await, Err(ChannelError::ConnectionClosed));

    states.wait_for(|state| state.is_terminal()).await.unwrap();
    assert_eq!(transport.state(), TransportState::Closed);
    assert!(!transport.is_open());
}

#[tokio::test]
async fn transport_close_is_terminal() {
    let enclave = MockEnclave::start(Script::reply(&["unused"])).await;
    let transport = TransportClient::new(Duration::from_millis(10));
    transport.establish(&enclave.config().ws_endpoint).await.unwrap();

    transport.close().await;
    transport.close().await;

    assert_eq!(transport.state(), TransportState::Closed);
    assert_eq!(transport.send(b"late".to_vec()).await, Err(ChannelError::NotConnected));
    assert_eq!(transport.receive().await, Err(ChannelError::ConnectionClosed));
    assert_matches!(
        transport.establish(&enclave.config().ws_endpoint).await,
        Err(ChannelError::ConnectionFailed(_))
    );
}

#[tokio::test]
async fn unreachable_endpoint_fails_transport() {
    let address = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let transport = TransportClient::new(Duration::from_secs(15));

    let result = transport.establish(&format!("ws://{address}")).await;

    assert_matches!(result, Err(ChannelError::ConnectionFailed(_)));
    assert_eq!(transport.state(), TransportState::Failed);
}

#[tokio::test]
async fn cancelled_establish_leaves_transport_closed() {
    // Accepts TCP connections but never completes the WebSocket upgrade.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let transport = TransportClient::new(Duration::from_secs(15));

    let result = tokio::time::timeout(
        Duration::from_millis(100),
        transport.establish(&format!("ws://{address}")),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(transport.state(), TransportState::Closed);
}
