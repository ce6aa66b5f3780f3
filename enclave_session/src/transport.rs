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

//! Duplex frame carrier over a WebSocket.
//!
//! The write half sits behind its own lock while a reader task moves inbound
//! frames into an unbounded queue, so sending never waits on receiving. Frames
//! are delivered in wire order and none are dropped.

use std::{
    sync::{Arc, Mutex as SyncMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use log::{debug, info, warn};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_tungstenite::{
    tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

use crate::ChannelError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl TransportState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// A frame taken off the inbound queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Data(Vec<u8>),
    /// The peer sent a zero-length frame. Encrypted payloads always carry an
    /// AEAD tag, so an empty frame can only be this marker.
    EndOfStream,
}

impl InboundFrame {
    fn from_bytes(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            Self::EndOfStream
        } else {
            Self::Data(bytes)
        }
    }
}

/// A duplex carrier of opaque frames.
///
/// `send` and `receive` may be driven concurrently from different tasks.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Returns the next inbound frame. Once the peer has gone away the frames
    /// still queued are returned first, then [`ChannelError::ConnectionClosed`].
    async fn receive(&self) -> Result<InboundFrame, ChannelError>;

    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Moves the state to `terminal` unless a terminal state was already reached,
/// so observers see exactly one of `Closed` and `Failed`.
fn finish(state: &watch::Sender<TransportState>, terminal: TransportState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() {
            false
        } else {
            *current = terminal;
            true
        }
    })
}

/// Marks the transport `Closed` if `establish` is dropped before completing.
struct ConnectGuard<'a> {
    state: &'a watch::Sender<TransportState>,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("transport establishment cancelled");
            finish(self.state, TransportState::Closed);
        }
    }
}

/// WebSocket implementation of [`FrameTransport`].
pub struct TransportClient {
    state: Arc<watch::Sender<TransportState>>,
    writer: Arc<Mutex<Option<WsSink>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundFrame>>>,
    keep_alive_interval: Duration,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl TransportClient {
    /// A zero `keep_alive_interval` disables pings.
    pub fn new(keep_alive_interval: Duration) -> Self {
        let (state, _) = watch::channel(TransportState::Idle);
        Self {
            state: Arc::new(state),
            writer: Arc::new(Mutex::new(None)),
            inbound: Mutex::new(None),
            keep_alive_interval,
            tasks: SyncMutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Connects to `url` and resolves once the socket is open. A transport
    /// can be established only once.
    pub async fn establish(&self, url: &str) -> Result<(), ChannelError> {
        let started = self.state.send_if_modified(|current| {
            if *current == TransportState::Idle {
                *current = TransportState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ChannelError::ConnectionFailed(format!(
                "transport is {:?}, not idle",
                self.state()
            )));
        }
        let mut guard = ConnectGuard { state: &self.state, armed: true };

        let connected = tokio_tungstenite::connect_async(url).await;
        guard.armed = false;
        let (stream, _) = match connected {
            Ok(connected) => connected,
            Err(err) => {
                warn!("couldn't connect to {url}: {err}");
                finish(&self.state, TransportState::Failed);
                return Err(ChannelError::ConnectionFailed(err.to_string()));
            }
        };
        // The establish future may have been outlived by a `close()`.
        if self.state().is_terminal() {
            return Err(ChannelError::ConnectionClosed);
        }

        let (sink, stream) = stream.split();
        *self.writer.lock().await = Some(sink);
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.inbound.lock().await = Some(receiver);

        let mut tasks = vec![tokio::spawn(read_frames(stream, sender, self.state.clone()))];
        if !self.keep_alive_interval.is_zero() {
            tasks.push(tokio::spawn(keep_alive(
                self.writer.clone(),
                self.state.clone(),
                self.keep_alive_interval,
            )));
        }
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(tasks);

        self.state.send_if_modified(|current| {
            if *current == TransportState::Connecting {
                *current = TransportState::Open;
                true
            } else {
                false
            }
        });
        info!("transport connected to {url}");
        Ok(())
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl FrameTransport for TransportClient {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ChannelError> {
        if self.state() != TransportState::Open {
            return Err(ChannelError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ChannelError::NotConnected)?;
        if let Err(err) = sink.send(Message::Binary(frame.into())).await {
            warn!("couldn't write frame: {err}");
            finish(&self.state, TransportState::Failed);
            return Err(ChannelError::ConnectionFailed(err.to_string()));
        }
        Ok(())
    }

    async fn receive(&self) -> Result<InboundFrame, ChannelError> {
        let mut inbound = self.inbound.lock().await;
        let receiver = inbound.as_mut().ok_or(ChannelError::NotConnected)?;
        receiver.recv().await.ok_or(ChannelError::ConnectionClosed)
    }

    async fn close(&self) {
        let was_open = self.state.send_if_modified(|current| {
            if *current == TransportState::Open {
                *current = TransportState::Closing;
                true
            } else {
                false
            }
        });
        if was_open {
            if let Some(mut sink) = self.writer.lock().await.take() {
                if let Err(err) = sink.send(Message::Close(None)).await {
                    debug!("couldn't send close frame: {err}");
                }
                let _ = sink.close().await;
            }
        }
        // Stopping the reader ends the inbound queue once it is drained.
        self.abort_tasks();
        if finish(&self.state, TransportState::Closed) {
            info!("transport closed");
        }
    }

    fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn read_frames(
    mut stream: SplitStream<WsStream>,
    sender: mpsc::UnboundedSender<InboundFrame>,
    state: Arc<watch::Sender<TransportState>>,
) {
    let terminal = loop {
        match stream.next().await {
            Some(Ok(Message::Binary(bytes))) => {
                let _ = sender.send(InboundFrame::from_bytes(bytes.to_vec()));
            }
            Some(Ok(Message::Text(text))) => {
                let _ = sender.send(InboundFrame::from_bytes(text.as_bytes().to_vec()));
            }
            Some(Ok(Message::Close(frame))) => {
                debug!("peer closed the connection: {frame:?}");
                break TransportState::Closed;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                let current = *state.borrow();
                if current.is_terminal() || current == TransportState::Closing {
                    break TransportState::Closed;
                }
                warn!("transport read failed: {err}");
                break TransportState::Failed;
            }
            None => break TransportState::Closed,
        }
    };
    finish(&state, terminal);
}

async fn keep_alive(
    writer: Arc<Mutex<Option<WsSink>>>,
    state: Arc<watch::Sender<TransportState>>,
    period: Duration,
) {
    let mut watcher = state.subscribe();
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = watcher.changed() => {
                if changed.is_err() || watcher.borrow().is_terminal() {
                    return;
                }
                continue;
            }
        }
        if *state.borrow() != TransportState::Open {
            return;
        }
        let mut writer = writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return;
        };
        if let Err(err) = sink.send(Message::Ping(Vec::new().into())).await {
            warn!("keep-alive ping failed: {err}");
            finish(&state, TransportState::Failed);
            return;
        }
        debug!("keep-alive ping sent");
    }
}
