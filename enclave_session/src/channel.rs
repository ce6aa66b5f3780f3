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

//! End-to-end encrypted channel to an attested enclave.
//!
//! The enclave's static key comes from attestation. The client runs the
//! initiator side of Noise NK against it over a [`FrameTransport`] and then
//! seals every application frame under the per-direction keys.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as SyncMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use enclave_attestation::PublicKey;
use enclave_crypto::{
    noise_handshake::{
        client::HandshakeInitiator, CipherState, Crypter, Error as NoiseError, NoiseMessage,
        SHA256_OUTPUT_LEN,
    },
    EMPTY_ASSOCIATED_DATA,
};
use log::{debug, info, warn};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    transport::{FrameTransport, InboundFrame},
    ChannelError,
};

/// Progress of the client side of the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Uninitialized,
    SentInitiatorMessage,
    ReceivedResponderMessage,
    /// The traffic keys are available through
    /// [`ClientHandshaker::take_session_keys`].
    Established,
    Failed,
}

/// Client side of the Noise NK handshake, driven one message at a time.
pub struct ClientHandshaker {
    state: HandshakeState,
    initiator: Option<HandshakeInitiator>,
    handshake_hash: Option<[u8; SHA256_OUTPUT_LEN]>,
    session_keys: Option<SecureSessionKeys>,
}

impl ClientHandshaker {
    pub fn new(server_public_key: &PublicKey) -> Self {
        Self {
            state: HandshakeState::Uninitialized,
            initiator: Some(HandshakeInitiator::new_nk(server_public_key.as_bytes())),
            handshake_hash: None,
            session_keys: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Builds the `-> e, es` message.
    pub fn initial_message(&mut self) -> Result<Vec<u8>, ChannelError> {
        if self.state != HandshakeState::Uninitialized {
            return Err(self.fail(format!("initial message requested in state {:?}", self.state)));
        }
        let initiator =
            self.initiator.as_mut().ok_or(ChannelError::HandshakeFailed("no initiator".into()))?;
        match initiator.build_initial_message() {
            Ok(message) => {
                self.state = HandshakeState::SentInitiatorMessage;
                Ok(message.to_bytes())
            }
            Err(err) => Err(self.fail(format!("couldn't build initial message: {err}"))),
        }
    }

    /// Processes the `<- e, ee` reply and derives the traffic keys. Returns the
    /// responder's confirmation payload.
    pub fn process_response(&mut self, response: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if self.state != HandshakeState::SentInitiatorMessage {
            return Err(self.fail(format!("response received in state {:?}", self.state)));
        }
        self.state = HandshakeState::ReceivedResponderMessage;
        // Consuming the initiator discards the ephemeral key whatever happens.
        let initiator =
            self.initiator.take().ok_or(ChannelError::HandshakeFailed("no initiator".into()))?;
        let result = NoiseMessage::from_bytes(response)
            .and_then(|message| initiator.process_response(&message));
        match result {
            Ok(result) => {
                self.handshake_hash = Some(result.handshake_hash);
                self.session_keys = Some(SecureSessionKeys::new(result.crypter));
                self.state = HandshakeState::Established;
                Ok(result.payload)
            }
            Err(err) => Err(self.fail(format!("couldn't process response: {err}"))),
        }
    }

    pub fn take_session_keys(&mut self) -> Result<SecureSessionKeys, ChannelError> {
        self.session_keys
            .take()
            .ok_or(ChannelError::HandshakeFailed("handshake is not complete".to_owned()))
    }

    pub fn handshake_hash(&self) -> Option<[u8; SHA256_OUTPUT_LEN]> {
        self.handshake_hash
    }

    fn fail(&mut self, message: String) -> ChannelError {
        self.state = HandshakeState::Failed;
        self.initiator = None;
        ChannelError::HandshakeFailed(message)
    }
}

/// Traffic keys of an established session.
///
/// Each direction has its own key, nonce counter and lock. Closing zeroes both
/// keys and every later operation fails with [`ChannelError::ConnectionClosed`].
pub struct SecureSessionKeys {
    send: SyncMutex<CipherState>,
    receive: SyncMutex<CipherState>,
    closed: AtomicBool,
}

impl SecureSessionKeys {
    pub fn new(crypter: Crypter) -> Self {
        let (write, read) = crypter.into_parts();
        Self {
            send: SyncMutex::new(write),
            receive: SyncMutex::new(read),
            closed: AtomicBool::new(false),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut send = self.lock(&self.send)?;
        match send.encrypt_with_ad(EMPTY_ASSOCIATED_DATA, plaintext) {
            Ok(ciphertext) => Ok(ciphertext),
            Err(NoiseError::KeyErased) => Err(ChannelError::ConnectionClosed),
            Err(NoiseError::NonceExhausted) => {
                drop(send);
                warn!("send nonce space exhausted, closing session");
                self.close();
                Err(ChannelError::ConnectionClosed)
            }
            Err(err) => Err(ChannelError::EncryptionFailed(err.to_string())),
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut receive = self.lock(&self.receive)?;
        match receive.decrypt_with_ad(EMPTY_ASSOCIATED_DATA, ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(NoiseError::KeyErased) => Err(ChannelError::ConnectionClosed),
            Err(err) => {
                debug!("frame {} failed to decrypt: {err}", receive.nonce());
                Err(ChannelError::DecryptionFailed)
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.send.lock().unwrap_or_else(PoisonError::into_inner).erase();
        self.receive.lock().unwrap_or_else(PoisonError::into_inner).erase();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock<'a>(
        &self,
        cipher: &'a SyncMutex<CipherState>,
    ) -> Result<MutexGuard<'a, CipherState>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed);
        }
        cipher.lock().map_err(|_| ChannelError::ConnectionClosed)
    }
}

/// Recognizes the decrypted frame that ends a response when the peer does not
/// follow it with an end-of-stream marker.
pub type FinalFrame = fn(&[u8]) -> bool;

/// Bookkeeping for request/response exchanges, one at a time.
#[derive(Default)]
struct Exchange {
    /// A response was not read up to its end.
    response_pending: bool,
    /// The last response ended on a final frame, so an end-of-stream marker
    /// seen before any frame of the next response still belongs to it.
    trailing_marker: bool,
    final_frame: Option<FinalFrame>,
}

impl Exchange {
    /// Accounts for one decrypted frame. Returns whether it ends the response.
    fn observe(&mut self, plaintext: &[u8]) -> bool {
        self.trailing_marker = false;
        if self.final_frame.is_some_and(|is_final| is_final(plaintext)) {
            self.response_pending = false;
            self.trailing_marker = true;
            return true;
        }
        false
    }

    /// Accounts for an end-of-stream marker. Returns whether it ends the
    /// response rather than trailing the previous one.
    fn observe_end(&mut self) -> bool {
        if std::mem::take(&mut self.trailing_marker) {
            debug!("skipping the end-of-stream marker of the previous response");
            return false;
        }
        self.response_pending = false;
        true
    }
}

/// An established, encrypted channel.
pub struct SecureChannel {
    transport: Arc<dyn FrameTransport>,
    keys: SecureSessionKeys,
    handshake_hash: [u8; SHA256_OUTPUT_LEN],
    exchange: Arc<Mutex<Exchange>>,
    drain_timeout: Duration,
}

impl SecureChannel {
    /// Runs the handshake over an already open `transport`, bounded by
    /// `timeout`. On any failure the transport is closed.
    pub async fn handshake(
        transport: Arc<dyn FrameTransport>,
        server_public_key: &PublicKey,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let outcome =
            tokio::time::timeout(timeout, Self::run_handshake(&*transport, server_public_key))
                .await;
        let (keys, handshake_hash) = match outcome {
            Ok(Ok(established)) => established,
            Ok(Err(err)) => {
                warn!("handshake with {server_public_key} failed: {err}");
                transport.close().await;
                return Err(err);
            }
            Err(_) => {
                warn!("handshake with {server_public_key} timed out after {timeout:?}");
                transport.close().await;
                return Err(ChannelError::ConnectionTimeout);
            }
        };
        info!("secure channel established with {server_public_key}");
        Ok(Self {
            transport,
            keys,
            handshake_hash,
            exchange: Arc::new(Mutex::new(Exchange::default())),
            drain_timeout: Duration::from_secs(5),
        })
    }

    async fn run_handshake(
        transport: &dyn FrameTransport,
        server_public_key: &PublicKey,
    ) -> Result<(SecureSessionKeys, [u8; SHA256_OUTPUT_LEN]), ChannelError> {
        let mut handshaker = ClientHandshaker::new(server_public_key);
        transport.send(handshaker.initial_message()?).await?;
        debug!("handshake state: {:?}", handshaker.state());

        let response = match transport.receive().await? {
            InboundFrame::Data(response) => response,
            InboundFrame::EndOfStream => {
                return Err(ChannelError::HandshakeFailed("empty handshake response".to_owned()));
            }
        };
        handshaker.process_response(&response)?;
        debug!("handshake state: {:?}", handshaker.state());

        let handshake_hash = handshaker
            .handshake_hash()
            .ok_or(ChannelError::HandshakeFailed("missing handshake hash".to_owned()))?;
        Ok((handshaker.take_session_keys()?, handshake_hash))
    }

    /// Sets how long draining an abandoned response may wait for each frame.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Hash of the completed handshake transcript, usable for channel binding.
    pub fn handshake_hash(&self) -> &[u8; SHA256_OUTPUT_LEN] {
        &self.handshake_hash
    }

    pub fn is_connected(&self) -> bool {
        !self.keys.is_closed() && self.transport.is_open()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.keys.encrypt(plaintext)
    }

    /// Opens one inbound frame. A frame that fails to authenticate closes the
    /// session, since the receive nonce can no longer be trusted.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        self.keys.decrypt(ciphertext).map_err(|err| {
            if !self.keys.is_closed() {
                warn!("closing session: {err}");
                self.keys.close();
            }
            ChannelError::ConnectionClosed
        })
    }

    pub async fn close(&self) {
        self.keys.close();
        self.transport.close().await;
    }

    /// Sends one encrypted request frame and returns the frames of the
    /// response. Exchanges are serialized. If the previous response was
    /// abandoned, its remaining frames are discarded first.
    pub async fn send_and_stream(
        self: &Arc<Self>,
        plaintext: &[u8],
    ) -> Result<ResponseFrames, ChannelError> {
        self.start_exchange(plaintext, None).await
    }

    /// Like [`Self::send_and_stream`], but the response also ends after the
    /// first frame that `final_frame` accepts.
    pub async fn send_and_stream_until(
        self: &Arc<Self>,
        plaintext: &[u8],
        final_frame: FinalFrame,
    ) -> Result<ResponseFrames, ChannelError> {
        self.start_exchange(plaintext, Some(final_frame)).await
    }

    async fn start_exchange(
        self: &Arc<Self>,
        plaintext: &[u8],
        final_frame: Option<FinalFrame>,
    ) -> Result<ResponseFrames, ChannelError> {
        let mut exchange = self.exchange.clone().lock_owned().await;
        if !self.is_connected() {
            return Err(ChannelError::ConnectionClosed);
        }
        if exchange.response_pending {
            self.drain_response(&mut exchange).await?;
        }

        let ciphertext = self.encrypt(plaintext)?;
        if let Err(err) = self.transport.send(ciphertext).await {
            self.keys.close();
            return Err(err);
        }
        exchange.response_pending = true;
        exchange.final_frame = final_frame;
        Ok(ResponseFrames { channel: self.clone(), exchange, done: false })
    }

    /// Reads the rest of an abandoned response. A response that stays quiet
    /// for `drain_timeout` closes the session, as its remaining frames could
    /// otherwise be read as part of the next response.
    async fn drain_response(&self, exchange: &mut Exchange) -> Result<(), ChannelError> {
        let mut discarded = 0usize;
        while exchange.response_pending {
            match tokio::time::timeout(self.drain_timeout, self.transport.receive()).await {
                Ok(Ok(InboundFrame::EndOfStream)) => {
                    exchange.observe_end();
                }
                Ok(Ok(InboundFrame::Data(ciphertext))) => {
                    // Decrypting keeps the receive nonce in step with the peer.
                    let plaintext = self.decrypt(&ciphertext)?;
                    exchange.observe(&plaintext);
                    discarded += 1;
                }
                Ok(Err(err)) => {
                    self.keys.close();
                    return Err(err);
                }
                Err(_) => {
                    warn!(
                        "abandoned response idle for {:?}, closing session",
                        self.drain_timeout
                    );
                    self.close().await;
                    return Err(ChannelError::ConnectionClosed);
                }
            }
        }
        debug!("discarded {discarded} frames of an abandoned response");
        Ok(())
    }
}

/// Decrypted frames of one response, ending at the end-of-stream marker or
/// at a final frame.
///
/// Dropping this early leaves the rest of the response on the wire; the next
/// exchange discards it.
pub struct ResponseFrames {
    channel: Arc<SecureChannel>,
    exchange: OwnedMutexGuard<Exchange>,
    done: bool,
}

impl ResponseFrames {
    /// Returns the next decrypted frame, `None` at the end of the response.
    /// An error is returned at most once and ends the response.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, ChannelError>> {
        while !self.done {
            match self.channel.transport.receive().await {
                Ok(InboundFrame::EndOfStream) => {
                    self.done = self.exchange.observe_end();
                }
                Ok(InboundFrame::Data(ciphertext)) => {
                    return match self.channel.decrypt(&ciphertext) {
                        Ok(plaintext) => {
                            self.done = self.exchange.observe(&plaintext);
                            Some(Ok(plaintext))
                        }
                        Err(err) => {
                            self.done = true;
                            self.channel.close().await;
                            Some(Err(err))
                        }
                    };
                }
                Err(err) => {
                    self.done = true;
                    warn!("transport failed mid-response: {err}");
                    self.channel.close().await;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}
