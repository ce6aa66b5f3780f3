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

use std::sync::Arc;

use enclave_attestation::{
    AttestationFetcher, AttestationVerifier, PublicKey, QuoteKind, QuoteVerifier,
};
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio::{sync::Mutex, time::Instant};

use crate::{
    channel::SecureChannel,
    config::SessionConfig,
    directory::{EnclaveConfig, EnclaveDirectory, EnclaveRpc},
    streaming::{self, ChatRequest, StreamEvent},
    transport::{FrameTransport, TransportClient},
    ChannelError,
};

/// A client session: the attestation cache, the enclave assignments and at
/// most one open secure channel.
pub struct EnclaveClient {
    config: SessionConfig,
    verifier: AttestationVerifier,
    directory: EnclaveDirectory,
    channel: Mutex<Option<Arc<SecureChannel>>>,
}

impl EnclaveClient {
    pub fn new(
        config: SessionConfig,
        rpc: Arc<dyn EnclaveRpc>,
        fetcher: Arc<dyn AttestationFetcher>,
    ) -> Self {
        let verifier = AttestationVerifier::new(fetcher, config.verifier_config());
        let directory =
            EnclaveDirectory::new(rpc, config.model_cache_ttl(), &config.default_tier);
        Self { config, verifier, directory, channel: Mutex::new(None) }
    }

    /// Registers the chain verifier used for quotes of `kind`.
    pub fn with_quote_verifier(mut self, kind: QuoteKind, verifier: Arc<dyn QuoteVerifier>) -> Self {
        self.verifier = self.verifier.with_quote_verifier(kind, verifier);
        self
    }

    pub fn directory(&self) -> &EnclaveDirectory {
        &self.directory
    }

    pub fn verifier(&self) -> &AttestationVerifier {
        &self.verifier
    }

    /// Attests `enclave`, opens its WebSocket and runs the handshake against
    /// the attested key. Any channel already open is closed first. Opening the
    /// socket and the handshake share one `handshake_timeout` deadline.
    pub async fn connect(&self, enclave: &EnclaveConfig) -> Result<(), ChannelError> {
        self.disconnect().await;
        let server_public_key = self.trusted_key(enclave).await?;

        let deadline = Instant::now() + self.config.handshake_timeout();
        let transport = Arc::new(TransportClient::new(self.config.keep_alive_interval()));
        // Dropping `establish` on timeout leaves the transport closed.
        match tokio::time::timeout_at(deadline, transport.establish(&enclave.ws_endpoint)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("timed out connecting to {}", enclave.ws_endpoint);
                return Err(ChannelError::ConnectionTimeout);
            }
        }

        let transport: Arc<dyn FrameTransport> = transport;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let channel = SecureChannel::handshake(transport, &server_public_key, remaining)
            .await?
            .with_drain_timeout(self.config.response_drain_timeout());

        let mut current = self.channel.lock().await;
        if let Some(previous) = current.replace(Arc::new(channel)) {
            debug!("closing a channel opened by a concurrent connect");
            previous.close().await;
        }
        info!("connected to enclave {}", enclave.id);
        Ok(())
    }

    /// Requests an enclave for `model_id` and connects to it. The assignment
    /// is released again if the connection cannot be set up.
    pub async fn connect_model(&self, model_id: &str, session_id: &str) -> Result<(), ChannelError> {
        let enclave = self
            .directory
            .request_enclave(model_id, session_id)
            .await
            .ok_or_else(|| ChannelError::AssignmentFailed(format!("no enclave for {model_id}")))?;
        if let Err(err) = self.connect(&enclave).await {
            warn!("couldn't connect to enclave {} for {model_id}: {err}", enclave.id);
            self.directory.release_enclave(model_id).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.as_ref().is_some_and(|channel| channel.is_connected())
    }

    /// Sends `request` and streams the decoded response events.
    pub async fn stream_chat(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, StreamEvent>, ChannelError> {
        let channel = self.channel.lock().await.clone().ok_or(ChannelError::NotConnected)?;
        streaming::stream_chat(&channel, request, self.config.malformed_frame_policy).await
    }

    pub async fn disconnect(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
            info!("disconnected");
        }
    }

    /// Closes the channel and releases every enclave assignment.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.directory.release_all().await;
    }

    async fn trusted_key(&self, enclave: &EnclaveConfig) -> Result<PublicKey, ChannelError> {
        let result = self
            .verifier
            .verify_for_enclave(&enclave.attestation_endpoint, &enclave.expected_measurements, false)
            .await;
        if result.is_valid || !enclave.allow_unverified || !cfg!(debug_assertions) {
            return Ok(result.into_public_key()?);
        }

        warn!(
            "attestation of enclave {} failed ({:?}), connecting unverified",
            enclave.id, result.error
        );
        let document = self.verifier.fetch_document(&enclave.attestation_endpoint).await?;
        Ok(document.decoded_public_key()?)
    }
}
