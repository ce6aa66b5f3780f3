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

use crate::noise_handshake::{
    crypto_wrapper::{X25519Secret, SHA256_OUTPUT_LEN, X25519_LEN},
    error::Error,
    noise::Noise,
    Crypter, NoiseMessage, PROLOGUE,
};

/// What the initiator learns from a completed handshake.
pub struct InitiatorResult {
    pub handshake_hash: [u8; SHA256_OUTPUT_LEN],
    /// Confirmation payload sent by the responder in its reply.
    pub payload: Vec<u8>,
    pub crypter: Crypter,
}

/// Initiator side of the NK pattern.
///
/// A fresh ephemeral key is generated for every initiator, and
/// [`HandshakeInitiator::process_response`] consumes it, so a failed
/// handshake can never be retried with the same ephemeral key.
pub struct HandshakeInitiator {
    noise: Noise,
    peer_identity_pub_key: [u8; X25519_LEN],
    ephemeral_priv_key: X25519Secret,
    initial_message_sent: bool,
}

impl HandshakeInitiator {
    pub fn new_nk(peer_public_key: &[u8; X25519_LEN]) -> Self {
        Self {
            noise: Noise::new(),
            peer_identity_pub_key: *peer_public_key,
            ephemeral_priv_key: X25519Secret::generate(),
            initial_message_sent: false,
        }
    }

    pub fn build_initial_message(&mut self) -> Result<NoiseMessage, Error> {
        if self.initial_message_sent {
            return Err(Error::InvalidHandshake);
        }
        self.noise.mix_hash(PROLOGUE);
        self.noise.mix_hash(self.peer_identity_pub_key.as_slice());

        let ephemeral_public_key = self.ephemeral_priv_key.public_key();
        self.noise.mix_hash(ephemeral_public_key.as_slice());
        let es_ecdh_bytes = self.ephemeral_priv_key.diffie_hellman(&self.peer_identity_pub_key)?;
        self.noise.mix_key(es_ecdh_bytes.as_slice())?;

        let ciphertext = self.noise.encrypt_and_hash(&[])?;
        self.initial_message_sent = true;
        Ok(NoiseMessage { ephemeral_public_key, ciphertext })
    }

    pub fn process_response(
        mut self,
        handshake_response: &NoiseMessage,
    ) -> Result<InitiatorResult, Error> {
        if !self.initial_message_sent {
            return Err(Error::InvalidHandshake);
        }
        let peer_ephemeral_key = &handshake_response.ephemeral_public_key;
        self.noise.mix_hash(peer_ephemeral_key.as_slice());
        let ee_ecdh_bytes = self.ephemeral_priv_key.diffie_hellman(peer_ephemeral_key)?;
        self.noise.mix_key(ee_ecdh_bytes.as_slice())?;
        let payload = self.noise.decrypt_and_hash(&handshake_response.ciphertext)?;

        let (write, read) = self.noise.split()?;
        Ok(InitiatorResult {
            handshake_hash: self.noise.handshake_hash(),
            payload,
            crypter: Crypter::new(read, write),
        })
    }
}
