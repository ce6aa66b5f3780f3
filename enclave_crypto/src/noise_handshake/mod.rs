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

//! Noise NK handshake over X25519, AES-256-GCM and SHA-256.
//! See https://noiseexplorer.com/patterns/NK/
//!
//! The initiator knows the responder's static public key in advance (it is
//! obtained through attestation, never transmitted). The handshake is:
//!
//! ```text
//! <- s
//! ...
//! -> e, es
//! <- e, ee
//! ```

pub mod client;
mod crypto_wrapper;
mod error;
mod noise;

pub use crate::noise_handshake::{
    crypto_wrapper::{
        X25519Secret, AEAD_TAG_LEN, NONCE_LEN, SHA256_OUTPUT_LEN, SYMMETRIC_KEY_LEN, X25519_LEN,
    },
    error::Error,
    noise::{CipherState, PROTOCOL_NAME},
};
use crate::{noise_handshake::noise::Noise, EMPTY_ASSOCIATED_DATA};

/// Both parties mix this into the handshake hash before anything else.
pub const PROLOGUE: &[u8] = b"";

// 256MiB is a sane upper limit on a single transport message, far above what
// a chat request or a streamed chunk will ever need.
const MAX_MESSAGE_LEN: usize = 1 << 28;

/// A handshake message as it travels on the wire: the sender's ephemeral public
/// key followed by the AEAD-sealed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoiseMessage {
    pub ephemeral_public_key: [u8; X25519_LEN],
    pub ciphertext: Vec<u8>,
}

impl NoiseMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        [self.ephemeral_public_key.as_slice(), &self.ciphertext].concat()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < X25519_LEN + AEAD_TAG_LEN {
            return Err(Error::InvalidHandshake);
        }
        let (ephemeral_public_key, ciphertext) = bytes.split_at(X25519_LEN);
        Ok(Self {
            ephemeral_public_key: ephemeral_public_key
                .try_into()
                .map_err(|_| Error::InvalidHandshake)?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Utility for encrypting and decrypting traffic between the Noise endpoints,
/// holding one [`CipherState`] per traffic direction.
pub struct Crypter {
    read: CipherState,
    write: CipherState,
}

impl Crypter {
    fn new(read: CipherState, write: CipherState) -> Self {
        Self { read, write }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        if plaintext.len() > MAX_MESSAGE_LEN {
            return Err(Error::DataTooLarge(plaintext.len()));
        }
        self.write.encrypt_with_ad(EMPTY_ASSOCIATED_DATA, plaintext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        self.read.decrypt_with_ad(EMPTY_ASSOCIATED_DATA, ciphertext)
    }

    /// Zeroes both traffic keys.
    pub fn erase(&mut self) {
        self.read.erase();
        self.write.erase();
    }

    /// Separates the ciphers so that each direction can be driven on its own.
    /// Returns `(write, read)`.
    pub fn into_parts(self) -> (CipherState, CipherState) {
        (self.write, self.read)
    }
}

pub struct Response {
    pub crypter: Crypter,
    pub handshake_hash: [u8; SHA256_OUTPUT_LEN],
    pub response: NoiseMessage,
}

/// Performs the responder side of the NK pattern. `identity_key` is the
/// responder's static key whose public half the initiator already holds,
/// `in_data` is the initiator's first message, and `payload` is the
/// confirmation payload sealed into the reply.
pub fn respond_nk(
    identity_key: &X25519Secret,
    in_data: &[u8],
    payload: &[u8],
) -> Result<Response, Error> {
    let message = NoiseMessage::from_bytes(in_data)?;

    let mut noise = Noise::new();
    noise.mix_hash(PROLOGUE);
    noise.mix_hash(identity_key.public_key().as_slice());

    noise.mix_hash(message.ephemeral_public_key.as_slice());
    let es_ecdh_bytes = identity_key.diffie_hellman(&message.ephemeral_public_key)?;
    noise.mix_key(es_ecdh_bytes.as_slice())?;
    let plaintext = noise.decrypt_and_hash(&message.ciphertext)?;
    if !plaintext.is_empty() {
        return Err(Error::InvalidHandshake);
    }

    let ephemeral_key = X25519Secret::generate();
    let ephemeral_public_key = ephemeral_key.public_key();
    noise.mix_hash(ephemeral_public_key.as_slice());
    let ee_ecdh_bytes = ephemeral_key.diffie_hellman(&message.ephemeral_public_key)?;
    noise.mix_key(ee_ecdh_bytes.as_slice())?;
    let ciphertext = noise.encrypt_and_hash(payload)?;

    let (initiator_to_responder, responder_to_initiator) = noise.split()?;
    Ok(Response {
        crypter: Crypter::new(initiator_to_responder, responder_to_initiator),
        handshake_hash: noise.handshake_hash(),
        response: NoiseMessage { ephemeral_public_key, ciphertext },
    })
}
