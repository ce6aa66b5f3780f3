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

//! The symmetric state of a Noise handshake, as described in section 5 of
//! https://noiseprotocol.org/noise.html, fixed to the
//! `Noise_NK_25519_AESGCM_SHA256` protocol.

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::noise_handshake::{
    crypto_wrapper::{
        aes_256_gcm_open_in_place, aes_256_gcm_seal_in_place, hkdf_sha256, sha256_two_part,
        NONCE_LEN, SHA256_OUTPUT_LEN, SYMMETRIC_KEY_LEN,
    },
    error::Error,
};

pub const PROTOCOL_NAME: &[u8] = b"Noise_NK_25519_AESGCM_SHA256";
static_assertions::const_assert!(PROTOCOL_NAME.len() <= SHA256_OUTPUT_LEN);

// The maximum nonce value is reserved by Noise and must never be used.
const MAX_NONCE: u64 = u64::MAX;

/// A symmetric key plus its nonce counter. Used inside the handshake and,
/// after `split`, once per traffic direction.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherState {
    key: [u8; SYMMETRIC_KEY_LEN],
    nonce: u64,
    erased: bool,
}

impl CipherState {
    fn new(key: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self { key, nonce: 0, erased: false }
    }

    /// AES-GCM nonces are 32 zero bits followed by the big-endian counter.
    fn current_nonce(&self) -> Result<[u8; NONCE_LEN], Error> {
        if self.erased {
            return Err(Error::KeyErased);
        }
        if self.nonce == MAX_NONCE {
            return Err(Error::NonceExhausted);
        }
        let mut ret = [0u8; NONCE_LEN];
        ret[NONCE_LEN - 8..].copy_from_slice(self.nonce.to_be_bytes().as_slice());
        Ok(ret)
    }

    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = self.current_nonce()?;
        let mut buffer = plaintext.to_vec();
        aes_256_gcm_seal_in_place(&self.key, &nonce, ad, &mut buffer)?;
        self.nonce += 1;
        Ok(buffer)
    }

    /// The counter only advances when the ciphertext authenticates.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = self.current_nonce()?;
        let plaintext = aes_256_gcm_open_in_place(&self.key, &nonce, ad, ciphertext.to_vec())?;
        self.nonce += 1;
        Ok(plaintext)
    }

    /// Zeroes the key. Every later operation fails with [`Error::KeyErased`].
    pub fn erase(&mut self) {
        self.key.zeroize();
        self.erased = true;
    }

    pub fn is_erased(&self) -> bool {
        self.erased
    }

    /// The nonce that the next operation will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    #[cfg(test)]
    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Noise {
    chaining_key: [u8; SHA256_OUTPUT_LEN],
    h: [u8; SHA256_OUTPUT_LEN],
    cipher: Option<CipherState>,
}

impl Noise {
    pub fn new() -> Self {
        let mut h = [0u8; SHA256_OUTPUT_LEN];
        h[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
        Self { chaining_key: h, h, cipher: None }
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        self.h = sha256_two_part(&self.h, data);
    }

    pub fn mix_key(&mut self, input_key_material: &[u8]) -> Result<(), Error> {
        let mut output = Zeroizing::new([0u8; 2 * SHA256_OUTPUT_LEN]);
        hkdf_sha256(input_key_material, &self.chaining_key, &[], output.as_mut_slice())?;
        self.chaining_key.copy_from_slice(&output[..SHA256_OUTPUT_LEN]);
        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        key.copy_from_slice(&output[SHA256_OUTPUT_LEN..SHA256_OUTPUT_LEN + SYMMETRIC_KEY_LEN]);
        self.cipher = Some(CipherState::new(key));
        key.zeroize();
        Ok(())
    }

    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let ciphertext = match self.cipher.as_mut() {
            Some(cipher) => cipher.encrypt_with_ad(&self.h, plaintext)?,
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        let plaintext = match self.cipher.as_mut() {
            Some(cipher) => cipher.decrypt_with_ad(&self.h, ciphertext)?,
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derives the two transport ciphers. The first one protects traffic from
    /// the initiator to the responder, the second one the opposite direction.
    pub fn split(&self) -> Result<(CipherState, CipherState), Error> {
        let mut output = Zeroizing::new([0u8; 2 * SYMMETRIC_KEY_LEN]);
        hkdf_sha256(&[], &self.chaining_key, &[], output.as_mut_slice())?;
        let mut initiator_key = [0u8; SYMMETRIC_KEY_LEN];
        let mut responder_key = [0u8; SYMMETRIC_KEY_LEN];
        initiator_key.copy_from_slice(&output[..SYMMETRIC_KEY_LEN]);
        responder_key.copy_from_slice(&output[SYMMETRIC_KEY_LEN..]);
        let ciphers = (CipherState::new(initiator_key), CipherState::new(responder_key));
        initiator_key.zeroize();
        responder_key.zeroize();
        Ok(ciphers)
    }

    pub fn handshake_hash(&self) -> [u8; SHA256_OUTPUT_LEN] {
        self.h
    }
}

impl Default for Noise {
    fn default() -> Self {
        Self::new()
    }
}
