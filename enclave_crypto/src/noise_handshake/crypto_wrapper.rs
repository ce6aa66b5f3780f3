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

//! Wrappers over the RustCrypto and dalek primitives used by the handshake.

use aes_gcm::{aead::AeadInPlace, Aes256Gcm, Key, KeyInit};
use rand_core::OsRng;
use sha2::Digest;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::noise_handshake::error::Error;

pub const NONCE_LEN: usize = 12;
pub const SHA256_OUTPUT_LEN: usize = 32;
pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const AEAD_TAG_LEN: usize = 16;

/// The length of an X25519 public key, private key or shared secret.
pub const X25519_LEN: usize = 32;

/// Perform the HKDF operation from https://datatracker.ietf.org/doc/html/rfc5869
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], output: &mut [u8]) -> Result<(), Error> {
    hkdf::Hkdf::<sha2::Sha256>::new(Some(salt), ikm)
        .expand(info, output)
        .map_err(|_| Error::KeyDerivation)
}

pub fn aes_256_gcm_seal_in_place(
    key: &[u8; SYMMETRIC_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &mut Vec<u8>,
) -> Result<(), Error> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()))
        .encrypt_in_place(nonce.into(), aad, plaintext)
        .map_err(|_| Error::EncryptFailed)
}

pub fn aes_256_gcm_open_in_place(
    key: &[u8; SYMMETRIC_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    mut ciphertext: Vec<u8>,
) -> Result<Vec<u8>, Error> {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()))
        .decrypt_in_place(nonce.into(), aad, &mut ciphertext)
        .map_err(|_| Error::DecryptFailed)?;
    Ok(ciphertext)
}

/// Compute the SHA-256 hash of the concatenation of two inputs.
pub fn sha256_two_part(input1: &[u8], input2: &[u8]) -> [u8; SHA256_OUTPUT_LEN] {
    let mut ctx = sha2::Sha256::new();
    ctx.update(input1);
    ctx.update(input2);
    ctx.finalize().into()
}

/// An X25519 private key. Used both for the initiator's ephemeral key, which
/// takes part in two DH operations in NK and therefore cannot be a single-use
/// `EphemeralSecret`, and for a responder's static identity key.
///
/// The underlying secret is zeroed on drop.
pub struct X25519Secret {
    secret: StaticSecret,
}

impl X25519Secret {
    pub fn generate() -> Self {
        Self { secret: StaticSecret::random_from_rng(OsRng) }
    }

    pub fn public_key(&self) -> [u8; X25519_LEN] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// Computes the shared secret with `peer_public_key`. Low-order peer points
    /// produce an all-zero secret and are rejected.
    pub fn diffie_hellman(
        &self,
        peer_public_key: &[u8; X25519_LEN],
    ) -> Result<Zeroizing<[u8; X25519_LEN]>, Error> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public_key));
        if !shared.was_contributory() {
            return Err(Error::InvalidPublicKey);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}
