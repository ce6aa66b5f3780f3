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

//! The attestation document served by an enclave and the checks that only
//! depend on the document itself (key decoding and key binding).

use core::fmt;

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
    Engine,
};
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::error::AttestationError;

/// The length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Attestation document as returned by `GET <attestation_endpoint>`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AttestationDocument {
    #[serde(alias = "attestationType")]
    pub attestation_type: String,
    pub quote: String,
    /// Hex or base64 encoding of the enclave's X25519 public key.
    #[serde(alias = "publicKey")]
    pub public_key: String,
    /// Hex string whose prefix must be the SHA-256 digest of the public key.
    #[serde(default, alias = "reportData", skip_serializing_if = "Option::is_none")]
    pub report_data: Option<String>,
}

impl AttestationDocument {
    pub fn decoded_public_key(&self) -> Result<PublicKey, AttestationError> {
        PublicKey::decode(&self.public_key)
    }

    /// Checks that `report_data` starts with the lowercase hex SHA-256 digest
    /// of `public_key`, ignoring case. This binds the key to the evidence and
    /// is what stops an intermediary from substituting its own key.
    pub fn verify_binding(&self, public_key: &PublicKey) -> Result<(), AttestationError> {
        let report_data = self
            .report_data
            .as_deref()
            .ok_or_else(|| AttestationError::BindingFailed("report_data is missing".to_owned()))?;
        let expected = public_key.sha256_hex();
        let bound = report_data
            .get(..expected.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(&expected));
        if !bound {
            return Err(AttestationError::BindingFailed(format!(
                "report_data does not start with {expected}"
            )));
        }
        Ok(())
    }
}

/// An X25519 public key with value semantics.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn new(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decodes a key given as hex (if the string only contains hex digits) or
    /// as base64. The decoded key must be exactly [`PUBLIC_KEY_LEN`] bytes.
    pub fn decode(encoded: &str) -> Result<Self, AttestationError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(AttestationError::InvalidPublicKey("empty public key".to_owned()));
        }
        let bytes = if encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(encoded)
                .map_err(|err| AttestationError::InvalidPublicKey(format!("bad hex: {err}")))?
        } else {
            STANDARD
                .decode(encoded)
                .or_else(|_| URL_SAFE.decode(encoded))
                .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
                .map_err(|err| AttestationError::InvalidPublicKey(format!("bad base64: {err}")))?
        };
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            AttestationError::InvalidPublicKey(format!(
                "expected {PUBLIC_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn sha256(&self) -> [u8; 32] {
        sha2::Sha256::digest(self.0).into()
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256())
    }
}

impl From<[u8; PUBLIC_KEY_LEN]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
