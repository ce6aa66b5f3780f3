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

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("handshake message is malformed")]
    InvalidHandshake,
    #[error("peer public key is invalid")]
    InvalidPublicKey,
    #[error("AEAD seal failed")]
    EncryptFailed,
    #[error("AEAD open failed")]
    DecryptFailed,
    #[error("HKDF expansion failed")]
    KeyDerivation,
    #[error("nonce space exhausted")]
    NonceExhausted,
    #[error("message of {0} bytes exceeds the maximum size")]
    DataTooLarge(usize),
    #[error("cipher keys have been erased")]
    KeyErased,
}
