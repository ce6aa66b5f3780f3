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

use enclave_attestation::AttestationError;

/// Errors surfaced by the secure channel and the components around it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Attestation failed: {0}")]
    AttestationFailed(#[from] AttestationError),
    #[error("Timed out while connecting to the enclave")]
    ConnectionTimeout,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Noise handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Failed to decrypt frame")]
    DecryptionFailed,
    #[error("Failed to encrypt frame: {0}")]
    EncryptionFailed(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Enclave assignment failed: {0}")]
    AssignmentFailed(String),
    #[error("No enclave assignment for model {0}")]
    AssignmentNotFound(String),
}
