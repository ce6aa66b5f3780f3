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
pub enum AttestationError {
    #[error("Failed to fetch attestation document: {0}")]
    FetchFailed(String),
    #[error("Malformed attestation document: {0}")]
    InvalidDocument(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Public key is not bound to the attestation report: {0}")]
    BindingFailed(String),
    #[error("Malformed quote: {0}")]
    InvalidQuote(String),
    #[error("Unsupported attestation type: {0}")]
    AttestationTypeUnsupported(String),
    #[error("Mock attestation is not accepted by this build")]
    MockAttestationRejected,
    #[error("Measurement {actual} does not match any expected measurement")]
    MeasurementMismatch { actual: String },
    #[error("No quote verifier registered for attestation type {0}")]
    QuoteVerificationUnavailable(String),
    #[error("Quote verification failed: {0}")]
    QuoteVerificationFailed(String),
}
