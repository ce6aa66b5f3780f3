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

//! Remote attestation of enclave endpoints: fetches attestation documents,
//! checks that the advertised X25519 key is bound to the hardware evidence and
//! caches the outcome.

pub mod document;
mod error;
pub mod quote;
pub mod verifier;

pub use crate::{
    document::{AttestationDocument, PublicKey},
    error::AttestationError,
    quote::{QuoteEvidence, QuoteKind},
    verifier::{
        AttestationFetcher, AttestationResult, AttestationVerifier, CacheStats,
        HttpAttestationFetcher, QuoteVerifier, VerifierConfig,
    },
};
