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

//! Cryptographic primitives for the attested enclave channel: the Noise NK
//! handshake and the per-direction transport ciphers it produces.

extern crate static_assertions;

pub mod noise_handshake;

pub const EMPTY_ASSOCIATED_DATA: &[u8] = b"";
