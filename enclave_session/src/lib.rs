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

//! Client side of an attested, end-to-end encrypted chat session with a model
//! hosted in a TEE.
//!
//! [`EnclaveClient`] ties the pieces together: the [`directory`] hands out an
//! enclave, its attestation yields the enclave's static key, a
//! [`channel::SecureChannel`] is handshaked against that key over a
//! [`transport::TransportClient`], and [`streaming`] turns the encrypted
//! response frames into [`streaming::StreamEvent`]s.

pub mod channel;
pub mod client;
pub mod config;
pub mod directory;
mod error;
pub mod streaming;
pub mod transport;

pub use crate::{client::EnclaveClient, config::SessionConfig, error::ChannelError};
