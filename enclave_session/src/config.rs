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

//! Tunables of a client session, loadable from TOML.

use std::time::Duration;

use enclave_attestation::VerifierConfig;
use serde::{Deserialize, Serialize};

/// What to do with a response frame that decrypts but does not parse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedFramePolicy {
    /// Log the frame and keep streaming.
    #[default]
    Skip,
    /// Emit a terminal error event.
    Abort,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounds transport establishment plus the Noise handshake.
    pub handshake_timeout_secs: u64,
    pub keep_alive_interval_secs: u64,
    pub attestation_cache_ttl_secs: u64,
    pub model_cache_ttl_secs: u64,
    /// How long to wait for each frame while discarding the rest of an
    /// abandoned response. An idle wait longer than this closes the session.
    pub response_drain_timeout_secs: u64,
    /// Tier requested for models whose catalogue entry does not name one.
    pub default_tier: String,
    pub malformed_frame_policy: MalformedFramePolicy,
    pub require_quote_verification: bool,
    pub accept_mock_attestation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let verifier = VerifierConfig::default();
        Self {
            handshake_timeout_secs: 30,
            keep_alive_interval_secs: 15,
            attestation_cache_ttl_secs: verifier.cache_ttl.as_secs(),
            model_cache_ttl_secs: 5 * 60,
            response_drain_timeout_secs: 5,
            default_tier: "standard".to_owned(),
            malformed_frame_policy: MalformedFramePolicy::default(),
            require_quote_verification: verifier.require_quote_verification,
            accept_mock_attestation: verifier.accept_mock_attestation,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn model_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.model_cache_ttl_secs)
    }

    pub fn response_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.response_drain_timeout_secs)
    }

    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            cache_ttl: Duration::from_secs(self.attestation_cache_ttl_secs),
            require_quote_verification: self.require_quote_verification,
            accept_mock_attestation: self.accept_mock_attestation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: SessionConfig = toml::from_str("").unwrap();

        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.keep_alive_interval(), Duration::from_secs(15));
        assert_eq!(config.model_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.verifier_config().cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.default_tier, "standard");
        assert_eq!(config.malformed_frame_policy, MalformedFramePolicy::Skip);
    }

    #[test]
    fn reads_overrides() {
        let config: SessionConfig = toml::from_str(
            r#"
            handshake_timeout_secs = 5
            default_tier = "premium"
            malformed_frame_policy = "abort"
            require_quote_verification = true
            accept_mock_attestation = false
            "#,
        )
        .unwrap();

        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_tier, "premium");
        assert_eq!(config.malformed_frame_policy, MalformedFramePolicy::Abort);
        let verifier = config.verifier_config();
        assert!(verifier.require_quote_verification);
        assert!(!verifier.accept_mock_attestation);
    }

    #[test]
    fn rejects_unknown_policy() {
        assert!(toml::from_str::<SessionConfig>(r#"malformed_frame_policy = "retry""#).is_err());
    }
}
