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

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use enclave_session::{
    directory::{EnclaveAllocation, EnclaveConfig, EnclaveHost, EnclaveRpc, ModelInfo},
    SessionConfig,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChatConfig {
    /// Model to request completions from.
    pub model: String,
    #[serde(default)]
    pub session: SessionConfig,
    /// The enclave serving `model`.
    pub enclave: EnclaveConfig,
}

/// Reads and parses a TOML file. Usable as a `clap` value parser.
pub fn load_toml<T: DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let contents = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("couldn't read config file {path}"))?;
    toml::from_str(&contents).with_context(|| format!("couldn't parse config file {path}"))
}

/// Serves the single enclave named in the config file.
pub struct StaticRpc {
    model: String,
    enclave: EnclaveConfig,
}

impl StaticRpc {
    pub fn new(config: &ChatConfig) -> Self {
        Self { model: config.model.clone(), enclave: config.enclave.clone() }
    }
}

#[async_trait]
impl EnclaveRpc for StaticRpc {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo { id: self.model.clone(), name: self.model.clone(), tier: None }])
    }

    async fn request_enclave(
        &self,
        model_id: &str,
        _tier: &str,
        _session_id: &str,
    ) -> anyhow::Result<EnclaveAllocation> {
        anyhow::ensure!(model_id == self.model, "model {model_id} is not configured");
        let endpoint = Url::parse(&self.enclave.ws_endpoint).context("invalid ws_endpoint")?;
        Ok(EnclaveAllocation {
            assignment_id: format!("static-{}", self.enclave.id),
            enclave: EnclaveHost {
                id: self.enclave.id.clone(),
                host: endpoint.host_str().unwrap_or_default().to_owned(),
                port: endpoint.port_or_known_default().unwrap_or_default(),
            },
            ws_endpoint: self.enclave.ws_endpoint.clone(),
            attestation_endpoint: self.enclave.attestation_endpoint.clone(),
            allow_unverified: self.enclave.allow_unverified,
            expected_measurements: self.enclave.expected_measurements.clone(),
        })
    }

    async fn release_enclave(&self, _assignment_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use enclave_session::config::MalformedFramePolicy;

    use super::*;

    fn testdata() -> String {
        format!("{}/testdata/chat.toml", env!("CARGO_MANIFEST_DIR"))
    }

    #[test]
    fn read_config_test() {
        let config: ChatConfig = load_toml(&testdata()).expect("could not read chat config");

        assert_eq!(config.model, "llama-3.3-70b");
        assert_eq!(config.session.handshake_timeout_secs, 20);
        assert_eq!(config.session.keep_alive_interval_secs, 15);
        assert_eq!(config.session.malformed_frame_policy, MalformedFramePolicy::Skip);
        assert_eq!(config.enclave.id, "enclave-local");
        assert!(!config.enclave.allow_unverified);
    }

    #[test]
    fn missing_file_is_reported() {
        assert!(load_toml::<ChatConfig>("/nonexistent/chat.toml").is_err());
    }

    #[tokio::test]
    async fn static_rpc_serves_the_configured_enclave() {
        let config: ChatConfig = load_toml(&testdata()).unwrap();
        let rpc = StaticRpc::new(&config);

        let allocation = rpc.request_enclave("llama-3.3-70b", "standard", "s").await.unwrap();
        assert_eq!(allocation.enclave.host, "enclave.example.com");
        assert_eq!(allocation.enclave.port, 443);
        assert_eq!(allocation.ws_endpoint, config.enclave.ws_endpoint);

        assert!(rpc.request_enclave("other", "standard", "s").await.is_err());
    }
}
