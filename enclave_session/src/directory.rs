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

//! Discovery of models and assignment of enclaves through the RPC backend.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::ChannelError;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Capacity tier to request for this model, when the backend names one.
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnclaveHost {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Reply to a `RequestEnclave` call.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnclaveAllocation {
    pub assignment_id: String,
    pub enclave: EnclaveHost,
    pub ws_endpoint: String,
    pub attestation_endpoint: String,
    #[serde(default)]
    pub allow_unverified: bool,
    #[serde(default)]
    pub expected_measurements: Vec<String>,
}

/// Everything needed to attest and connect to one enclave.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnclaveConfig {
    pub id: String,
    pub ws_endpoint: String,
    pub attestation_endpoint: String,
    /// Connect even if attestation fails. Only honoured by development builds.
    #[serde(default)]
    pub allow_unverified: bool,
    /// Hex encoded launch measurements to accept. Empty accepts any.
    #[serde(default)]
    pub expected_measurements: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnclaveAssignment {
    pub assignment_id: String,
    pub model_id: String,
    pub session_id: String,
}

/// The authenticated RPC backend that hands out enclaves.
#[async_trait]
pub trait EnclaveRpc: Send + Sync {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;

    async fn request_enclave(
        &self,
        model_id: &str,
        tier: &str,
        session_id: &str,
    ) -> anyhow::Result<EnclaveAllocation>;

    async fn release_enclave(&self, assignment_id: &str) -> anyhow::Result<()>;
}

struct CachedModels {
    models: Vec<ModelInfo>,
    fetched_at: Instant,
}

/// Tracks at most one live enclave assignment per model.
pub struct EnclaveDirectory {
    rpc: Arc<dyn EnclaveRpc>,
    model_cache_ttl: Duration,
    default_tier: String,
    models: Mutex<Option<CachedModels>>,
    // Held for the whole of a request or release so that concurrent calls for
    // one model cannot both leave a live assignment behind.
    assignments: Mutex<HashMap<String, EnclaveAssignment>>,
}

impl EnclaveDirectory {
    pub fn new(rpc: Arc<dyn EnclaveRpc>, model_cache_ttl: Duration, default_tier: &str) -> Self {
        Self {
            rpc,
            model_cache_ttl,
            default_tier: default_tier.to_owned(),
            models: Mutex::new(None),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the model catalogue. When the backend is unreachable the last
    /// good list is returned even if stale, or an empty one if there is none.
    pub async fn list_models(&self, force_refresh: bool) -> Vec<ModelInfo> {
        let mut cache = self.models.lock().await;
        if let Some(cached) = cache.as_ref() {
            if !force_refresh && cached.fetched_at.elapsed() < self.model_cache_ttl {
                return cached.models.clone();
            }
        }
        match self.rpc.list_models().await {
            Ok(models) => {
                debug!("fetched {} models", models.len());
                *cache = Some(CachedModels { models: models.clone(), fetched_at: Instant::now() });
                models
            }
            Err(err) => {
                warn!("couldn't list models, using cached list: {err:#}");
                cache.as_ref().map(|cached| cached.models.clone()).unwrap_or_default()
            }
        }
    }

    /// Allocates an enclave for `model_id`, releasing the one already tracked
    /// for it. Returns `None` if the backend refuses.
    pub async fn request_enclave(&self, model_id: &str, session_id: &str) -> Option<EnclaveConfig> {
        let mut assignments = self.assignments.lock().await;
        if let Some(previous) = assignments.remove(model_id) {
            self.release(&previous).await;
        }

        let tier = self.tier_for(model_id).await;
        let allocation = match self.rpc.request_enclave(model_id, &tier, session_id).await {
            Ok(allocation) => allocation,
            Err(err) => {
                let err = ChannelError::AssignmentFailed(format!("{err:#}"));
                warn!("couldn't get an enclave for {model_id}: {err}");
                return None;
            }
        };
        info!(
            "model {model_id} assigned to enclave {} ({}:{})",
            allocation.enclave.id, allocation.enclave.host, allocation.enclave.port
        );

        assignments.insert(
            model_id.to_owned(),
            EnclaveAssignment {
                assignment_id: allocation.assignment_id,
                model_id: model_id.to_owned(),
                session_id: session_id.to_owned(),
            },
        );
        if allocation.allow_unverified && !cfg!(debug_assertions) {
            warn!("ignoring allow_unverified for enclave {}", allocation.enclave.id);
        }
        Some(EnclaveConfig {
            id: allocation.enclave.id,
            ws_endpoint: allocation.ws_endpoint,
            attestation_endpoint: allocation.attestation_endpoint,
            allow_unverified: allocation.allow_unverified && cfg!(debug_assertions),
            expected_measurements: allocation.expected_measurements,
        })
    }

    /// Releases the enclave tracked for `model_id`. Untracked models and
    /// backend failures are ignored.
    pub async fn release_enclave(&self, model_id: &str) {
        let mut assignments = self.assignments.lock().await;
        if let Some(assignment) = assignments.remove(model_id) {
            self.release(&assignment).await;
        }
    }

    pub async fn release_all(&self) {
        let mut assignments = self.assignments.lock().await;
        for (_, assignment) in assignments.drain() {
            self.release(&assignment).await;
        }
    }

    pub async fn assignment(&self, model_id: &str) -> Result<EnclaveAssignment, ChannelError> {
        self.assignments
            .lock()
            .await
            .get(model_id)
            .cloned()
            .ok_or_else(|| ChannelError::AssignmentNotFound(model_id.to_owned()))
    }

    async fn release(&self, assignment: &EnclaveAssignment) {
        match self.rpc.release_enclave(&assignment.assignment_id).await {
            Ok(()) => debug!("released assignment {}", assignment.assignment_id),
            Err(err) => warn!("couldn't release assignment {}: {err:#}", assignment.assignment_id),
        }
    }

    async fn tier_for(&self, model_id: &str) -> String {
        self.models
            .lock()
            .await
            .as_ref()
            .and_then(|cached| cached.models.iter().find(|model| model.id == model_id))
            .and_then(|model| model.tier.clone())
            .unwrap_or_else(|| self.default_tier.clone())
    }
}
