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

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use tokio::sync::Mutex;

use crate::{
    document::{AttestationDocument, PublicKey},
    error::AttestationError,
    quote::{check_measurement, check_quote, QuoteEvidence, QuoteKind},
};

/// Attestation results are reused for this long unless a refresh is forced.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Retrieves attestation documents from an enclave.
#[async_trait]
pub trait AttestationFetcher: Send + Sync {
    async fn fetch(&self, endpoint: &str) -> Result<AttestationDocument, AttestationError>;
}

/// Verifies the vendor certificate chain and signature of a quote that has
/// already passed the structural checks.
#[async_trait]
pub trait QuoteVerifier: Send + Sync {
    async fn verify(
        &self,
        document: &AttestationDocument,
        evidence: &QuoteEvidence,
    ) -> Result<(), AttestationError>;
}

/// Fetches attestation documents over HTTPS, asking every intermediary not to
/// serve a cached copy.
pub struct HttpAttestationFetcher {
    client: reqwest::Client,
}

impl HttpAttestationFetcher {
    /// With `https_only` set, plain `http://` endpoints are refused.
    pub fn new(https_only: bool) -> Result<Self, AttestationError> {
        let client = reqwest::Client::builder()
            .https_only(https_only)
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|err| AttestationError::FetchFailed(format!("couldn't build client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AttestationFetcher for HttpAttestationFetcher {
    async fn fetch(&self, endpoint: &str) -> Result<AttestationDocument, AttestationError> {
        let response = self
            .client
            .get(endpoint)
            .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(PRAGMA, "no-cache")
            .header(EXPIRES, "0")
            .send()
            .await
            .map_err(|err| AttestationError::FetchFailed(format!("HTTP request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(AttestationError::FetchFailed(format!(
                "HTTP {}: {}",
                response.status(),
                response.status().canonical_reason().unwrap_or("Unknown error")
            )));
        }

        response
            .json::<AttestationDocument>()
            .await
            .map_err(|err| AttestationError::FetchFailed(format!("JSON parse failed: {err}")))
    }
}

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    pub cache_ttl: Duration,
    /// Refuse real attestation types for which no [`QuoteVerifier`] is
    /// registered, instead of accepting structurally valid quotes.
    pub require_quote_verification: bool,
    pub accept_mock_attestation: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            require_quote_verification: !cfg!(debug_assertions),
            accept_mock_attestation: cfg!(debug_assertions),
        }
    }
}

/// Outcome of a single `verify` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestationResult {
    pub is_valid: bool,
    pub server_public_key: Option<PublicKey>,
    pub attestation_type: String,
    pub error: Option<AttestationError>,
    pub measurement: Option<Vec<u8>>,
}

impl AttestationResult {
    fn valid(attestation_type: &str, public_key: PublicKey, measurement: Option<Vec<u8>>) -> Self {
        Self {
            is_valid: true,
            server_public_key: Some(public_key),
            attestation_type: attestation_type.to_owned(),
            error: None,
            measurement,
        }
    }

    fn invalid(attestation_type: &str, error: AttestationError) -> Self {
        Self {
            is_valid: false,
            server_public_key: None,
            attestation_type: attestation_type.to_owned(),
            error: Some(error),
            measurement: None,
        }
    }

    /// Returns the trusted key of a valid result, or the reason it is invalid.
    pub fn into_public_key(self) -> Result<PublicKey, AttestationError> {
        match (self.is_valid, self.server_public_key, self.error) {
            (true, Some(public_key), _) => Ok(public_key),
            (_, _, Some(error)) => Err(error),
            _ => Err(AttestationError::InvalidDocument("no public key in result".to_owned())),
        }
    }
}

#[derive(Clone, Debug)]
struct CachedAttestation {
    result: AttestationResult,
    fetched_at: Instant,
}

impl CachedAttestation {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
}

/// Verifies attestation endpoints and caches successful results per endpoint.
pub struct AttestationVerifier {
    fetcher: Arc<dyn AttestationFetcher>,
    quote_verifiers: HashMap<QuoteKind, Arc<dyn QuoteVerifier>>,
    config: VerifierConfig,
    cache: Mutex<HashMap<String, CachedAttestation>>,
    /// One lock per endpoint with a fetch in flight, so that concurrent
    /// callers for the same endpoint share one round trip.
    fetches: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AttestationVerifier {
    pub fn new(fetcher: Arc<dyn AttestationFetcher>, config: VerifierConfig) -> Self {
        Self {
            fetcher,
            quote_verifiers: HashMap::new(),
            config,
            cache: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the chain verifier used for quotes of `kind`.
    pub fn with_quote_verifier(mut self, kind: QuoteKind, verifier: Arc<dyn QuoteVerifier>) -> Self {
        self.quote_verifiers.insert(kind, verifier);
        self
    }

    pub async fn verify(&self, endpoint: &str) -> AttestationResult {
        self.verify_with(endpoint, false).await
    }

    pub async fn verify_with(&self, endpoint: &str, force_refresh: bool) -> AttestationResult {
        self.verify_for_enclave(endpoint, &[], force_refresh).await
    }

    /// Like [`AttestationVerifier::verify_with`], additionally requiring the
    /// launch measurement to be one of `expected_measurements` (hex) when that
    /// list is not empty.
    pub async fn verify_for_enclave(
        &self,
        endpoint: &str,
        expected_measurements: &[String],
        force_refresh: bool,
    ) -> AttestationResult {
        let result = match self.cached(endpoint, force_refresh).await {
            Some(result) => result,
            None => self.refresh(endpoint, force_refresh).await,
        };

        if !result.is_valid {
            return result;
        }
        match check_measurement(result.measurement.as_deref(), expected_measurements) {
            Ok(()) => result,
            Err(err) => {
                warn!("attestation of {endpoint} rejected: {err}");
                AttestationResult::invalid(&result.attestation_type, err)
            }
        }
    }

    /// Fetches the document without judging it. Used by development builds
    /// that are allowed to talk to unverified enclaves.
    pub async fn fetch_document(
        &self,
        endpoint: &str,
    ) -> Result<AttestationDocument, AttestationError> {
        self.fetcher.fetch(endpoint).await
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().await;
        CacheStats {
            total_entries: cache.len(),
            valid_entries: cache
                .values()
                .filter(|entry| entry.result.is_valid && entry.is_fresh(self.config.cache_ttl))
                .count(),
        }
    }

    async fn cached(&self, endpoint: &str, force_refresh: bool) -> Option<AttestationResult> {
        if force_refresh {
            return None;
        }
        let cache = self.cache.lock().await;
        let entry = cache.get(endpoint).filter(|entry| entry.is_fresh(self.config.cache_ttl))?;
        debug!("using cached attestation for {endpoint}");
        Some(entry.result.clone())
    }

    /// Fetches and evaluates `endpoint`, holding only that endpoint's fetch
    /// lock across the network round trip.
    async fn refresh(&self, endpoint: &str, force_refresh: bool) -> AttestationResult {
        let gate = self.fetches.lock().await.entry(endpoint.to_owned()).or_default().clone();
        let in_flight = gate.lock().await;

        // Another caller may have refreshed the entry while this one waited.
        let result = match self.cached(endpoint, force_refresh).await {
            Some(result) => result,
            None => {
                let result = self.fetch_and_evaluate(endpoint).await;
                let mut cache = self.cache.lock().await;
                if result.is_valid {
                    cache.insert(
                        endpoint.to_owned(),
                        CachedAttestation { result: result.clone(), fetched_at: Instant::now() },
                    );
                } else {
                    cache.remove(endpoint);
                }
                result
            }
        };
        drop(in_flight);

        let mut fetches = self.fetches.lock().await;
        // Only the map and this call hold the gate: nobody is waiting on it.
        if Arc::strong_count(&gate) == 2 {
            fetches.remove(endpoint);
        }
        result
    }

    async fn fetch_and_evaluate(&self, endpoint: &str) -> AttestationResult {
        let document = match self.fetcher.fetch(endpoint).await {
            Ok(document) => document,
            Err(err) => {
                warn!("couldn't fetch attestation from {endpoint}: {err}");
                return AttestationResult::invalid("unknown", err);
            }
        };
        match self.evaluate(&document).await {
            Ok((public_key, measurement)) => {
                info!("attestation of {endpoint} ({}) verified", document.attestation_type);
                AttestationResult::valid(&document.attestation_type, public_key, measurement)
            }
            Err(err) => {
                warn!("attestation of {endpoint} ({}) rejected: {err}", document.attestation_type);
                AttestationResult::invalid(&document.attestation_type, err)
            }
        }
    }

    async fn evaluate(
        &self,
        document: &AttestationDocument,
    ) -> Result<(PublicKey, Option<Vec<u8>>), AttestationError> {
        let public_key = document.decoded_public_key()?;
        // The key binding is checked before anything specific to the quote.
        document.verify_binding(&public_key)?;

        let kind = QuoteKind::from_attestation_type(&document.attestation_type).ok_or_else(
            || AttestationError::AttestationTypeUnsupported(document.attestation_type.clone()),
        )?;
        if kind.is_mock() && !self.config.accept_mock_attestation {
            return Err(AttestationError::MockAttestationRejected);
        }

        let evidence = check_quote(kind, &document.quote, &public_key)?;
        match self.quote_verifiers.get(&kind) {
            Some(verifier) => verifier.verify(document, &evidence).await?,
            None if kind.is_mock() => {}
            None if self.config.require_quote_verification => {
                return Err(AttestationError::QuoteVerificationUnavailable(
                    document.attestation_type.clone(),
                ));
            }
            None => warn!(
                "{} quote accepted on structural checks only; its signature chain is not verified",
                document.attestation_type
            ),
        }

        Ok((public_key, evidence.measurement))
    }
}
