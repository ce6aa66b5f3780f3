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

//! Structural checks of the hardware evidence carried in the `quote` field.
//!
//! These checks establish that the quote has the expected shape. They do not
//! verify the vendor certificate chain or the report signature; that is the
//! job of a [`crate::QuoteVerifier`].

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};

use crate::{document::PublicKey, error::AttestationError};

/// Shortest decoded quote accepted for SEV-SNP attestation types.
pub const MIN_SEV_SNP_QUOTE_LEN: usize = 64;

/// Size of the signed part of an SEV-SNP attestation report.
///
/// See Table 23 of the SEV Secure Nested Paging Firmware ABI Specification.
pub const SEV_SNP_REPORT_BODY_LEN: usize = 0x2A0;
const SEV_SNP_REPORT_DATA_OFFSET: usize = 0x50;
const SEV_SNP_REPORT_DATA_SIZE: usize = 64;
const SEV_SNP_MEASUREMENT_OFFSET: usize = 0x90;
const SEV_SNP_MEASUREMENT_SIZE: usize = 48;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuoteKind {
    AzureImds,
    SevSnp,
    MockSevSnp,
}

impl QuoteKind {
    pub fn from_attestation_type(attestation_type: &str) -> Option<Self> {
        match attestation_type {
            "azure-imds" => Some(Self::AzureImds),
            "sev-snp" => Some(Self::SevSnp),
            "mock-sev-snp" => Some(Self::MockSevSnp),
            _ => None,
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, Self::MockSevSnp)
    }
}

/// Evidence extracted from a structurally valid quote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuoteEvidence {
    pub kind: QuoteKind,
    /// The decoded quote bytes (for Azure IMDS, the token text).
    pub raw: Vec<u8>,
    /// Launch measurement, when the quote carries a full SEV-SNP report.
    pub measurement: Option<Vec<u8>>,
}

pub fn check_quote(
    kind: QuoteKind,
    quote: &str,
    public_key: &PublicKey,
) -> Result<QuoteEvidence, AttestationError> {
    match kind {
        QuoteKind::AzureImds => check_azure_imds(quote),
        QuoteKind::SevSnp | QuoteKind::MockSevSnp => check_sev_snp(kind, quote, public_key),
    }
}

/// Azure IMDS returns a JWT: three non-empty base64url segments joined by dots.
fn check_azure_imds(quote: &str) -> Result<QuoteEvidence, AttestationError> {
    let segments: Vec<&str> = quote.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(AttestationError::InvalidQuote(format!(
            "expected 3 JWT segments, got {}",
            segments.len()
        )));
    }
    for segment in &segments {
        if segment.is_empty() {
            return Err(AttestationError::InvalidQuote("empty JWT segment".to_owned()));
        }
        if !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '=')
        {
            return Err(AttestationError::InvalidQuote(
                "JWT segment is not base64url".to_owned(),
            ));
        }
    }
    Ok(QuoteEvidence {
        kind: QuoteKind::AzureImds,
        raw: quote.trim().as_bytes().to_vec(),
        measurement: None,
    })
}

fn check_sev_snp(
    kind: QuoteKind,
    quote: &str,
    public_key: &PublicKey,
) -> Result<QuoteEvidence, AttestationError> {
    let raw = STANDARD
        .decode(quote.trim())
        .or_else(|_| URL_SAFE_NO_PAD.decode(quote.trim()))
        .map_err(|err| AttestationError::InvalidQuote(format!("quote is not base64: {err}")))?;
    if raw.len() < MIN_SEV_SNP_QUOTE_LEN {
        return Err(AttestationError::InvalidQuote(format!(
            "quote is {} bytes, expected at least {MIN_SEV_SNP_QUOTE_LEN}",
            raw.len()
        )));
    }

    // Shorter quotes are opaque blobs; only a full report body has fields
    // at known offsets.
    let measurement = if raw.len() >= SEV_SNP_REPORT_BODY_LEN {
        let report_data = &raw
            [SEV_SNP_REPORT_DATA_OFFSET..SEV_SNP_REPORT_DATA_OFFSET + SEV_SNP_REPORT_DATA_SIZE];
        if report_data[..32] != public_key.sha256() {
            return Err(AttestationError::BindingFailed(
                "REPORT_DATA in the SEV-SNP report does not match the public key".to_owned(),
            ));
        }
        Some(
            raw[SEV_SNP_MEASUREMENT_OFFSET..SEV_SNP_MEASUREMENT_OFFSET + SEV_SNP_MEASUREMENT_SIZE]
                .to_vec(),
        )
    } else {
        None
    };

    Ok(QuoteEvidence { kind, raw, measurement })
}

/// Checks `measurement` against the hex encoded allow-list. An empty
/// allow-list accepts anything.
pub fn check_measurement(
    measurement: Option<&[u8]>,
    expected_measurements: &[String],
) -> Result<(), AttestationError> {
    if expected_measurements.is_empty() {
        return Ok(());
    }
    let actual = match measurement {
        Some(measurement) => hex::encode(measurement),
        None => {
            return Err(AttestationError::MeasurementMismatch { actual: "<none>".to_owned() });
        }
    };
    if expected_measurements.iter().any(|expected| expected.trim().eq_ignore_ascii_case(&actual)) {
        Ok(())
    } else {
        Err(AttestationError::MeasurementMismatch { actual })
    }
}
