// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::certs::ChainPosition;
use crate::check::State;
use crate::output::format_serial;
use crate::runner::Verdict;
use crate::validation::{expiry_status, CheckKind, ExpiryStatus};

/// Bumped on any incompatible change to the record layout.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("unsupported payload format version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("timestamp formatting failed: {0}")]
    Timestamp(#[from] time::error::Format),
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub format_version: u32,
    pub chain: Vec<PayloadCert>,
    pub issues: Issues,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PayloadCert {
    pub subject: String,
    pub issuer: String,
    pub serial_hex: String,
    pub not_before: String,
    pub not_after: String,
    pub sans_entries: Vec<String>,
    pub signature_algorithm: String,
    pub chain_position: String,
    pub has_weak_signature: bool,
    pub expires_in_days: i64,
    pub life_remaining_percentage: f64,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Issues {
    pub expired: bool,
    pub expiring: bool,
    pub hostname_mismatch: bool,
    pub sans_list_mismatch: bool,
    pub weak_signature: bool,
    pub chain_incomplete: bool,
}

/// Serialize an evaluated chain and its verdict into one JSON record.
pub fn encode(verdict: &Verdict, now: OffsetDateTime) -> Result<String, PayloadError> {
    let mut chain = Vec::with_capacity(verdict.chain.len());
    for (index, cert) in verdict.chain.certs().iter().enumerate() {
        let position = verdict
            .positions
            .get(index)
            .copied()
            .unwrap_or(ChainPosition::Unknown);
        chain.push(PayloadCert {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial_hex: format_serial(cert.raw_serial()),
            not_before: cert.not_before().format(&Rfc3339)?,
            not_after: cert.not_after().format(&Rfc3339)?,
            sans_entries: cert.sans().to_vec(),
            signature_algorithm: cert.signature_algorithm().to_string(),
            chain_position: position.to_string(),
            has_weak_signature: cert.has_weak_signature(),
            expires_in_days: (cert.not_after() - now).whole_days(),
            life_remaining_percentage: life_remaining(
                cert.not_before(),
                cert.not_after(),
                now,
            ),
        });
    }
    let payload = Payload {
        format_version: FORMAT_VERSION,
        chain,
        issues: issues(verdict, now),
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Parse a record, rejecting any format version this reader does not know.
pub fn decode(data: &str) -> Result<Payload, PayloadError> {
    let payload: Payload = serde_json::from_str(data)?;
    if payload.format_version != FORMAT_VERSION {
        return Err(PayloadError::UnsupportedVersion(payload.format_version));
    }
    Ok(payload)
}

fn life_remaining(not_before: OffsetDateTime, not_after: OffsetDateTime, now: OffsetDateTime) -> f64 {
    let lifetime = (not_after - not_before).whole_seconds();
    if lifetime <= 0 {
        return 0.0;
    }
    let remaining = (not_after - now).whole_seconds();
    (remaining as f64 / lifetime as f64 * 100.0).clamp(0.0, 100.0)
}

fn issues(verdict: &Verdict, now: OffsetDateTime) -> Issues {
    let mut issues = Issues::default();
    for cert in verdict.chain.certs() {
        match expiry_status(cert.not_after(), now, verdict.thresholds) {
            ExpiryStatus::Expired => issues.expired = true,
            ExpiryStatus::Warning | ExpiryStatus::Critical => issues.expiring = true,
            ExpiryStatus::Ok => {}
        }
        if cert.has_weak_signature() {
            issues.weak_signature = true;
        }
    }
    // An incomplete chain is one whose last link is neither a root nor a
    // self-signed leaf.
    issues.chain_incomplete = !matches!(
        verdict.positions.last(),
        Some(ChainPosition::Root) | Some(ChainPosition::LeafSelfSigned) | None
    );
    for result in &verdict.results {
        if result.ignored || result.status == State::Ok {
            continue;
        }
        match result.kind {
            CheckKind::Hostname => issues.hostname_mismatch = true,
            CheckKind::SansList => issues.sans_list_mismatch = true,
            CheckKind::WeakSignature => issues.weak_signature = true,
            CheckKind::Expiration => {}
        }
    }
    issues
}
