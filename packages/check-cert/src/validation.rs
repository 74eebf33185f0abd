// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use std::fmt::{Display, Formatter, Result as FormatResult};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use typed_builder::TypedBuilder;

use crate::certs::{Certificate, Chain, ChainPosition};
use crate::check::State;
use crate::output::format_duration;

pub const SKIP_SANS_SENTINEL: &str = "SKIPSANSCHECKS";

/// The closed set of validation checks. Declaration order is the tie-break
/// priority when collapsing: `Expiration` wins over `Hostname` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckKind {
    Expiration,
    Hostname,
    SansList,
    WeakSignature,
}

impl CheckKind {
    pub const ALL: [Self; 4] = [
        Self::Expiration,
        Self::Hostname,
        Self::SansList,
        Self::WeakSignature,
    ];

    /// Flag keyword as accepted by `--apply-validation-result` and
    /// `--ignore-validation-result`.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "expiration" => Some(Self::Expiration),
            "hostname" => Some(Self::Hostname),
            "sans" => Some(Self::SansList),
            "weak-signature" => Some(Self::WeakSignature),
            _ => None,
        }
    }
}

impl Display for CheckKind {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(
            f,
            "{}",
            match self {
                Self::Expiration => "Expiration",
                Self::Hostname => "Hostname",
                Self::SansList => "SANs list",
                Self::WeakSignature => "Weak signature",
            }
        )
    }
}

/// Outcome of a single validation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub status: State,
    pub summary: String,
    pub detail: String,
    pub ignored: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "age-warning ({warning}) must be larger than age-critical ({critical}) and both above zero"
    )]
    BadThresholds { warning: u32, critical: u32 },
    #[error("apply-validation-result 'sans' requires sans-entries")]
    SansApplyWithoutEntries,
    #[error("unknown validation check keyword '{0}'")]
    UnknownCheckKeyword(String),
}

/// Days-before-expiry boundaries; invariant `warning > critical > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    critical_days: u32,
    warning_days: u32,
}

impl Thresholds {
    pub fn try_new(critical_days: u32, warning_days: u32) -> Result<Self, ConfigError> {
        if warning_days > critical_days && critical_days > 0 {
            Ok(Self {
                critical_days,
                warning_days,
            })
        } else {
            Err(ConfigError::BadThresholds {
                warning: warning_days,
                critical: critical_days,
            })
        }
    }

    pub fn critical_days(&self) -> u32 {
        self.critical_days
    }

    pub fn warning_days(&self) -> u32 {
        self.warning_days
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct Policy {
    pub thresholds: Thresholds,
    #[builder(default)]
    pub verification_name: Option<String>,
    #[builder(default)]
    pub sans_entries: Option<Vec<String>>,
    #[builder(default)]
    pub ignore_hostname_if_empty_sans: bool,
    #[builder(default)]
    pub ignore_expired_intermediates: bool,
    #[builder(default)]
    pub ignore_expired_roots: bool,
    #[builder(default)]
    pub flag_weak_root_signatures: bool,
    #[builder(default)]
    pub apply: Vec<CheckKind>,
    #[builder(default)]
    pub ignore: Vec<CheckKind>,
}

impl Policy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apply.contains(&CheckKind::SansList)
            && self
                .sans_entries
                .as_ref()
                .is_none_or(|entries| entries.is_empty())
        {
            return Err(ConfigError::SansApplyWithoutEntries);
        }
        Ok(())
    }
}

/// Run every check against the chain. Checks are pure; `now` is injected so
/// tests can freeze the clock.
pub fn evaluate(
    chain: &Chain,
    positions: &[ChainPosition],
    policy: &Policy,
    now: OffsetDateTime,
) -> Vec<CheckResult> {
    let mut results = vec![
        check_expiration(chain, positions, policy, now),
        check_hostname(chain, policy),
        check_sans_list(chain, policy),
        check_weak_signature(chain, positions, policy),
    ];
    for result in &mut results {
        if policy.apply.contains(&result.kind) {
            result.ignored = false;
        }
        if policy.ignore.contains(&result.kind) {
            result.ignored = true;
        }
    }
    results
}

/// Collapse the result set: drop ignored results, take the worst status,
/// break ties by check priority. An all-ignored set collapses to OK.
pub fn collapse(results: &[CheckResult]) -> (State, Option<CheckKind>) {
    let active: Vec<&CheckResult> = results.iter().filter(|r| !r.ignored).collect();
    let Some(worst) = active.iter().map(|r| r.status).max() else {
        return (State::Ok, None);
    };
    let primary = active
        .iter()
        .filter(|r| r.status == worst)
        .min_by_key(|r| r.kind)
        .map(|r| r.kind);
    (worst, primary)
}

/// Per-certificate expiration assessment; first match wins.
///
/// The horizons are exact multiples of 24h from `now`, without rounding to
/// date boundaries. This differs by one full day from older plugins that
/// round; the difference is deliberate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExpiryStatus {
    Ok,
    Warning,
    Critical,
    Expired,
}

impl ExpiryStatus {
    pub fn to_state(self) -> State {
        match self {
            Self::Ok => State::Ok,
            Self::Warning => State::Warning,
            Self::Critical | Self::Expired => State::Critical,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Expired => "EXPIRED",
        }
    }
}

pub fn expiry_status(
    not_after: OffsetDateTime,
    now: OffsetDateTime,
    thresholds: Thresholds,
) -> ExpiryStatus {
    if not_after < now {
        ExpiryStatus::Expired
    } else if not_after < now + Duration::hours(24 * i64::from(thresholds.critical_days)) {
        ExpiryStatus::Critical
    } else if not_after < now + Duration::hours(24 * i64::from(thresholds.warning_days)) {
        ExpiryStatus::Warning
    } else {
        ExpiryStatus::Ok
    }
}

fn expiry_summary(cert: &Certificate, status: ExpiryStatus, now: OffsetDateTime) -> String {
    match status {
        ExpiryStatus::Expired => format!(
            "certificate '{}' expired {}",
            cert.subject(),
            format_duration(now - cert.not_after(), true),
        ),
        _ => format!(
            "certificate '{}' expires in {}",
            cert.subject(),
            format_duration(cert.not_after() - now, false),
        ),
    }
}

fn check_expiration(
    chain: &Chain,
    positions: &[ChainPosition],
    policy: &Policy,
    now: OffsetDateTime,
) -> CheckResult {
    let role_ignored = |position: &ChainPosition| match position {
        ChainPosition::Intermediate => policy.ignore_expired_intermediates,
        ChainPosition::Root => policy.ignore_expired_roots,
        _ => false,
    };

    let assessed: Vec<(usize, &Certificate, ExpiryStatus, bool)> = chain
        .certs()
        .iter()
        .enumerate()
        .map(|(i, cert)| {
            let status = expiry_status(cert.not_after(), now, policy.thresholds);
            let ignored = positions.get(i).is_some_and(role_ignored);
            (i, cert, status, ignored)
        })
        .collect();

    let mut expired = 0usize;
    let mut expiring = 0usize;
    let mut ok = 0usize;
    for (_, _, status, ignored) in &assessed {
        if *ignored {
            continue;
        }
        match status {
            ExpiryStatus::Expired => expired += 1,
            ExpiryStatus::Critical | ExpiryStatus::Warning => expiring += 1,
            ExpiryStatus::Ok => ok += 1,
        }
    }
    let tally = format!("[EXPIRED: {expired}, EXPIRING: {expiring}, OK: {ok}]");

    // Worst non-ignored assessment; the leaf wins ties so the summary names
    // the certificate the operator actually cares about.
    let worst = assessed
        .iter()
        .filter(|(_, _, _, ignored)| !ignored)
        .max_by(|a, b| a.2.cmp(&b.2).then(b.0.cmp(&a.0)))
        .map(|(_, cert, status, _)| (*cert, *status));

    match worst {
        None => CheckResult {
            kind: CheckKind::Expiration,
            status: State::Ok,
            summary: "every certificate in the chain is exempt from expiration checking"
                .to_string(),
            detail: tally,
            ignored: false,
        },
        Some((cert, status)) => CheckResult {
            kind: CheckKind::Expiration,
            status: status.to_state(),
            summary: expiry_summary(cert, status, now),
            detail: tally,
            ignored: false,
        },
    }
}

fn check_hostname(chain: &Chain, policy: &Policy) -> CheckResult {
    let result = |status: State, summary: String, detail: String| CheckResult {
        kind: CheckKind::Hostname,
        status,
        summary,
        detail,
        ignored: false,
    };

    let Some(leaf) = chain.leaf() else {
        return result(
            State::Critical,
            "no leaf certificate to verify".to_string(),
            String::new(),
        );
    };
    let Some(name) = policy.verification_name.as_deref() else {
        return result(
            State::Critical,
            "no verification name available for hostname check".to_string(),
            "supply dns-name or a server name".to_string(),
        );
    };

    if leaf.sans().is_empty() {
        if policy.ignore_hostname_if_empty_sans {
            return result(
                State::Ok,
                format!("hostname '{name}' not verified: leaf has no SANs entries (skip requested)"),
                String::new(),
            );
        }
        return result(
            State::Critical,
            format!("hostname '{name}' cannot be verified: leaf has no SANs entries"),
            String::new(),
        );
    }

    if leaf.sans().iter().any(|san| matches_hostname(san, name)) {
        result(
            State::Ok,
            format!("hostname '{name}' matches the leaf SANs entries"),
            String::new(),
        )
    } else {
        result(
            State::Critical,
            format!("hostname '{name}' does not match any leaf SANs entry"),
            format!("SANs entries: [{}]", leaf.sans().join(", ")),
        )
    }
}

fn check_sans_list(chain: &Chain, policy: &Policy) -> CheckResult {
    let result = |status: State, summary: String, detail: String, ignored: bool| CheckResult {
        kind: CheckKind::SansList,
        status,
        summary,
        detail,
        ignored,
    };

    let Some(expected) = policy.sans_entries.as_ref().filter(|e| !e.is_empty()) else {
        return result(
            State::Ok,
            "no SANs entries expected".to_string(),
            String::new(),
            true,
        );
    };
    if expected
        .iter()
        .any(|e| e.eq_ignore_ascii_case(SKIP_SANS_SENTINEL))
    {
        return result(
            State::Ok,
            "SANs list check skipped by sentinel keyword".to_string(),
            String::new(),
            true,
        );
    }

    let sans = chain.leaf().map(Certificate::sans).unwrap_or_default();
    let missing: Vec<&String> = expected
        .iter()
        .filter(|e| !sans.iter().any(|s| s.eq_ignore_ascii_case(e)))
        .collect();
    let unexpected: Vec<&String> = sans
        .iter()
        .filter(|s| !expected.iter().any(|e| e.eq_ignore_ascii_case(s)))
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return result(
            State::Ok,
            format!(
                "leaf SANs entries match the expected list ({} entries)",
                expected.len()
            ),
            String::new(),
            false,
        );
    }

    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!(
            "missing entries: [{}]",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if !unexpected.is_empty() {
        parts.push(format!(
            "unexpected entries: [{}]",
            unexpected
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    result(
        State::Critical,
        "leaf SANs entries do not match the expected list".to_string(),
        parts.join("; "),
        false,
    )
}

fn check_weak_signature(
    chain: &Chain,
    positions: &[ChainPosition],
    policy: &Policy,
) -> CheckResult {
    // Root trust is anchored by identity, not signature, so roots are exempt
    // unless the caller opts in.
    let flagged: Vec<&Certificate> = chain
        .certs()
        .iter()
        .enumerate()
        .filter(|(i, cert)| {
            cert.has_weak_signature()
                && (policy.flag_weak_root_signatures
                    || positions.get(*i) != Some(&ChainPosition::Root))
        })
        .map(|(_, cert)| cert)
        .collect();

    if flagged.is_empty() {
        CheckResult {
            kind: CheckKind::WeakSignature,
            status: State::Ok,
            summary: "no weak signature algorithms in chain".to_string(),
            detail: String::new(),
            ignored: false,
        }
    } else {
        CheckResult {
            kind: CheckKind::WeakSignature,
            status: State::Critical,
            summary: format!(
                "certificate '{}' uses weak signature algorithm {}",
                flagged[0].subject(),
                flagged[0].signature_algorithm(),
            ),
            detail: flagged
                .iter()
                .map(|cert| format!("'{}': {}", cert.subject(), cert.signature_algorithm()))
                .collect::<Vec<_>>()
                .join("; "),
            ignored: false,
        }
    }
}

/// RFC 6125 style matching of one SANs entry against a host name. Only the
/// leftmost label may be a wildcard and it matches exactly one label. The
/// common name is never consulted anywhere in this module.
pub fn matches_hostname(pattern: &str, name: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || name.is_empty() {
        return false;
    }

    if let Some(base) = pattern.strip_prefix("*.") {
        if base.is_empty() || base.split('.').count() < 2 {
            return false;
        }
        let Some((first, rest)) = name.split_once('.') else {
            return false;
        };
        return !first.is_empty() && rest == base;
    }
    pattern == name
}

#[cfg(test)]
mod test_expiry_status {
    use super::{expiry_status, ExpiryStatus, Thresholds};
    use time::macros::datetime;
    use time::Duration;

    const NOW: time::OffsetDateTime = datetime!(2026-08-27 12:00:00 UTC);

    fn thr() -> Thresholds {
        Thresholds::try_new(15, 30).unwrap()
    }

    #[test]
    fn test_expired() {
        assert_eq!(
            expiry_status(NOW - Duration::seconds(1), NOW, thr()),
            ExpiryStatus::Expired
        );
    }

    #[test]
    fn test_critical() {
        assert_eq!(
            expiry_status(NOW + Duration::hours(24 * 15) - Duration::seconds(1), NOW, thr()),
            ExpiryStatus::Critical
        );
    }

    #[test]
    fn test_warning() {
        // Exactly at the critical horizon is no longer critical; no rounding.
        assert_eq!(
            expiry_status(NOW + Duration::hours(24 * 15), NOW, thr()),
            ExpiryStatus::Warning
        );
        assert_eq!(
            expiry_status(NOW + Duration::hours(24 * 30) - Duration::seconds(1), NOW, thr()),
            ExpiryStatus::Warning
        );
    }

    #[test]
    fn test_ok() {
        assert_eq!(
            expiry_status(NOW + Duration::hours(24 * 30), NOW, thr()),
            ExpiryStatus::Ok
        );
    }

    #[test]
    fn test_monotonic_in_not_after() {
        let horizon = Duration::hours(24 * 65);
        let mut last = expiry_status(NOW + horizon, NOW, thr());
        for hours in (0..24 * 70).step_by(7) {
            let status = expiry_status(NOW + horizon - Duration::hours(hours), NOW, thr());
            assert!(status >= last, "status must never improve as notAfter moves earlier");
            last = status;
        }
    }

    #[test]
    fn test_bad_thresholds() {
        assert!(Thresholds::try_new(30, 15).is_err());
        assert!(Thresholds::try_new(15, 15).is_err());
        assert!(Thresholds::try_new(0, 30).is_err());
    }
}
