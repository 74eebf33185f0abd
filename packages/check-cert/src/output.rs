// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use std::fmt::{Display, Formatter, Result as FormatResult, Write as _};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};
use typed_builder::TypedBuilder;

use crate::check::{Metric, State};
use crate::runner::Verdict;
use crate::validation::{expiry_status, CheckResult};

const TIMESTAMP: &[FormatItem] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC");

/// `65d 23h remaining` / `3h ago`; days omitted when zero.
pub fn format_duration(duration: Duration, ago: bool) -> String {
    let duration = if duration < Duration::ZERO {
        Duration::ZERO
    } else {
        duration
    };
    let days = duration.whole_days();
    let hours = (duration - Duration::days(days)).whole_hours();
    let suffix = if ago { "ago" } else { "remaining" };
    if days == 0 {
        format!("{hours}h {suffix}")
    } else {
        format!("{days}d {hours}h {suffix}")
    }
}

/// Uppercase hex, two-digit groups joined by `:`, `-` prefix for negative
/// serials. Negative serials violate the RFC but exist on legacy devices.
pub fn format_serial(raw: &[u8]) -> String {
    if raw.is_empty() {
        return "00".to_string();
    }
    let negative = raw[0] & 0x80 != 0;
    let magnitude = if negative {
        twos_complement_negate(raw)
    } else {
        raw.to_vec()
    };
    let stripped: Vec<u8> = {
        let mut bytes: &[u8] = &magnitude;
        while bytes.len() > 1 && bytes[0] == 0 {
            bytes = &bytes[1..];
        }
        bytes.to_vec()
    };
    let hex = stripped
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    if negative {
        format!("-{hex}")
    } else {
        hex
    }
}

fn twos_complement_negate(raw: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = raw.iter().map(|b| !b).collect();
    for byte in out.iter_mut().rev() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            break;
        }
    }
    out
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(TIMESTAMP).unwrap_or_else(|_| ts.to_string())
}

/// Deterministic rendering of a verdict: one summary line, then the
/// sectioned body. Everything depends only on `(verdict, now)`.
#[derive(TypedBuilder)]
pub struct Report<'a> {
    verdict: &'a Verdict,
    now: OffsetDateTime,
    #[builder(default)]
    list_ignored: bool,
    #[builder(default)]
    metrics: Vec<Metric>,
}

impl Report<'_> {
    fn summary_line(&self) -> String {
        let verdict = self.verdict;
        let leading = if let Some(error) = &verdict.error {
            error.clone()
        } else {
            verdict
                .primary
                .and_then(|kind| verdict.results.iter().find(|r| r.kind == kind))
                .map(|r| r.summary.clone())
                .unwrap_or_else(|| "no validation checks applied".to_string())
        };

        let mut line = format!(
            "{}: {} [checks: {}]",
            verdict.overall,
            leading,
            checks_tally(&verdict.results)
        );
        if !self.metrics.is_empty() {
            let rendered = self
                .metrics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            let _ = write!(line, " | {rendered}");
        }
        line
    }
}

fn checks_tally(results: &[CheckResult]) -> String {
    let group = |label: &str, picked: Vec<&CheckResult>| {
        if picked.is_empty() {
            format!("0 {label}")
        } else {
            format!(
                "{} {label} ({})",
                picked.len(),
                picked
                    .iter()
                    .map(|r| r.kind.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    };
    let ignored: Vec<&CheckResult> = results.iter().filter(|r| r.ignored).collect();
    let failed: Vec<&CheckResult> = results
        .iter()
        .filter(|r| !r.ignored && r.status != State::Ok)
        .collect();
    let successful: Vec<&CheckResult> = results
        .iter()
        .filter(|r| !r.ignored && r.status == State::Ok)
        .collect();
    format!(
        "{}, {}, {}",
        group("IGNORED", ignored),
        group("FAILED", failed),
        group("SUCCESSFUL", successful)
    )
}

impl Display for Report<'_> {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        let verdict = self.verdict;
        writeln!(f, "{}", self.summary_line())?;

        let failed: Vec<&CheckResult> = verdict
            .results
            .iter()
            .filter(|r| !r.ignored && r.status != State::Ok)
            .collect();
        if !failed.is_empty() {
            writeln!(f, "\nVALIDATION ERRORS\n")?;
            for result in &failed {
                writeln!(f, "* [{}] {}: {}", result.status, result.kind, result.summary)?;
                if !result.detail.is_empty() {
                    writeln!(f, "  {}", result.detail)?;
                }
            }
        }

        if !verdict.results.is_empty() {
            writeln!(f, "\nVALIDATION CHECKS REPORT\n")?;
            for result in &verdict.results {
                if result.ignored {
                    if self.list_ignored {
                        writeln!(f, "* [IGNORED] {}: {}", result.kind, result.summary)?;
                    }
                    continue;
                }
                writeln!(f, "* [{}] {}: {}", result.status, result.kind, result.summary)?;
                if !result.detail.is_empty() {
                    writeln!(f, "  {}", result.detail)?;
                }
            }
        }

        let total = verdict.chain.len();
        for (i, cert) in verdict.chain.certs().iter().enumerate() {
            let position = verdict
                .positions
                .get(i)
                .copied()
                .unwrap_or(crate::certs::ChainPosition::Unknown);
            let status = expiry_status(cert.not_after(), self.now, verdict.thresholds);
            let age = if cert.not_after() < self.now {
                format_duration(self.now - cert.not_after(), true)
            } else {
                format_duration(cert.not_after() - self.now, false)
            };
            writeln!(f, "\nCertificate {} of {} ({})", i + 1, total, position)?;
            writeln!(f, "\tName: {}", cert.subject())?;
            writeln!(f, "\tSANs entries: [{}]", cert.sans().join(", "))?;
            writeln!(f, "\tIssuer: {}", cert.issuer())?;
            writeln!(f, "\tSerial: {}", format_serial(cert.raw_serial()))?;
            writeln!(f, "\tIssued On: {}", format_timestamp(cert.not_before()))?;
            writeln!(f, "\tExpiration: {}", format_timestamp(cert.not_after()))?;
            writeln!(f, "\tStatus: [{}] {}", status.label(), age)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_format_duration {
    use super::format_duration;
    use time::Duration;

    #[test]
    fn test_remaining() {
        assert_eq!(
            format_duration(Duration::hours(65 * 24 + 23), false),
            "65d 23h remaining"
        );
    }

    #[test]
    fn test_ago() {
        assert_eq!(format_duration(Duration::hours(50), true), "2d 2h ago");
    }

    #[test]
    fn test_days_omitted_when_zero() {
        assert_eq!(format_duration(Duration::hours(23), false), "23h remaining");
        assert_eq!(format_duration(Duration::minutes(59), true), "0h ago");
    }
}


#[cfg(test)]
mod test_report {
    use super::Report;
    use crate::certs::{classify_chain, synthetic, Chain};
    use crate::check::State;
    use crate::runner::{Source, Verdict};
    use crate::validation::{collapse, evaluate, Policy, Thresholds};
    use time::macros::datetime;

    const NOW: time::OffsetDateTime = datetime!(2026-08-27 12:00:00 UTC);

    fn verdict(policy: &Policy) -> Verdict {
        let chain = Chain::new(vec![synthetic()]);
        let positions = classify_chain(&chain);
        let results = evaluate(&chain, &positions, policy, NOW);
        let (overall, primary) = collapse(&results);
        Verdict {
            overall,
            primary,
            results,
            chain,
            positions,
            source: Source::Server {
                server: "leaf.example.com".to_string(),
                port: 443,
            },
            thresholds: policy.thresholds,
            error: None,
        }
    }

    fn policy() -> Policy {
        Policy::builder()
            .thresholds(Thresholds::try_new(15, 30).unwrap())
            .verification_name(Some("leaf.example.com".to_string()))
            .build()
    }

    #[test]
    fn test_summary_line_ok() {
        let verdict = verdict(&policy());
        let report = Report::builder().verdict(&verdict).now(NOW).build();
        let text = report.to_string();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("OK: certificate 'CN=leaf.example.com' expires in "));
        assert!(first.contains("1 IGNORED (SANs list)"));
        assert!(first.contains("0 FAILED"));
        assert!(first.contains("3 SUCCESSFUL (Expiration, Hostname, Weak signature)"));
    }

    #[test]
    fn test_body_sections() {
        let verdict = verdict(&policy());
        let text = Report::builder()
            .verdict(&verdict)
            .now(NOW)
            .build()
            .to_string();
        assert!(!text.contains("VALIDATION ERRORS"));
        assert!(text.contains("VALIDATION CHECKS REPORT"));
        assert!(text.contains("[EXPIRED: 0, EXPIRING: 0, OK: 1]"));
        assert!(text.contains("Certificate 1 of 1 (leaf)"));
        assert!(text.contains("\tSerial: 01:F4"));
        assert!(text.contains("\tStatus: [OK] "));
    }

    #[test]
    fn test_failed_check_renders_errors_section() {
        let mut policy = policy();
        policy.verification_name = Some("wrong.example.com".to_string());
        let verdict = verdict(&policy);
        assert_eq!(verdict.overall, State::Critical);
        let text = Report::builder()
            .verdict(&verdict)
            .now(NOW)
            .build()
            .to_string();
        assert!(text.starts_with("CRITICAL: hostname 'wrong.example.com'"));
        assert!(text.contains("VALIDATION ERRORS"));
    }

    #[test]
    fn test_ignored_listing_is_opt_in() {
        let verdict = verdict(&policy());
        let hidden = Report::builder()
            .verdict(&verdict)
            .now(NOW)
            .build()
            .to_string();
        assert!(!hidden.contains("[IGNORED]"));
        let listed = Report::builder()
            .verdict(&verdict)
            .now(NOW)
            .list_ignored(true)
            .build()
            .to_string();
        assert!(listed.contains("* [IGNORED] SANs list:"));
    }

    #[test]
    fn test_deterministic() {
        let verdict = verdict(&policy());
        let a = Report::builder().verdict(&verdict).now(NOW).build().to_string();
        let b = Report::builder().verdict(&verdict).now(NOW).build().to_string();
        assert_eq!(a, b);
    }
}
