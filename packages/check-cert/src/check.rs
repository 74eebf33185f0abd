// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use std::fmt::{Display, Formatter, Result as FormatResult};
use typed_builder::TypedBuilder;

/// Monitoring state in collapse precedence: `Ok < Warning < Critical < Unknown`.
///
/// The derived `Ord` is the precedence used when folding a result set into a
/// single state. The exit-code mapping stays the Nagios one (0/1/2/3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    #[default]
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(f, "{}", self.as_str())
    }
}

pub fn exit_code(state: State) -> i32 {
    match state {
        State::Ok => 0,
        State::Warning => 1,
        State::Critical => 2,
        State::Unknown => 3,
    }
}

/// Performance-data sample rendered as `'label'=value;warn;crit;min;max`.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct Metric {
    #[builder(setter(transform = |x: impl Into<String>| x.into()))]
    label: String,
    value: i64,
    #[builder(default)]
    warn: Option<i64>,
    #[builder(default)]
    crit: Option<i64>,
    #[builder(default)]
    min: Option<i64>,
    #[builder(default)]
    max: Option<i64>,
}

fn opt(x: Option<i64>) -> String {
    x.map(|v| v.to_string()).unwrap_or_default()
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        write!(
            f,
            "'{}'={};{};{};{};{}",
            self.label,
            self.value,
            opt(self.warn),
            opt(self.crit),
            opt(self.min),
            opt(self.max),
        )
    }
}

/// Print an UNKNOWN summary and exit with the matching code.
///
/// Used for configuration errors, before any chain was retrieved.
pub fn bail_out(message: impl Into<String>) -> ! {
    let state = State::Unknown;
    println!("{}: {}", state, message.into());
    std::process::exit(exit_code(state))
}

/// Print a CRITICAL summary and exit with the matching code.
pub fn abort(message: impl Into<String>) -> ! {
    let state = State::Critical;
    println!("{}: {}", state, message.into());
    std::process::exit(exit_code(state))
}


#[cfg(test)]
mod test_metric_display {
    use super::Metric;

    #[test]
    fn test_bare() {
        let m = Metric::builder().label("days").value(42).build();
        assert_eq!(m.to_string(), "'days'=42;;;;");
    }

    #[test]
    fn test_full() {
        let m = Metric::builder()
            .label("days")
            .value(42)
            .warn(Some(30))
            .crit(Some(15))
            .min(Some(0))
            .build();
        assert_eq!(m.to_string(), "'days'=42;30;15;0;");
    }
}
