// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use clap::{Parser, ValueEnum};
use openssl::x509::X509;
use std::time::Duration;
use time::OffsetDateTime;

use check_cert::check::{self, bail_out};
use check_cert::fetcher;
use check_cert::output::Report;
use check_cert::runner::{self, RunConfig, Source};
use check_cert::validation::{CheckKind, Policy, Thresholds};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Disabled,
    Panic,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_spec(self) -> &'static str {
        match self {
            Self::Disabled => "off",
            // Panic and fatal exist for compatibility; the log crate tops
            // out at error.
            Self::Panic | Self::Fatal | Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "lscert")]
struct Args {
    /// TCP port
    #[arg(short, long, default_value_t = 443)]
    port: u16,

    /// Expected DNS name of the leaf certificate; defaults to the target
    #[arg(long)]
    dns_name: Option<String>,

    /// Critical if the certificate expires in fewer than this many days
    #[arg(long, default_value_t = 15)]
    age_critical: u32,

    /// Warn if the certificate expires in fewer than this many days
    #[arg(long, default_value_t = 30)]
    age_warning: u32,

    /// SANs expected on the leaf, comma separated
    #[arg(long, value_delimiter = ',')]
    sans_entries: Vec<String>,

    /// Do not fail hostname verification when the leaf carries no SANs
    #[arg(long, action = clap::ArgAction::SetTrue)]
    ignore_hostname_verification_if_empty_sans: bool,

    /// Treat expired intermediate certificates as ignored
    #[arg(long, action = clap::ArgAction::SetTrue)]
    ignore_expired_intermediate_certs: bool,

    /// Treat expired root certificates as ignored
    #[arg(long, action = clap::ArgAction::SetTrue)]
    ignore_expired_root_certs: bool,

    /// Checks to force-apply, comma separated
    #[arg(long, value_delimiter = ',')]
    apply_validation_result: Vec<String>,

    /// Checks to force-ignore, comma separated
    #[arg(long, value_delimiter = ',')]
    ignore_validation_result: Vec<String>,

    /// List ignored check results in the report body
    #[arg(long, action = clap::ArgAction::SetTrue)]
    list_ignored_errors: bool,

    /// Network timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Additionally print the chain in OpenSSL text form
    #[arg(long, action = clap::ArgAction::SetTrue)]
    text: bool,

    /// Raise the log level to debug
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// URL, DNS name or IP address of the target; flags go before it
    target: String,
}

/// Accepts `https://host:port/path`, `host:port` or a bare name and
/// reduces it to the host part. The port, if any, comes from `--port`.
fn host_of(target: &str) -> String {
    let stripped = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"))
        .unwrap_or(target);
    let host = stripped.split('/').next().unwrap_or(stripped);
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => {
            name.to_string()
        }
        _ => host.to_string(),
    }
}

fn parse_check_list(raw: &[String]) -> Vec<CheckKind> {
    raw.iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            CheckKind::from_keyword(s.trim())
                .unwrap_or_else(|| bail_out(format!("unknown validation check '{}'", s.trim())))
        })
        .collect()
}

fn main() {
    openssl_probe::init_ssl_cert_env_vars();

    let args = Args::parse();

    let spec = if args.verbose {
        "debug"
    } else {
        args.log_level.as_spec()
    };
    let _ = flexi_logger::Logger::try_with_env_or_str(spec)
        .and_then(|logger| logger.log_to_stderr().start());

    let server = host_of(&args.target);
    if server.is_empty() {
        bail_out("no host in target argument");
    }

    let thresholds = Thresholds::try_new(args.age_critical, args.age_warning)
        .unwrap_or_else(|err| bail_out(err.to_string()));
    let sans_entries = if args.sans_entries.is_empty() {
        None
    } else {
        Some(args.sans_entries.clone())
    };
    let policy = Policy::builder()
        .thresholds(thresholds)
        .verification_name(args.dns_name.clone())
        .sans_entries(sans_entries)
        .ignore_hostname_if_empty_sans(args.ignore_hostname_verification_if_empty_sans)
        .ignore_expired_intermediates(args.ignore_expired_intermediate_certs)
        .ignore_expired_roots(args.ignore_expired_root_certs)
        .apply(parse_check_list(&args.apply_validation_result))
        .ignore(parse_check_list(&args.ignore_validation_result))
        .build();
    if let Err(err) = policy.validate() {
        bail_out(err.to_string());
    }

    let config = RunConfig::builder()
        .source(Source::Server {
            server,
            port: args.port,
        })
        .policy(policy)
        .fetch(
            fetcher::Config::builder()
                .timeout(Some(Duration::from_secs(args.timeout)))
                .build(),
        )
        .build();

    let now = OffsetDateTime::now_utc();
    let verdict = runner::run(&config, now);

    let report = Report::builder()
        .verdict(&verdict)
        .now(now)
        .list_ignored(args.list_ignored_errors)
        .build();
    println!("{report}");

    if args.text {
        for cert in verdict.chain.certs() {
            match X509::from_der(cert.der()).and_then(|x509| x509.to_text()) {
                Ok(text) => println!("{}", String::from_utf8_lossy(&text)),
                Err(err) => log::error!("cannot render certificate: {err}"),
            }
        }
    }

    std::process::exit(check::exit_code(verdict.overall));
}
