// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

use check_cert::check::{self, bail_out, Metric};
use check_cert::fetcher;
use check_cert::output::Report;
use check_cert::payload;
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
#[command(about = "check_cert")]
struct Args {
    /// DNS name or IP address of a TLS server
    #[arg(short, long)]
    server: Option<String>,

    /// Path of a PEM or DER file to read the chain from
    #[arg(short, long, conflicts_with = "server")]
    filename: Option<PathBuf>,

    /// TCP port
    #[arg(short, long, default_value_t = 443)]
    port: u16,

    /// Expected DNS name of the leaf certificate; defaults to the server
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
    /// (expiration, hostname, sans, weak-signature)
    #[arg(long, value_delimiter = ',')]
    apply_validation_result: Vec<String>,

    /// Checks to force-ignore, comma separated
    #[arg(long, value_delimiter = ',')]
    ignore_validation_result: Vec<String>,

    /// List ignored check results in the report body
    #[arg(long, action = clap::ArgAction::SetTrue)]
    list_ignored_errors: bool,

    /// Write the evaluated chain as a versioned JSON record to this path
    #[arg(long)]
    payload_file: Option<PathBuf>,

    /// Network timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Raise the log level to debug
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
}

fn init_logging(spec: &str) -> Result<flexi_logger::LoggerHandle, flexi_logger::FlexiLoggerError> {
    flexi_logger::Logger::try_with_env_or_str(spec)?
        .log_to_stderr()
        .format(logfmt)
        .start()
}

/// `ts=... level=... msg="..."` on stderr, one record per line.
fn logfmt(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    write!(
        w,
        "ts={} level={} msg=\"{}\"",
        now.format("%Y-%m-%dT%H:%M:%SZ"),
        record.level().as_str().to_lowercase(),
        record.args()
    )
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
    // The trust store location differs per platform; probe it before any
    // TLS setup.
    openssl_probe::init_ssl_cert_env_vars();

    let args = Args::parse();

    let spec = if args.verbose {
        "debug"
    } else {
        args.log_level.as_spec()
    };
    if let Err(err) = init_logging(spec) {
        bail_out(format!("failed to initialize logging: {err}"));
    }

    let source = match (&args.server, &args.filename) {
        (Some(server), None) => Source::Server {
            server: server.clone(),
            port: args.port,
        },
        (None, Some(path)) => Source::File { path: path.clone() },
        (Some(_), Some(_)) => bail_out("--server and --filename are mutually exclusive"),
        (None, None) => bail_out("either --server or --filename is required"),
    };

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

    let fetch = fetcher::Config::builder()
        .timeout(Some(Duration::from_secs(args.timeout)))
        .build();
    let config = RunConfig::builder()
        .source(source)
        .policy(policy)
        .fetch(fetch)
        .build();

    let now = OffsetDateTime::now_utc();
    let verdict = runner::run(&config, now);

    let mut metrics = Vec::new();
    if let Some(leaf) = verdict.chain.leaf() {
        metrics.push(
            Metric::builder()
                .label("certificate_remaining_days")
                .value((leaf.not_after() - now).whole_days())
                .warn(Some(i64::from(args.age_warning)))
                .crit(Some(i64::from(args.age_critical)))
                .min(Some(0))
                .build(),
        );
    }

    if let Some(path) = &args.payload_file {
        match payload::encode(&verdict, now) {
            Ok(record) => {
                if let Err(err) = std::fs::write(path, record) {
                    log::error!("cannot write payload to {}: {err}", path.display());
                }
            }
            Err(err) => log::error!("payload encoding failed: {err}"),
        }
    }

    let report = Report::builder()
        .verdict(&verdict)
        .now(now)
        .list_ignored(args.list_ignored_errors)
        .metrics(metrics)
        .build();
    println!("{report}");
    std::process::exit(check::exit_code(verdict.overall));
}
