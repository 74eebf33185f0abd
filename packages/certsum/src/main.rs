// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use clap::Parser;
use std::time::{Duration, Instant};

use check_cert::check::{self, bail_out, State};
use check_cert::fetcher;
use check_cert::hosts::{self, PatternError, SystemResolver};
use check_cert::scanner::{self, ScanConfig, ScanReport};
use check_cert::validation::{Policy, Thresholds};

#[derive(Parser, Debug)]
#[command(about = "certsum")]
struct Args {
    /// Hosts to scan, comma separated. Accepts IPs, CIDR blocks,
    /// final-octet ranges (a.b.c.d-e), hostnames and FQDNs.
    #[arg(long, value_delimiter = ',', required = true)]
    hosts: Vec<String>,

    /// Ports to probe on every host, comma separated
    #[arg(long, value_delimiter = ',', default_values_t = [443u16])]
    ports: Vec<u16>,

    /// Per-probe budget in milliseconds
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..))]
    scan_timeout: u64,

    /// Cancel the whole run after this many seconds without progress
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(2..))]
    app_timeout: u64,

    /// Cap on concurrent probes and concurrent per-host work
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    scan_rate_limit: u64,

    /// Critical if a certificate expires in fewer than this many days
    #[arg(long, default_value_t = 15)]
    age_critical: u32,

    /// Warn if a certificate expires in fewer than this many days
    #[arg(long, default_value_t = 30)]
    age_warning: u32,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    show_port_scan_results: bool,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    show_closed_ports: bool,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    show_hosts_with_valid_certs: bool,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    show_valid_certs: bool,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    show_overview: bool,

    /// Raise the log level to debug
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    openssl_probe::init_ssl_cert_env_vars();

    let args = Args::parse();

    let spec = if args.verbose { "debug" } else { "warn" };
    let _ = flexi_logger::Logger::try_with_env_or_str(spec)
        .and_then(|logger| logger.log_to_stderr().start());

    let expansion = hosts::expand(&args.hosts, &SystemResolver);
    for (pattern, err) in &expansion.errors {
        match err {
            // DNS can fail per host without invalidating the run.
            PatternError::Resolution(_) => log::warn!("skipping '{pattern}': {err}"),
            _ => bail_out(format!("bad host pattern '{pattern}': {err}")),
        }
    }
    let targets = hosts::cross_ports(&expansion.endpoints, &args.ports);
    if targets.is_empty() {
        bail_out("no targets to scan");
    }

    let thresholds = Thresholds::try_new(args.age_critical, args.age_warning)
        .unwrap_or_else(|err| bail_out(err.to_string()));
    let policy = Policy::builder().thresholds(thresholds).build();
    let config = ScanConfig::builder()
        .scan_timeout(Duration::from_millis(args.scan_timeout))
        .app_timeout(Duration::from_secs(args.app_timeout))
        .rate_limit(args.scan_rate_limit as usize)
        .fetch(
            fetcher::Config::builder()
                .timeout(Some(Duration::from_millis(args.scan_timeout.max(1000))))
                .build(),
        )
        .build();

    let started = Instant::now();
    let target_count = targets.len();
    let report = scanner::scan(targets, config, policy).await;

    render(&args, &report, target_count, started.elapsed());

    let mut exit_state = report
        .chains
        .iter()
        .map(|chain| chain.verdict.overall)
        .max()
        .unwrap_or(State::Ok);
    if report.timed_out {
        exit_state = exit_state.max(State::Unknown);
    }
    std::process::exit(check::exit_code(exit_state));
}

fn render(args: &Args, report: &ScanReport, target_count: usize, elapsed: Duration) {
    if args.show_port_scan_results {
        for probe in &report.probes {
            if probe.open {
                println!("open   {}", probe.target.addr());
            } else if args.show_closed_ports {
                println!("closed {}", probe.target.addr());
            }
        }
    }

    let mut valid_hosts = Vec::new();
    for discovered in &report.chains {
        let verdict = &discovered.verdict;
        let summary = verdict
            .error
            .clone()
            .or_else(|| {
                verdict
                    .primary
                    .and_then(|kind| verdict.results.iter().find(|r| r.kind == kind))
                    .map(|r| r.summary.clone())
            })
            .unwrap_or_else(|| "no validation checks applied".to_string());

        if verdict.overall == State::Ok {
            valid_hosts.push(discovered.target.addr());
            if args.show_valid_certs {
                println!("{}: {} {}", verdict.overall, discovered.target.addr(), summary);
            }
        } else {
            println!("{}: {} {}", verdict.overall, discovered.target.addr(), summary);
        }
    }

    if args.show_hosts_with_valid_certs {
        for addr in &valid_hosts {
            println!("valid  {addr}");
        }
    }

    if args.show_overview {
        let open = report.probes.iter().filter(|p| p.open).count();
        println!(
            "{} targets, {} open, {} closed, {} chains retrieved, {} valid, {:.1}s elapsed",
            target_count,
            open,
            report.probes.len() - open,
            report.chains.len(),
            valid_hosts.len(),
            elapsed.as_secs_f64(),
        );
    }

    if report.timed_out {
        println!("scan cancelled after inactivity timeout; results are partial");
    }
}
