// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;
use typed_builder::TypedBuilder;

use crate::check::State;
use crate::fetcher;
use crate::hosts::Target;
use crate::runner::{self, Source, Verdict};
use crate::validation::Policy;

#[derive(Debug, Clone, TypedBuilder)]
pub struct ScanConfig {
    /// Per-attempt budget for one TCP probe.
    #[builder(default = Duration::from_millis(200))]
    pub scan_timeout: Duration,
    /// Inactivity watchdog: the run is cancelled when no stage makes
    /// progress for this long.
    #[builder(default = Duration::from_secs(30))]
    pub app_timeout: Duration,
    /// Caps concurrent probes and concurrent per-host work, each.
    #[builder(default = 100)]
    pub rate_limit: usize,
    #[builder(default)]
    pub fetch: fetcher::Config,
}

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub target: Target,
    pub open: bool,
}

#[derive(Debug, Clone)]
pub struct DiscoveredChain {
    pub target: Target,
    pub verdict: Verdict,
}

enum Event {
    Probe(ProbeOutcome),
    Chain(Box<DiscoveredChain>),
}

/// Everything one scan run produced. Partial when the watchdog fired;
/// whatever was collected before cancellation is still here.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub probes: Vec<ProbeOutcome>,
    pub chains: Vec<DiscoveredChain>,
    pub timed_out: bool,
}

/// Probe every target and fetch chains from the open ones.
///
/// One task per target; fan-out is bounded by two semaphores of the same
/// capacity, one for the probe itself and one for the whole per-host
/// pipeline. Results flow over an unbounded channel into the single
/// collector below, so no shared structure needs locking. Every forward
/// step pulses the heartbeat; the watchdog cancels the run when the pulse
/// stays out for `app_timeout`.
pub async fn scan(targets: Vec<Target>, config: ScanConfig, policy: Policy) -> ScanReport {
    let probe_permits = Arc::new(Semaphore::new(config.rate_limit));
    let host_permits = Arc::new(Semaphore::new(config.rate_limit));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watchdog = tokio::spawn(watchdog(config.app_timeout, heartbeat_rx, shutdown_tx));

    info!("scanning {} targets", targets.len());
    let mut workers = Vec::with_capacity(targets.len());
    for target in targets {
        workers.push(tokio::spawn(probe_and_fetch(
            target,
            config.clone(),
            policy.clone(),
            Arc::clone(&probe_permits),
            Arc::clone(&host_permits),
            event_tx.clone(),
            heartbeat_tx.clone(),
            shutdown_rx.clone(),
        )));
    }
    // The collector loop below ends when the last worker drops its sender.
    drop(event_tx);
    drop(heartbeat_tx);

    let mut report = ScanReport::default();
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Probe(probe) => report.probes.push(probe),
            Event::Chain(chain) => report.chains.push(*chain),
        }
    }
    for worker in workers {
        let _ = worker.await;
    }
    report.timed_out = watchdog.await.unwrap_or(false);
    report
}

/// Returns true when the run was cancelled for inactivity.
async fn watchdog(
    app_timeout: Duration,
    mut heartbeat_rx: mpsc::UnboundedReceiver<()>,
    shutdown_tx: watch::Sender<bool>,
) -> bool {
    loop {
        match timeout(app_timeout, heartbeat_rx.recv()).await {
            Ok(Some(())) => continue,
            // All senders gone: the run completed on its own.
            Ok(None) => return false,
            Err(_) => {
                warn!(
                    "no progress for {}s, cancelling the scan",
                    app_timeout.as_secs()
                );
                let _ = shutdown_tx.send(true);
                return true;
            }
        }
    }
}

async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // Sender gone without cancelling; never resolve.
            std::future::pending::<()>().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn probe_and_fetch(
    target: Target,
    config: ScanConfig,
    policy: Policy,
    probe_permits: Arc<Semaphore>,
    host_permits: Arc<Semaphore>,
    events: mpsc::UnboundedSender<Event>,
    heartbeat: mpsc::UnboundedSender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _host_permit = tokio::select! {
        permit = host_permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
        _ = cancelled(&mut shutdown) => return,
    };

    let open = {
        let _probe_permit = tokio::select! {
            permit = probe_permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = cancelled(&mut shutdown) => return,
        };
        tokio::select! {
            result = timeout(config.scan_timeout, TcpStream::connect(target.addr())) => {
                matches!(result, Ok(Ok(_)))
            }
            _ = cancelled(&mut shutdown) => return,
        }
    };
    let _ = heartbeat.send(());
    let _ = events.send(Event::Probe(ProbeOutcome {
        target: target.clone(),
        open,
    }));
    if !open {
        debug!("{} closed", target.addr());
        return;
    }

    // The handshake is synchronous openssl; it runs off the scheduler and
    // is bounded by the fetch timeout rather than the cancellation token.
    let fetch_target = target.clone();
    let fetch_config = config.fetch.clone();
    let handle = tokio::task::spawn_blocking(move || {
        fetch_verdict(&fetch_target, &fetch_config, &policy, OffsetDateTime::now_utc())
    });
    let verdict = tokio::select! {
        verdict = handle => match verdict {
            Ok(verdict) => verdict,
            Err(_) => return,
        },
        _ = cancelled(&mut shutdown) => return,
    };
    let _ = heartbeat.send(());
    let _ = events.send(Event::Chain(Box::new(DiscoveredChain { target, verdict })));
}

/// Dial the already-resolved address; never re-resolve the name.
fn fetch_verdict(
    target: &Target,
    fetch: &fetcher::Config,
    policy: &Policy,
    now: OffsetDateTime,
) -> Verdict {
    let source = Source::Server {
        server: target.display(),
        port: target.port,
    };
    match fetcher::fetch_server_chain(&target.display(), target.addr(), fetch) {
        Ok(chain) => runner::assess(chain, source, policy, now),
        Err(err) => {
            debug!("fetch failed for {}: {err}", target.addr());
            Verdict::failure(source, policy.thresholds, State::Critical, err.to_string())
        }
    }
}

#[cfg(test)]
mod test_scan {
    use super::{scan, ScanConfig};
    use crate::fetcher;
    use crate::hosts::Target;
    use crate::validation::{Policy, Thresholds};
    use std::net::{IpAddr, Ipv4Addr, TcpListener};
    use std::time::Duration;

    fn policy() -> Policy {
        Policy::builder()
            .thresholds(Thresholds::try_new(15, 30).unwrap())
            .build()
    }

    fn config() -> ScanConfig {
        ScanConfig::builder()
            .scan_timeout(Duration::from_millis(200))
            .app_timeout(Duration::from_secs(5))
            .fetch(
                fetcher::Config::builder()
                    .timeout(Some(Duration::from_millis(500)))
                    .build(),
            )
            .build()
    }

    fn local_target(port: u16) -> Target {
        Target {
            name: String::new(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        }
    }

    /// Bind and drop a listener so the port is known to be closed.
    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_empty_target_list_completes() {
        let report = scan(Vec::new(), config(), policy()).await;
        assert!(report.probes.is_empty());
        assert!(report.chains.is_empty());
        assert!(!report.timed_out);
    }

    #[tokio::test]
    async fn test_closed_port_is_reported_closed() {
        let port = closed_port();
        let report = scan(vec![local_target(port)], config(), policy()).await;
        assert_eq!(report.probes.len(), 1);
        assert!(!report.probes[0].open);
        assert!(report.chains.is_empty());
        assert!(!report.timed_out);
    }

    #[tokio::test]
    async fn test_open_non_tls_port_yields_failure_verdict() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let report = scan(vec![local_target(port)], config(), policy()).await;
        assert_eq!(report.probes.len(), 1);
        assert!(report.probes[0].open);
        assert_eq!(report.chains.len(), 1);
        assert!(report.chains[0].verdict.error.is_some());
        assert!(!report.timed_out);
        drop(listener);
    }

    #[tokio::test]
    async fn test_watchdog_cancels_a_stalled_run() {
        // Zero permits: no stage can make progress, so nothing ever pulses
        // the heartbeat and the watchdog must fire.
        let config = ScanConfig::builder()
            .app_timeout(Duration::from_millis(100))
            .rate_limit(0)
            .build();
        let report = scan(vec![local_target(443)], config, policy()).await;
        assert!(report.timed_out);
        assert!(report.probes.is_empty());
        assert!(report.chains.is_empty());
    }
}
