// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use log::{debug, info};
use std::path::PathBuf;
use time::OffsetDateTime;
use typed_builder::TypedBuilder;

use crate::certs::{classify_chain, Chain, ChainPosition};
use crate::check::State;
use crate::fetcher::{self, FetchError};
use crate::validation::{collapse, evaluate, CheckKind, CheckResult, Policy, Thresholds};

/// Where a chain came from.
#[derive(Debug, Clone)]
pub enum Source {
    Server { server: String, port: u16 },
    File { path: PathBuf },
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Server { server, port } => write!(f, "{server}:{port}"),
            Self::File { path } => write!(f, "{}", path.display()),
        }
    }
}

/// The collapsed outcome of all validation checks for one chain.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub overall: State,
    pub primary: Option<CheckKind>,
    pub results: Vec<CheckResult>,
    pub chain: Chain,
    pub positions: Vec<ChainPosition>,
    pub source: Source,
    pub thresholds: Thresholds,
    pub error: Option<String>,
}

impl Verdict {
    pub fn failure(source: Source, thresholds: Thresholds, state: State, message: String) -> Self {
        Self {
            overall: state,
            primary: None,
            results: Vec::new(),
            chain: Chain::default(),
            positions: Vec::new(),
            source,
            thresholds,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RunConfig {
    pub source: Source,
    pub policy: Policy,
    #[builder(default)]
    pub fetch: fetcher::Config,
}

/// One target in, one verdict out. Synchronous; the only blocking points
/// are dial, handshake and read, each bounded by the fetch timeout.
///
/// Retrieval errors do not propagate: they become a CRITICAL verdict, the
/// mapping the monitoring framework expects for connectivity and input
/// problems. Configuration errors are caught before this layer runs.
pub fn run(config: &RunConfig, now: OffsetDateTime) -> Verdict {
    let chain = match retrieve(&config.source, &config.fetch) {
        Ok(chain) => chain,
        Err(err) => {
            info!("retrieval failed for {}: {err}", config.source);
            return Verdict::failure(
                config.source.clone(),
                config.policy.thresholds,
                State::Critical,
                err.to_string(),
            );
        }
    };
    debug!(
        "retrieved chain of {} certificates from {}",
        chain.len(),
        config.source
    );
    assess(chain, config.source.clone(), &config.policy, now)
}

/// Classify, evaluate and collapse one already-retrieved chain. Shared by
/// the single-target path and the scanner, which dials on its own.
pub fn assess(chain: Chain, source: Source, policy: &Policy, now: OffsetDateTime) -> Verdict {
    let positions = classify_chain(&chain);
    let policy = effective_policy(policy, &source);
    let results = evaluate(&chain, &positions, &policy, now);
    let (mut overall, primary) = collapse(&results);

    // A classifier miss is an internal error: report the chain anyway but
    // never claim a clean verdict for it.
    if positions.contains(&ChainPosition::Unknown) {
        overall = overall.max(State::Unknown);
    }

    Verdict {
        overall,
        primary,
        results,
        chain,
        positions,
        source,
        thresholds: policy.thresholds,
        error: None,
    }
}

fn retrieve(source: &Source, fetch: &fetcher::Config) -> Result<Chain, FetchError> {
    match source {
        Source::Server { server, port } => {
            let addr = fetcher::to_addr(server, *port)?;
            fetcher::fetch_server_chain(server, addr, fetch)
        }
        Source::File { path } => fetcher::read_chain_from_file(path),
    }
}

/// The hostname check verifies against the explicit dns-name when given and
/// falls back to the connection server value.
fn effective_policy(policy: &Policy, source: &Source) -> Policy {
    let mut policy = policy.clone();
    if policy.verification_name.is_none() {
        if let Source::Server { server, .. } = source {
            policy.verification_name = Some(server.clone());
        }
    }
    policy
}
