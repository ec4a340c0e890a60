//! quickportd: QuickPort peer-to-peer file transfer.
//!
//! `quickportd host` prints a connection token and waits for a peer;
//! `quickportd join [token]` connects to one. `quickportd debug` hosts on
//! loopback with debug logging for local testing.

use std::io::{self, BufRead, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use quickport_core::{QuickPortConfig, TokenCodec};
use quickport_services::address::{external_address, local_address};
use quickport_services::catalog::{exchange_catalogs, load_catalog, Role};
use quickport_services::{connect, listen, AccessRequest, Handle, SelfConfig, SessionRuntime};

mod shell;

const CATALOG_WAIT: Duration = Duration::from_secs(10);
const STUN_TIMEOUT: Duration = Duration::from_secs(3);
const SETUP_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Host,
    Join,
    Debug,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "h" => Ok(Self::Host),
            "join" | "j" => Ok(Self::Join),
            "debug" | "d" => Ok(Self::Debug),
            other => anyhow::bail!("unknown mode {other:?} (expected host, join or debug)"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mode = match args.next() {
        Some(m) => m.parse()?,
        None => prompt("mode [host/join/debug]: ")?.parse()?,
    };
    let mut token_arg = args.next();

    let default_filter = if mode == Mode::Debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    if let Err(e) = QuickPortConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = QuickPortConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        QuickPortConfig::default()
    });
    if mode == Mode::Debug {
        config.network.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    }
    tracing::info!(?mode, name = %config.identity.name, "quickportd starting");

    let mut failures = 0;
    let (handle, role) = loop {
        let attempt = match mode {
            Mode::Host | Mode::Debug => host(&config).await.map(|h| Some((h, Role::Host))),
            Mode::Join => join(&config, token_arg.take())
                .await
                .map(|h| h.map(|h| (h, Role::Joiner))),
        };
        match attempt {
            Ok(Some(established)) => break established,
            Ok(None) => println!("the host refused the request"),
            Err(e) => {
                failures += 1;
                if failures >= SETUP_ATTEMPTS {
                    return Err(e.context("giving up on session setup"));
                }
                tracing::warn!(error = %format!("{e:#}"), attempt = failures, "session setup failed");
                println!("setup failed: {e:#}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    let ours = load_catalog(config.transfer.share_dir.clone())
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, dir = %config.transfer.share_dir.display(), "cannot list shared files");
            Vec::new()
        });
    let peer_catalog = exchange_catalogs(&handle.local, &handle.peer, role, ours, CATALOG_WAIT)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %format!("{e:#}"), "catalog exchange failed");
            Vec::new()
        });

    let (runtime, events) = SessionRuntime::start(handle, config.transfer.clone(), config.liveness.clone());

    let shell = shell::run(runtime, events, peer_catalog);
    tokio::select! {
        result = shell => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    tracing::info!("quickportd stopped");
    Ok(())
}

fn codec(config: &QuickPortConfig) -> TokenCodec {
    TokenCodec::new(config.token.ttl_secs, config.token.compress)
}

/// Bind, publish a token and wait for someone to be admitted.
async fn host(config: &QuickPortConfig) -> Result<Handle> {
    let local = SelfConfig::bind(config.identity.name.clone(), &config.network)?;
    let advertised = advertised_addr(config, local.primary_addr, STUN_TIMEOUT).await?;

    let token = codec(config)
        .generate(&local.name, advertised)
        .context("generating token")?;
    println!("Your connection token: {token}");
    println!("Waiting for peer connection...");

    let mut decider = |request: &AccessRequest| -> Result<bool> {
        let answer = prompt(&format!("{} ({}) wants to connect. allow? [y/N]: ", request.name, request.from))?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    };
    let peer = listen(&local, &mut decider, None).await?;
    println!("{} joined", peer.name);

    Ok(Handle::new(local, peer, config.liveness.ping_timeout()))
}

/// Read a token, bind and ask its issuer for access. `None` means refused.
async fn join(config: &QuickPortConfig, token: Option<String>) -> Result<Option<Handle>> {
    let token = match token {
        Some(t) => t,
        None => prompt("connection token: ")?,
    };
    let target = codec(config).parse(token.trim()).context("reading token")?;
    tracing::info!(host = %target.name, addr = %target.addr(), "token accepted");

    let local = SelfConfig::bind(config.identity.name.clone(), &config.network)?;
    let timeout = Duration::from_secs(config.network.handshake_timeout_secs);
    println!("asking {} for access...", target.name);

    let Some(peer) = connect(&local, target.addr(), timeout).await? else {
        return Ok(None);
    };
    println!("connected to {}", peer.name);
    Ok(Some(Handle::new(local, peer, config.liveness.ping_timeout())))
}

/// The address a peer should dial to reach `bound`.
///
/// With `use_external_address` a failed STUN lookup is an error: a LAN
/// address would be useless to a peer outside it.
async fn advertised_addr(
    config: &QuickPortConfig,
    bound: SocketAddr,
    stun_wait: Duration,
) -> Result<SocketAddr> {
    if !bound.ip().is_unspecified() {
        return Ok(bound);
    }
    if config.network.use_external_address {
        let mapped = external_address(&config.network.stun_server, stun_wait)
            .await
            .with_context(|| format!("STUN lookup via {}", config.network.stun_server))?;
        tracing::info!(%mapped, "external address via STUN");
        return Ok(SocketAddr::new(mapped.ip(), bound.port()));
    }
    let ip = local_address().context("finding a LAN address")?;
    Ok(SocketAddr::new(ip, bound.port()))
}

fn prompt(question: &str) -> Result<String> {
    print!("{question}");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        anyhow::bail!("stdin closed");
    }
    Ok(line.trim_end().to_string())
}
