// CLI entry point for the Ferry relay.
//
// Loads (or signs in for) the relay's credential, starts the relay, and
// blocks until Ctrl+C or SIGTERM closes the listener. See `server.rs` for
// the threading layout and `pair.rs` for what happens per client.
//
// Usage:
//   ferry [OPTIONS]
//     --target <HOST[:PORT]>     Upstream server (prompted for when absent)
//     --listen <ADDR>            Downstream listen address (default: 127.0.0.1:19132)
//     --token-file <PATH>        Credential file (default: token.json)
//     --name <NAME>              Name used for upstream logins (default: ferry)
//     --max-players <N>          Client limit, 0 for none (default: 20)
//     --dial-timeout-secs <N>    Upstream connect timeout (default: 10)

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ferry_relay::config::{DEFAULT_LISTEN_ADDR, DEFAULT_TOKEN_FILE, TargetAddr, prompt_target};
use ferry_relay::credential::{CredentialCache, RefreshingTokenSource};
use ferry_relay::live::LiveDeviceAuth;
use ferry_relay::server::{RelayConfig, start_relay};

#[derive(Debug, Parser)]
#[command(name = "ferry", about = "Relay game clients to an upstream server")]
struct Args {
    /// Upstream server as host[:port]; the default port is used when omitted.
    #[arg(long)]
    target: Option<String>,

    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    #[arg(long, default_value = DEFAULT_TOKEN_FILE)]
    token_file: PathBuf,

    #[arg(long, default_value = "ferry")]
    name: String,

    #[arg(long, default_value_t = 20)]
    max_players: usize,

    #[arg(long, default_value_t = 10)]
    dial_timeout_secs: u64,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let target = match &args.target {
        Some(target) => target.clone(),
        None => prompt_target(io::stdin().lock(), io::stdout()).context("cannot read target")?,
    };
    let target = TargetAddr::parse(&target).context("invalid target address")?;

    let cache = CredentialCache::new(&args.token_file);
    let credential = cache
        .obtain(&LiveDeviceAuth::new())
        .context("cannot obtain credential")?;
    let token_source =
        Arc::new(RefreshingTokenSource::new(credential, LiveDeviceAuth::new()).persist_to(cache));

    let config = RelayConfig {
        listen_addr: args.listen,
        display_name: args.name,
        max_players: args.max_players,
        dial_timeout: Duration::from_secs(args.dial_timeout_secs),
        ..RelayConfig::new(target)
    };
    let (handle, addr) = start_relay(config, token_source).context("cannot start relay")?;
    info!(%addr, "press Ctrl+C to stop");

    let trigger = handle.shutdown_trigger();
    ctrlc::set_handler(move || {
        info!("shutting down");
        trigger.shutdown();
    })
    .context("cannot install signal handler")?;

    handle.wait().context("relay stopped")?;
    Ok(())
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
