//! xln-node — the XLN runtime binary.
//!
//! Startup sequence:
//!   1. Open (or create) the snapshot store
//!   2. Restore the latest snapshot if one exists
//!   3. Import the default jurisdiction mirror
//!   4. Start the JSON-RPC 2.0 server
//!   5. Register with the relay, then run the tick loop on a fixed cadence
//!      and the REPL on stdin
//!
//! Each tick, gossip-resolved network outputs leave through the relay and
//! inbound relay frames feed the next tick's input queue.
//!
//! REPL commands: `status`, `reserves <eid>`, `r2r <from> <to> <amount>
//! <nonce> <hankoData>`, `register <name>`, `nonce <eid>`, `exit`.
//! Exit codes: 0 normal, 1 unrecognized command or backend error.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use xln_core::EvmAddress;
use xln_relay::{Relay, RelayFrame};
use xln_rpc::{RpcServer, RpcServerState};
use xln_runtime::{EntityInputRecord, Runtime, RuntimeContext, RuntimeTx, SnapshotStore};

#[derive(Parser, Debug)]
#[command(
    name = "xln-node",
    version,
    about = "XLN node — off-chain payments with batched on-chain settlement"
)]
struct Args {
    /// Directory for the persistent snapshot database.
    #[arg(long, default_value = "~/.xln/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8546")]
    rpc_addr: SocketAddr,

    /// Runtime identifier used by the relay and gossip.
    #[arg(long, default_value = "local")]
    runtime_id: String,

    /// EVM chain id of the jurisdiction.
    #[arg(long, default_value_t = 31337)]
    chain_id: u64,

    /// Depository contract address (hex).
    #[arg(long, default_value = "0x00000000000000000000000000000000000000dd")]
    depository: String,

    /// EntityProvider contract address (hex).
    #[arg(long, default_value = "0x00000000000000000000000000000000000000ee")]
    entity_provider: String,

    /// Jurisdiction block cadence in milliseconds.
    #[arg(long, default_value_t = 1000)]
    block_delay_ms: u64,

    /// Tick cadence in milliseconds.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Run without the interactive REPL (service mode).
    #[arg(long)]
    headless: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

fn expand_tilde(path: &PathBuf) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.clone()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,xln=debug".parse().unwrap()),
        )
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    info!("XLN node starting");

    let depository = EvmAddress::from_hex(&args.depository).context("parsing depository address")?;
    let entity_provider =
        EvmAddress::from_hex(&args.entity_provider).context("parsing entity provider address")?;

    // Developer-mode brainvault seed; real deployments inject key material.
    let seed = std::env::var("RUNTIME_SEED").unwrap_or_else(|_| "xln-dev-seed".to_string());

    // ── Snapshot store ────────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let store = SnapshotStore::open(&data_dir).context("opening snapshot store")?;

    let ctx = RuntimeContext::new(
        args.runtime_id.clone(),
        seed.into_bytes(),
        args.chain_id,
        depository,
        entity_provider,
    );
    let mut runtime = Runtime::new(ctx, Some(store));
    let restored = runtime.load_latest().unwrap_or_else(|err| {
        warn!(%err, "snapshot restore failed; starting fresh");
        false
    });
    if !restored {
        info!("fresh runtime — importing default jurisdiction");
    }
    runtime.enqueue_runtime_tx(RuntimeTx::ImportJ {
        alias: "main".into(),
        chain_id: args.chain_id,
        depository,
        entity_provider,
        block_delay_ms: args.block_delay_ms,
    });

    let runtime = Arc::new(Mutex::new(runtime));

    // ── RPC server ────────────────────────────────────────────────────────────
    let state = Arc::new(RpcServerState {
        runtime: Arc::clone(&runtime),
        known_tokens: (1..=8).collect(),
    });
    let handle = RpcServer::new(state).start(args.rpc_addr).await?;

    // ── Tick loop + relay ─────────────────────────────────────────────────────
    let tick_runtime = Arc::clone(&runtime);
    let tick_ms = args.tick_ms;
    let relay_id = args.runtime_id.clone();
    let ticker = tokio::spawn(async move {
        // In-process relay instance; an external relay daemon is reached
        // through the same ingest/drain surface.
        let mut relay = Relay::new();
        relay.register(&relay_id, None);

        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        loop {
            interval.tick().await;
            let mut rt = tick_runtime.lock().expect("runtime lock");
            rt.set_timestamp(now_ms());
            if let Err(err) = rt.tick() {
                warn!(%err, "tick failed");
            }

            // Outbound: gossip-resolved records leave as relay frames. The
            // envelope is bincode; the payload stays in the canonical JSON
            // domain.
            for (target, record) in rt.drain_network_outputs() {
                let payload =
                    serde_json::to_vec(&record).expect("input record always encodes");
                let frame = RelayFrame { from: relay_id.clone(), to: target, payload };
                if let Err(err) = relay.ingest(&relay_id, &frame.to_bytes()) {
                    warn!(%err, "relay refused outbound frame");
                }
            }

            // Inbound: frames addressed to this runtime feed the next tick.
            for frame in relay.drain(&relay_id) {
                match serde_json::from_slice::<EntityInputRecord>(&frame.payload) {
                    Ok(record) => rt.enqueue_entity_input(record),
                    Err(err) => {
                        warn!(%err, from = %frame.from, "dropping malformed relay payload")
                    }
                }
            }
        }
    });

    if args.headless {
        ticker.await.ok();
        handle.stop().ok();
        return Ok(ExitCode::from(0));
    }

    // ── REPL ──────────────────────────────────────────────────────────────────
    let code = repl(&format!("http://{}", args.rpc_addr)).await;
    ticker.abort();
    handle.stop().ok();
    Ok(code)
}

// ── REPL ─────────────────────────────────────────────────────────────────────

async fn rpc_call(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1
    });
    let resp: serde_json::Value = client.post(url).json(&body).send().await?.json().await?;
    if let Some(err) = resp.get("error") {
        anyhow::bail!("backend error: {err}");
    }
    Ok(resp.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

async fn repl(url: &str) -> ExitCode {
    let client = reqwest::Client::new();
    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        print!("xln> ");
        let _ = std::io::stdout().flush();
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => return ExitCode::from(0),
            Ok(_) => {}
            Err(_) => return ExitCode::from(1),
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let result = match parts.as_slice() {
            [] => continue,
            ["exit"] | ["quit"] => return ExitCode::from(0),
            ["status"] => rpc_call(&client, url, "xln_status", serde_json::json!([])).await,
            ["reserves", eid] => {
                rpc_call(&client, url, "xln_reserves", serde_json::json!([eid])).await
            }
            ["nonce", eid] => rpc_call(&client, url, "xln_nonce", serde_json::json!([eid])).await,
            ["register", name] => {
                rpc_call(&client, url, "xln_register", serde_json::json!([name])).await
            }
            ["r2r", from, to, amount, nonce, hanko_data] => {
                let Ok(nonce) = nonce.parse::<u64>() else {
                    eprintln!("invalid nonce");
                    return ExitCode::from(1);
                };
                rpc_call(
                    &client,
                    url,
                    "xln_r2r",
                    serde_json::json!([from, to, 1u64, amount, nonce, hanko_data]),
                )
                .await
            }
            other => {
                eprintln!("unrecognized command: {}", other.join(" "));
                return ExitCode::from(1);
            }
        };
        match result {
            Ok(value) => println!("{value:#}"),
            Err(err) => {
                eprintln!("{err:#}");
                return ExitCode::from(1);
            }
        }
    }
}
