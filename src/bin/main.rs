//! Buho CLI - wallet orchestration from the shell
//!
//! Every command prints one JSON document:
//!   buho wallets                       → [{id, name, type, balance, ...}]
//!   buho balance [id]                  → {wallet_id, balance}
//!   buho invoice 2100 --memo coffee    → {payment_request, payment_hash, ...}
//!   buho pay <destination> --amount 21 → {id, payment_hash, fee, status}
//!
//! Configuration comes from the environment (a `.env` in the working
//! directory is loaded first; variables already set win):
//!   BUHO_DATA_DIR, BUHO_EXPLORER_URL, BUHO_POLL_SECS, BUHO_NWC_RETRIES
//!
//! Output format:
//!   --json     Compact JSON (default for non-tty)
//!   --pretty   Pretty-print JSON (default for tty)

use buho::logging::init_logging;
use buho::{
    group_transactions, install_signal_handlers, parse_payment_destination, AutoWithdrawConfig, Backends,
    BalancePoller, BuhoConfig, CreateInvoiceRequest, FeeSpeed, MonitorEvent, Page, PaymentMonitor, WalletStore,
    WatchedInvoice,
};
use serde_json::{json, Value};
use std::env;
use std::future::Future;
use std::io::IsTerminal;
use std::sync::Arc;
use tracing::{debug, info};

fn main() {
    init_logging();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }

    if opts.version {
        println!("buho {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("wallets") | Some("ls") => cmd_wallets(&opts),
        Some("add-lnbits") => cmd_add_lnbits(&opts),
        Some("add-nwc") => cmd_add_nwc(&opts),
        Some("remove") | Some("rm") => cmd_remove(&opts),
        Some("balance") => cmd_balance(&opts),
        Some("invoice") => cmd_invoice(&opts),
        Some("pay") => cmd_pay(&opts),
        Some("parse") => cmd_parse(&opts),
        Some("history") => cmd_history(&opts),
        Some("lookup") => cmd_lookup(&opts),
        Some("auto-withdraw") => cmd_auto_withdraw(&opts),
        Some("run") => cmd_run(&opts),
        Some(cmd) => Err(format!("Unknown command: {}", cmd)),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = !opts.json && (opts.pretty || std::io::stdout().is_terminal());
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({"error": e}), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    target: Option<String>,
    // Wallet options
    url: Option<String>,
    wallet_id: Option<String>,
    key: Option<String>,
    uri: Option<String>,
    name: Option<String>,
    // Payment options
    amount: Option<u64>,
    memo: Option<String>,
    watch: bool,
    grouped: bool,
    limit: Option<usize>,
    // Auto-withdraw options
    threshold: Option<u64>,
    address: Option<String>,
    onchain: bool,
    speed: Option<String>,
    disable: bool,
    data_dir: Option<String>,
    // Output options
    json: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        // Load .env file if present
        if let Ok(contents) = std::fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    if !value.is_empty() && env::var(key.trim()).is_err() {
                        env::set_var(key.trim(), value);
                    }
                }
            }
        }

        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        let value_at = |i: usize| args.get(i + 1).cloned();

        while i < args.len() {
            let arg = &args[i];
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--json" => opts.json = true,
                "--pretty" => opts.pretty = true,
                "--watch" | "-w" => opts.watch = true,
                "--grouped" | "-g" => opts.grouped = true,
                "--onchain" => opts.onchain = true,
                "--disable" => opts.disable = true,
                "--url" | "-u" => {
                    opts.url = value_at(i);
                    i += 1;
                }
                "--wallet-id" => {
                    opts.wallet_id = value_at(i);
                    i += 1;
                }
                "--key" | "-k" => {
                    opts.key = value_at(i);
                    i += 1;
                }
                "--uri" => {
                    opts.uri = value_at(i);
                    i += 1;
                }
                "--name" | "-n" => {
                    opts.name = value_at(i);
                    i += 1;
                }
                "--amount" | "-a" => {
                    opts.amount = value_at(i).and_then(|v| v.parse().ok());
                    i += 1;
                }
                "--memo" | "-m" => {
                    opts.memo = value_at(i);
                    i += 1;
                }
                "--limit" | "-l" => {
                    opts.limit = value_at(i).and_then(|v| v.parse().ok());
                    i += 1;
                }
                "--threshold" | "-t" => {
                    opts.threshold = value_at(i).and_then(|v| v.parse().ok());
                    i += 1;
                }
                "--address" => {
                    opts.address = value_at(i);
                    i += 1;
                }
                "--speed" => {
                    opts.speed = value_at(i);
                    i += 1;
                }
                "--data-dir" | "-d" => {
                    opts.data_dir = value_at(i);
                    i += 1;
                }
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {} // Ignore unknown flags
            }
            i += 1;
        }

        // First positional is command, second its target
        if !positional.is_empty() {
            opts.command = Some(positional.remove(0));
        }
        if !positional.is_empty() {
            opts.target = Some(positional.remove(0));
        }

        // Environment fills what the command line left out
        if opts.data_dir.is_none() {
            opts.data_dir = env::var("BUHO_DATA_DIR").ok().filter(|s| !s.is_empty());
        }

        opts
    }
}

fn print_usage() {
    println!(
        r#"buho - multi-wallet Lightning orchestration

USAGE:
    buho <command> [target] [options]

COMMANDS:
    wallets                         List wallets (active first)
    add-lnbits                      Connect an LNBits wallet
        --url <server> --wallet-id <id> --key <admin key> [--name <name>]
    add-nwc --uri <nwc uri>         Connect a Nostr Wallet Connect wallet [--name <name>]
    remove <id>                     Forget a wallet
    balance [id]                    Refresh and print a balance (default: active wallet)
    invoice <sats>                  Create an invoice [--memo <text>] [--watch]
    pay <destination>               Pay an invoice, lightning address or Spark address [--amount <sats>]
    parse <input>                   Classify a payment destination
    history [id]                    Recent transactions [--grouped] [--limit <n>]
    lookup <payment hash>           Check whether an invoice was paid
    auto-withdraw <id>              Configure threshold sweeps
        --threshold <sats> --address <dest> [--onchain --speed low|medium|high] [--disable]
    run                             Poll balances (and sweep) until SIGINT/SIGTERM

OPTIONS:
    --data-dir, -d <path>           Data directory (env: BUHO_DATA_DIR)
    --json                          Compact JSON output
    --pretty                        Pretty-print JSON
    --version, -V                   Print version

EXAMPLES:
    buho add-nwc --uri "nostr+walletconnect://...?relay=wss://relay.example&secret=..."
    buho invoice 2100 --memo coffee --watch
    buho pay satoshi@example.com --amount 21
    buho history --grouped --json | jq '.[0]'
    buho auto-withdraw wallet-123 --threshold 100000 --address me@example.com
"#
    );
}

// =============================================================================
// Plumbing
// =============================================================================

fn load_config(opts: &ParsedArgs) -> BuhoConfig {
    let config = BuhoConfig::from_env();
    match opts.data_dir.as_deref() {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    }
}

fn open_store(opts: &ParsedArgs) -> Result<Arc<WalletStore>, String> {
    let config = load_config(opts);
    let backends = Backends::native(&config).map_err(|e| format!("Failed to build backends: {}", e))?;
    debug!(data_dir = %config.data_dir.display(), "opening wallet store");
    Ok(Arc::new(WalletStore::open(config, backends)))
}

fn block_on<F>(future: F) -> Result<Value, String>
where
    F: Future<Output = Result<Value, String>>,
{
    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    rt.block_on(future)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("Failed to encode output: {}", e))
}

fn required<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str, String> {
    value.as_deref().filter(|v| !v.trim().is_empty()).ok_or_else(|| format!("Missing {}", flag))
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_wallets(opts: &ParsedArgs) -> Result<Value, String> {
    let store = open_store(opts)?;
    let state = store.state();
    let wallets: Vec<Value> = store
        .sorted_wallets()
        .iter()
        .map(|w| {
            json!({
                "id": w.id,
                "name": w.name,
                "type": w.resolved_kind().as_str(),
                "default": w.is_default,
                "active": state.active_wallet_id.as_deref() == Some(w.id.as_str()),
                "balance": w.metadata.balance,
                "lightning_address": w.metadata.lud16,
            })
        })
        .collect();
    Ok(json!({"wallets": wallets, "total_balance": store.total_balance()}))
}

fn cmd_add_lnbits(opts: &ParsedArgs) -> Result<Value, String> {
    let url = required(&opts.url, "--url")?;
    let wallet_id = required(&opts.wallet_id, "--wallet-id")?;
    let key = required(&opts.key, "--key")?;
    let store = open_store(opts)?;
    block_on(async {
        let wallet = store
            .add_lnbits_wallet(url, wallet_id, key, opts.name.as_deref())
            .await
            .map_err(|e| e.to_string())?;
        info!(id = %wallet.id, "lnbits wallet added");
        Ok(json!({"id": wallet.id, "name": wallet.name, "balance": wallet.metadata.balance}))
    })
}

fn cmd_add_nwc(opts: &ParsedArgs) -> Result<Value, String> {
    let uri = required(&opts.uri, "--uri")?;
    let store = open_store(opts)?;
    block_on(async {
        let wallet = store.add_nwc_wallet(uri, opts.name.as_deref()).await.map_err(|e| e.to_string())?;
        info!(id = %wallet.id, "nwc wallet added");
        Ok(json!({
            "id": wallet.id,
            "name": wallet.name,
            "balance": wallet.metadata.balance,
            "methods": wallet.metadata.methods,
        }))
    })
}

fn cmd_remove(opts: &ParsedArgs) -> Result<Value, String> {
    let id = required(&opts.target, "wallet id")?;
    let store = open_store(opts)?;
    block_on(async {
        store.remove_wallet(id).await.map_err(|e| e.to_string())?;
        Ok(json!({"removed": id}))
    })
}

fn cmd_balance(opts: &ParsedArgs) -> Result<Value, String> {
    let store = open_store(opts)?;
    let id = match opts.target.clone() {
        Some(id) => id,
        None => store.active_wallet().map(|w| w.id).ok_or("No active wallet")?,
    };
    block_on(async {
        let balance = store.refresh_balance(&id).await.map_err(|e| e.to_string())?;
        let outcome = store.auto_withdraw().last_result(&id);
        Ok(json!({"wallet_id": id, "balance": balance.balance, "auto_withdraw": to_value(&outcome)?}))
    })
}

fn cmd_invoice(opts: &ParsedArgs) -> Result<Value, String> {
    let amount: u64 = opts
        .target
        .as_deref()
        .and_then(|v| v.parse().ok())
        .or(opts.amount)
        .ok_or("Missing amount in sats")?;
    let store = open_store(opts)?;
    block_on(async {
        let mut request = CreateInvoiceRequest::new(amount);
        if let Some(memo) = opts.memo.as_deref() {
            request = request.with_description(memo);
        }
        let invoice = store.create_invoice(None, request).await.map_err(|e| e.to_string())?;
        let mut output = to_value(&invoice)?;
        if !opts.watch {
            return Ok(output);
        }

        // Status lines go to stderr so stdout stays one document
        eprintln!("{}", invoice.payment_request);
        let provider = store.connect_wallet(&active_id(&store)?).await.map_err(|e| e.to_string())?;
        let monitor = PaymentMonitor::new(store.config().monitor.clone());
        let mut events = monitor
            .start_with_notifications(WatchedInvoice::from(&invoice), provider)
            .await
            .map_err(|e| e.to_string())?;
        let shutdown = install_signal_handlers();
        let mut stop = shutdown.subscribe();

        let mut last: Option<MonitorEvent> = None;
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    monitor.stop();
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        eprintln!("{}", event.message);
                        let done = event.status.is_terminal();
                        last = Some(event);
                        if done {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        if let Value::Object(map) = &mut output {
            map.insert("monitor".into(), to_value(&last)?);
        }
        Ok(output)
    })
}

fn active_id(store: &WalletStore) -> Result<String, String> {
    store.active_wallet().map(|w| w.id).ok_or_else(|| "No active wallet".to_string())
}

fn cmd_pay(opts: &ParsedArgs) -> Result<Value, String> {
    let destination = required(&opts.target, "destination")?;
    let store = open_store(opts)?;
    block_on(async {
        let payment = store.pay(None, destination, opts.amount).await.map_err(|e| e.to_string())?;
        info!(reference = ?payment.reference(), "payment sent");
        to_value(&payment)
    })
}

fn cmd_parse(opts: &ParsedArgs) -> Result<Value, String> {
    let input = required(&opts.target, "input")?;
    to_value(&parse_payment_destination(input))
}

fn cmd_history(opts: &ParsedArgs) -> Result<Value, String> {
    let store = open_store(opts)?;
    let page = Page::new(opts.limit.unwrap_or(50), 0);
    block_on(async {
        let records = store.transactions(opts.target.as_deref(), page).await.map_err(|e| e.to_string())?;
        if opts.grouped {
            to_value(&group_transactions(&records, &store.config().grouping))
        } else {
            to_value(&records)
        }
    })
}

fn cmd_lookup(opts: &ParsedArgs) -> Result<Value, String> {
    let hash = required(&opts.target, "payment hash")?;
    let store = open_store(opts)?;
    block_on(async {
        let lookup = store.lookup_invoice(None, hash).await.map_err(|e| e.to_string())?;
        to_value(&lookup)
    })
}

fn cmd_auto_withdraw(opts: &ParsedArgs) -> Result<Value, String> {
    let id = required(&opts.target, "wallet id")?;
    let store = open_store(opts)?;
    if store.wallet(id).is_none() {
        return Err(format!("Wallet not found: {}", id));
    }
    let withdraw = store.auto_withdraw();

    if opts.disable {
        withdraw.remove_config(id).map_err(|e| e.to_string())?;
        return Ok(json!({"wallet_id": id, "enabled": false}));
    }

    let threshold = opts.threshold.ok_or("Missing --threshold")?;
    let address = required(&opts.address, "--address")?;
    let config = if opts.onchain {
        let speed = match opts.speed.as_deref().unwrap_or("medium") {
            "low" | "slow" => FeeSpeed::Low,
            "medium" => FeeSpeed::Medium,
            "high" | "fast" => FeeSpeed::High,
            other => return Err(format!("Invalid speed: {}", other)),
        };
        AutoWithdrawConfig::onchain(threshold, address, speed)
    } else {
        AutoWithdrawConfig::lightning(threshold, address)
    };
    withdraw.save_config(id, config).map_err(|e| e.to_string())?;
    to_value(&withdraw.config(id))
}

fn cmd_run(opts: &ParsedArgs) -> Result<Value, String> {
    let store = open_store(opts)?;
    block_on(async {
        let shutdown = install_signal_handlers();
        let poller = BalancePoller::new(store.clone());
        info!(wallets = store.wallets().len(), "polling balances until signal");

        // First pass immediately; the loop then waits one interval between passes
        poller.poll_once().await;
        let handle = poller.spawn(shutdown.subscribe());
        let _ = handle.await;

        Ok(json!({"status": "stopped"}))
    })
}
