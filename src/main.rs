//! Terminal driver
//!
//! Each stdin line is either a manual scan or a `:command`:
//!
//! ```text
//! :on | :standby | :off     switch capture mode
//! :history [n]              show the most recent scans
//! :stats                    history totals
//! :fields                   current field values
//! :rules                    installed rules in priority order
//! :prefix <id> | :prefix -  activate a prefix / clear the active one
//! :macro <id>               run a stored macro
//! :quit                     exit
//! ```
//!
//! Usage: `scanfill [config.json]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use scanfill::clock::SystemClock;
use scanfill::config::{self, Config};
use scanfill::events::TracingSink;
use scanfill::fields::{FieldCatalog, FieldRegistry, MemoryFieldRegistry};
use scanfill::logging;
use scanfill::storage::{MemorySharedStore, Persistence, SqliteStore};
use scanfill::{Collaborators, ScanRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging(&config::data_dir().join("logs"));

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let config: Config = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config.storage.resolved_database_path();
    let store = SqliteStore::open(&db_path, config.coordinator.namespace.clone())
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let persistence: Arc<dyn Persistence> = Arc::new(store);
    let fields = Arc::new(MemoryFieldRegistry::new(FieldCatalog::load(persistence.clone())));

    let runtime = ScanRuntime::new(
        config,
        Collaborators {
            persistence,
            fields: fields.clone(),
            shared_store: Some(Arc::new(MemorySharedStore::new())),
            channel: None,
            events: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
        },
    )
    .context("Invalid configuration")?;
    runtime.start();

    println!("scanfill ready (mode: {}). Type a scan or :help.", runtime.mode());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix(':') {
            if !run_command(&runtime, fields.as_ref(), command).await {
                break;
            }
        } else {
            submit_scan(&runtime, line).await;
        }
    }

    runtime.shutdown();
    Ok(())
}

/// Returns false when the driver should exit
async fn run_command(runtime: &ScanRuntime, fields: &MemoryFieldRegistry, command: &str) -> bool {
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();

    match name {
        "quit" | "q" => return false,
        "on" | "standby" | "off" => match runtime.set_mode_str(name) {
            Ok(Some(change)) => println!("mode: {} -> {}", change.previous, change.mode),
            Ok(None) => println!("mode already {}", runtime.mode()),
            Err(e) => println!("error: {}", e),
        },
        "history" => {
            let n = arg.and_then(|a| a.parse().ok()).unwrap_or(10);
            for entry in runtime.history().recent(n) {
                println!(
                    "{}  {:<20} {:<12} {}",
                    entry.timestamp,
                    entry.scan,
                    entry.rule_matched.as_deref().unwrap_or("-"),
                    entry.error.as_deref().unwrap_or(&entry.fields_set.join(","))
                );
            }
        }
        "stats" => {
            let stats = runtime.history().stats();
            println!(
                "total {}  ok {}  failed {}  matched {}",
                stats.total, stats.succeeded, stats.failed, stats.matched
            );
        }
        "fields" => {
            for key in fields.keys() {
                println!("{:<16} {}", key, fields.read(&key));
            }
        }
        "rules" => {
            for (i, rule) in runtime.engine().rules().iter().enumerate() {
                let state = if rule.enabled { "" } else { " (disabled)" };
                println!("{:>2}. {} [{:?}] {}{}", i + 1, rule.name, rule.pattern_type, rule.pattern, state);
            }
        }
        "prefix" => match arg {
            Some("-") | None => runtime.prefixes().deactivate_all(),
            Some(id) => {
                if let Err(e) = runtime.prefixes().activate(id) {
                    println!("error: {}", e);
                }
            }
        },
        "macro" => match arg {
            Some(id) => match runtime.run_macro(id).await {
                Ok(report) => println!("macro wrote {} field(s)", report.fields_set.len()),
                Err(e) => println!("error: {}", e),
            },
            None => println!("usage: :macro <id>"),
        },
        _ => println!(
            "commands: :on :standby :off :history [n] :stats :fields :rules :prefix <id|-> :macro <id> :quit"
        ),
    }
    true
}

async fn submit_scan(runtime: &ScanRuntime, scan: &str) {
    let before = runtime.history().latest().map(|e| e.id);
    if let Err(e) = runtime.submit_manual(scan) {
        println!("rejected: {}", e);
        return;
    }

    runtime.process_queue().await;
    // The background worker may have taken the scan instead
    for _ in 0..50 {
        let latest = runtime.history().latest();
        if let Some(entry) = latest.filter(|e| Some(&e.id) != before.as_ref()) {
            match (&entry.rule_matched, &entry.error) {
                (_, Some(error)) => println!("{} failed: {}", entry.scan, error),
                (Some(rule), None) => println!(
                    "{} matched '{}' -> {}",
                    entry.scan,
                    rule,
                    if entry.fields_set.is_empty() {
                        "no changes".to_string()
                    } else {
                        entry.fields_set.join(", ")
                    }
                ),
                (None, None) => println!("{}: no rule matched", entry.scan),
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("{} queued", scan);
}
