//! scanq CLI: operator interface to the local scan queue.

use clap::{Parser, Subcommand};
use scanq::config::Config;
use scanq::connectivity::OfflineFlag;
use scanq::engine::{Gated, Queue, QueueDeps, Scanned};
use scanq::event::{ChannelNotifier, Notification, QueueEvent};
use scanq::model::{State, WorkItem};
use scanq::storage::SqliteStore;
use scanq::telemetry::{TelemetryConfig, init_telemetry};
use scanq::transport::{HttpTransport, Transport, Unconfigured};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scanq", about = "Durable offline scan queue")]
struct Cli {
    /// Start with the device forced offline
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show queue counters
    Status,
    /// List work items
    List {
        /// Filter by state (queued, processing, done, failed)
        #[arg(long)]
        state: Option<String>,
    },
    /// Show a work item
    Show {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// Record one or more scans
    Scan {
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Submit everything queued, including retry rounds
    Process,
    /// Remove every unfinished item
    Clear,
    /// Interactive session: scan codes read from stdin
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let telemetry = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "scanq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let (notifier, notifications) = ChannelNotifier::new();
    let deps = deps_from(&config, cli.offline)?.notifier(Arc::new(notifier));
    let store = SqliteStore::open(&config.db_path)?;
    let (queue, report) = Queue::start(Box::new(store), deps, config.tuning.clone())?;
    if report.changed() {
        eprintln!(
            "Recovered {} interrupted item(s), {} failed.",
            report.released, report.failed
        );
    }

    let printer = tokio::spawn(print_notifications(notifications));

    let result = match cli.command {
        Command::Status => cmd_status(&queue),
        Command::List { state } => cmd_list(&queue, state),
        Command::Show { id } => cmd_show(&queue, &id),
        Command::Scan { codes } => cmd_scan(&queue, &codes).await,
        Command::Process => cmd_process(&queue).await,
        Command::Clear => cmd_clear(&queue),
        Command::Run => cmd_run(&queue).await,
    };

    queue.shutdown();
    // Dropping the last handle closes the notification channel.
    drop(queue);
    let _ = printer.await;
    telemetry.force_flush();
    result
}

fn deps_from(config: &Config, force_offline: bool) -> anyhow::Result<QueueDeps> {
    let (transport, offline): (Arc<dyn Transport>, bool) = match config.endpoint {
        Some(ref endpoint) => {
            let http = HttpTransport::new(
                endpoint.clone(),
                config.api_token.clone(),
                config.tuning.submit_timeout,
            )?;
            info!(endpoint = http.endpoint(), "submitting scans over http");
            (Arc::new(http), force_offline)
        }
        None => {
            warn!("SCANQ_ENDPOINT not set, running offline");
            (Arc::new(Unconfigured), true)
        }
    };
    Ok(QueueDeps::new(transport).offline(Arc::new(OfflineFlag::new(offline))))
}

async fn print_notifications(mut rx: tokio::sync::mpsc::UnboundedReceiver<Notification>) {
    while let Some(n) = rx.recv().await {
        let what = match n.event {
            QueueEvent::ScanQueued { code, .. } => format!("queued {code}"),
            QueueEvent::ScanDone { code, .. } => format!("sent {code}"),
            QueueEvent::BatchResult(r) => format!(
                "round {}: {} of {} sent, {} failed, {} will retry",
                r.round,
                r.succeeded,
                r.attempted(),
                r.failed,
                r.requeued
            ),
            QueueEvent::Reconciled { .. } => continue,
            QueueEvent::LeaseExpired { id, retry_count } => {
                format!("{id} timed out (retry {retry_count})")
            }
            QueueEvent::Cleared { removed } => format!("cleared {removed} item(s)"),
        };
        println!("{what}  [{}]", n.counts);
    }
}

fn report_rejection<T>(gated: Gated<T>) -> Option<T> {
    match gated {
        Gated::Accepted(v) => Some(v),
        Gated::Rejected(r) => {
            eprintln!("Ignored: {r}");
            None
        }
    }
}

fn cmd_status(queue: &Queue) -> anyhow::Result<()> {
    let counts = queue.refresh_counts()?;
    println!("Queued:      {}", counts.queued);
    println!("Processing:  {}", counts.processing);
    println!("Done today:  {}", counts.done_today);
    println!("Offline:     {}", queue.is_offline());
    Ok(())
}

fn cmd_list(queue: &Queue, state: Option<String>) -> anyhow::Result<()> {
    let state_filter: Option<State> = match state {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };

    let items = queue.list(state_filter)?;
    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<24}  {:<10}  {:<7}  {:<5}  CREATED",
        "ID", "CODE", "STATE", "MODE", "TRIES"
    );
    println!("{}", "-".repeat(80));
    for item in &items {
        println!(
            "{:<8}  {:<24}  {:<10}  {:<7}  {:<5}  {}",
            item.id,
            truncate(&item.code, 24),
            item.state,
            item.mode,
            item.retry_count,
            item.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} item(s)", items.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn cmd_show(queue: &Queue, id_str: &str) -> anyhow::Result<()> {
    let item = find_by_prefix(queue, id_str)?;

    println!("ID:          {}", item.id.0);
    println!("Code:        {}", item.code);
    println!("Mode:        {}", item.mode);
    println!("State:       {}", item.state);
    println!("Retries:     {}", item.retry_count);
    println!("Created:     {}", item.created_at);
    if let Some(lease) = item.lease_id {
        println!("Lease:       {}", lease.0);
    }
    if let Some(started) = item.lease_started_at {
        println!("Leased At:   {started}");
    }
    if let Some(completed) = item.completed_at {
        println!("Completed:   {completed}");
    }
    if let Some(ref err) = item.last_error {
        println!("Last Error:  {err}");
    }
    Ok(())
}

fn find_by_prefix(queue: &Queue, id_str: &str) -> anyhow::Result<WorkItem> {
    let items = queue.list(None)?;
    let matches: Vec<&WorkItem> = items
        .iter()
        .filter(|item| item.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no work item matching '{id_str}'"),
        [item] => Ok((*item).clone()),
        many => anyhow::bail!("{} work items match '{id_str}', be more specific", many.len()),
    }
}

async fn cmd_scan(queue: &Queue, codes: &[String]) -> anyhow::Result<()> {
    for code in codes {
        if let Some(Scanned { id, state }) = report_rejection(queue.scan(code).await?) {
            println!("{id}  {code}  {state}");
        }
        // Keep consecutive scans outside the debounce window.
        tokio::time::sleep(queue.tuning().debounce).await;
    }
    Ok(())
}

async fn cmd_process(queue: &Queue) -> anyhow::Result<()> {
    if report_rejection(queue.process_queue().await?).is_some() {
        queue.wait_idle().await;
    }
    let counts = queue.counts();
    println!("Queued: {}  Done today: {}", counts.queued, counts.done_today);
    Ok(())
}

fn cmd_clear(queue: &Queue) -> anyhow::Result<()> {
    if let Some(removed) = report_rejection(queue.clear_queue()?) {
        println!("Removed {removed} item(s).");
    }
    Ok(())
}

async fn cmd_run(queue: &Queue) -> anyhow::Result<()> {
    eprintln!("Scan codes, one per line. Commands: :process :clear :offline :online :status :quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" | ":q" => break,
            ":process" => {
                report_rejection(queue.process_queue().await?);
            }
            ":clear" => {
                report_rejection(queue.clear_queue()?);
            }
            ":offline" => {
                report_rejection(queue.set_offline(true)?);
            }
            ":online" => {
                report_rejection(queue.set_offline(false)?);
            }
            ":status" => cmd_status(queue)?,
            code => {
                report_rejection(queue.scan(code).await?);
            }
        }
    }

    queue.wait_idle().await;
    Ok(())
}
