mod config;
mod tracing_setup;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use herald_core::constants::{kinds, store_keys};
use herald_core::keys::PreviewKey;
use herald_core::ledger::{Job, JobKind};
use herald_core::signer::parse_public_key;
use herald_core::storage::LocalStoreExt;
use herald_core::{
    CoreConfig, KeyBootstrap, LedgerHandle, LedgerSync, LedgerView, MailboxKeys, SchedulerClient,
    Session, SessionSigner, SubmitReceipt,
};
use nostr_sdk::prelude::{EventId, Filter, Kind};

use crate::config::CliConfig;

/// How long submissions wait for the scheduler's answer with `--wait`
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Schedule notes, reposts and DMs through a Herald scheduler")]
struct Cli {
    /// Path to JSON config file (dataDir, credentials)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Data directory; defaults to the platform data dir
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Relay URL, can be given several times; replaces the configured relays
    #[arg(long = "relay")]
    relays: Vec<String>,

    /// Scheduler public key (hex or npub)
    #[arg(long)]
    scheduler: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain the mailbox keys from the scheduler
    Bootstrap,

    /// Show pending jobs once the ledger has synced
    Jobs {
        /// Seconds to wait for the ledger to converge
        #[arg(long, default_value_t = 15)]
        wait: u64,
        /// Load every pending page, not just the first
        #[arg(long)]
        all: bool,
    },

    /// Show finished jobs
    History {
        /// Extra history batches to load beyond the recent bucket
        #[arg(long, default_value_t = 0)]
        more: usize,
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },

    /// Schedule a text note
    Post {
        content: String,
        /// RFC 3339 time, unix seconds, or an offset like +30m / +2h / +1d
        #[arg(long)]
        at: String,
        /// Wait for the scheduler to acknowledge
        #[arg(long)]
        wait: bool,
    },

    /// Schedule a repost of an existing event
    Repost {
        /// Event id (hex or note1)
        event_id: String,
        #[arg(long)]
        at: String,
        #[arg(long)]
        wait: bool,
    },

    /// Schedule a private message
    Dm {
        /// Recipient public key (hex or npub)
        recipient: String,
        message: String,
        #[arg(long)]
        at: String,
        #[arg(long)]
        wait: bool,
    },

    /// Cancel a scheduled job
    Cancel {
        job_id: String,
        #[arg(long)]
        wait: bool,
    },

    /// Retry a failed job
    Retry {
        job_id: String,
        #[arg(long)]
        wait: bool,
    },

    /// Ask the scheduler to rebuild this mailbox
    Repair {
        #[arg(long)]
        wait: bool,
    },

    /// Query the relays and print their health
    Relays,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_setup::init_tracing();
    let cli = Cli::parse();

    let cli_config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => {
            let dir = cli.data_dir.clone().unwrap_or_else(CoreConfig::default_data_dir);
            CliConfig::load_optional(&dir.join("cli.json"))?
        }
    };
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| cli_config.data_dir.clone())
        .unwrap_or_else(CoreConfig::default_data_dir);

    let mut core = CoreConfig::load_from_data_dir(&data_dir)?;
    if !cli.relays.is_empty() {
        core.relays = cli.relays.clone();
    }
    if let Some(scheduler) = &cli.scheduler {
        core.scheduler_pubkey = Some(scheduler.clone());
    }

    let credentials = cli_config.credentials.clone().unwrap_or_default();
    let identity = credentials.identity(core.signer.clone()).await?;
    let session = Session::open(core, identity).context("Failed to open session")?;

    match cli.command {
        Commands::Bootstrap => {
            let keys = mailbox_keys(&session).await?;
            println!("mailbox {}", keys.mailbox_id);
        }
        Commands::Jobs { wait, all } => {
            let keys = mailbox_keys(&session).await?;
            let ledger = LedgerSync::start(session.clone(), keys);
            let mut view = converge(&ledger, wait).await;
            if all {
                while view.snapshot.has_more_pending {
                    let before = view.snapshot.pending.len();
                    ledger.load_more_pending();
                    match ledger
                        .wait_until(Duration::from_secs(wait), |v| {
                            v.snapshot.pending.len() != before || !v.snapshot.has_more_pending
                        })
                        .await
                    {
                        Some(next) => view = next,
                        None => break,
                    }
                }
            }
            let preview_key = cached_preview_key(&session);
            print_jobs(&view.snapshot.pending, preview_key.as_ref());
            if view.snapshot.has_more_pending {
                println!("(more pending pages; use --all)");
            }
            ledger.close().await;
        }
        Commands::History { more, wait } => {
            let keys = mailbox_keys(&session).await?;
            let ledger = LedgerSync::start(session.clone(), keys);
            let mut view = converge(&ledger, wait).await;
            for _ in 0..more {
                let before = view.snapshot.history.len();
                if !ledger.load_more_history().await && !view.snapshot.has_more_history {
                    break;
                }
                if let Some(next) = ledger
                    .wait_until(Duration::from_secs(wait), |v| v.snapshot.history.len() > before)
                    .await
                {
                    view = next;
                }
            }
            let preview_key = cached_preview_key(&session);
            print_jobs(&view.snapshot.history, preview_key.as_ref());
            if view.snapshot.has_more_history {
                println!("(older history available; use --more)");
            }
            ledger.close().await;
        }
        Commands::Post { content, at, wait } => {
            let client = client(&session).await?;
            let receipt = client.post_note(&content, parse_when(&at)?).await?;
            report(&client, receipt, wait).await?;
        }
        Commands::Repost { event_id, at, wait } => {
            let target = EventId::parse(&event_id).context("Invalid event id")?;
            let client = client(&session).await?;
            let receipt = client.repost_by_id(target, parse_when(&at)?).await?;
            report(&client, receipt, wait).await?;
        }
        Commands::Dm {
            recipient,
            message,
            at,
            wait,
        } => {
            let recipient = parse_public_key(&recipient).context("Invalid recipient")?;
            let scheduled_at = parse_when(&at)?;
            let keys = mailbox_keys(&session).await?;
            // Capsules for the preview key live in the ledger index.
            let ledger = LedgerSync::start(session.clone(), keys.clone());
            let view = converge(&ledger, 15).await;
            ledger.close().await;

            let client = SchedulerClient::new(session.clone(), signer(&session)?, keys);
            let preview_key = client
                .resolve_preview_key(&view.snapshot.preview_key_capsules)
                .await?;
            let receipt = client
                .submit_dm(recipient, &message, scheduled_at, &preview_key)
                .await?;
            report(&client, receipt, wait).await?;
        }
        Commands::Cancel { job_id, wait } => {
            let client = client(&session).await?;
            let receipt = client.cancel(&job_id).await?;
            report(&client, receipt, wait).await?;
        }
        Commands::Retry { job_id, wait } => {
            let client = client(&session).await?;
            let receipt = client.retry(&job_id).await?;
            report(&client, receipt, wait).await?;
        }
        Commands::Repair { wait } => {
            let client = client(&session).await?;
            let receipt = client.repair().await?;
            report(&client, receipt, wait).await?;
        }
        Commands::Relays => {
            let sample = Filter::new()
                .kind(Kind::from(kinds::LEDGER_RECORD))
                .author(session.scheduler())
                .limit(1);
            session.pool().fetch_once(session.relays(), sample).await;
            let health = session.pool().health_snapshot();
            for url in session.pool().rank(session.relays()) {
                let entry = health.iter().find(|(u, _)| *u == url).map(|(_, h)| h.clone());
                match entry {
                    Some(h) => println!(
                        "{:<40} ok {:>3}  failed {:>3}  latency {}",
                        url,
                        h.success_count,
                        h.failure_count,
                        h.smoothed_latency
                            .map(|l| format!("{}ms", l.as_millis()))
                            .unwrap_or_else(|| "-".into())
                    ),
                    None => println!("{:<40} not contacted", url),
                }
            }
        }
    }
    Ok(())
}

fn signer(session: &Session) -> Result<SessionSigner> {
    match session.signer() {
        Some(signer) => Ok(signer.clone()),
        None => bail!("This command needs signing credentials; the session is read-only"),
    }
}

/// Cached keys when available, otherwise a full bootstrap (needs a signer).
async fn mailbox_keys(session: &Session) -> Result<MailboxKeys> {
    let bootstrap = KeyBootstrap::new(session.clone());
    if let Some(keys) = bootstrap.cached() {
        return Ok(keys);
    }
    let signer = signer(session).context("No cached mailbox keys")?;
    bootstrap.run(&signer).await.context("Key bootstrap failed")
}

async fn client(session: &Session) -> Result<SchedulerClient> {
    let keys = mailbox_keys(session).await?;
    Ok(SchedulerClient::new(session.clone(), signer(session)?, keys))
}

/// Wait for the ledger; on timeout report progress and carry on with the last
/// committed snapshot.
async fn converge(ledger: &LedgerHandle, wait: u64) -> LedgerView {
    match ledger.wait_for_complete(Duration::from_secs(wait)).await {
        Some(view) => view,
        None => {
            let view = ledger.view();
            if view.still_syncing || view.missing > 0 {
                eprintln!("still syncing, {} page(s) missing", view.missing);
            } else {
                eprintln!("ledger not confirmed by any relay yet");
            }
            view
        }
    }
}

async fn report(client: &SchedulerClient, receipt: SubmitReceipt, wait: bool) -> Result<()> {
    match &receipt.job_id {
        Some(job) => println!("job {} sent in {}", job, receipt.wrap_id),
        None => println!("request sent in {}", receipt.wrap_id),
    }
    if wait {
        let response = client.wait_for_response(&receipt, RESPONSE_TIMEOUT).await?;
        println!("acknowledged: {:?}", response);
    }
    Ok(())
}

fn cached_preview_key(session: &Session) -> Option<PreviewKey> {
    let hex: String = session
        .store()
        .get_as(&store_keys::preview_key(&session.user().to_hex()))?;
    PreviewKey::from_hex(&hex).ok()
}

fn print_jobs(jobs: &[Job], preview_key: Option<&PreviewKey>) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    for job in jobs {
        let when = DateTime::<Utc>::from_timestamp(job.scheduled_at as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| job.scheduled_at.to_string());
        let what = match &job.kind {
            JobKind::Note { summary } => summary.clone().unwrap_or_else(|| "(note)".into()),
            JobKind::Repost { target_id } => format!("repost {}", target_id),
            JobKind::Dm { recipient, preview } => {
                let text = preview
                    .as_deref()
                    .zip(preview_key)
                    .and_then(|(sealed, key)| key.open(sealed).ok())
                    .unwrap_or_else(|| "…".into());
                format!("dm to {}: {}", recipient, text)
            }
        };
        let status = match &job.status_detail {
            Some(detail) => format!("{:?} ({})", job.status, detail),
            None => format!("{:?}", job.status),
        };
        println!("{}  {:<24} {}  {}", when, status, job.id, what);
    }
}

/// RFC 3339, unix seconds, or `+<n><m|h|d>` from now.
fn parse_when(value: &str) -> Result<u64> {
    if let Some(offset) = value.strip_prefix('+') {
        let Some((unit_at, _)) = offset.char_indices().last() else {
            bail!("Empty offset: {}", value);
        };
        let (digits, unit) = offset.split_at(unit_at);
        let n: u64 = digits
            .parse()
            .with_context(|| format!("Invalid offset: {}", value))?;
        let secs = match unit {
            "m" => n * 60,
            "h" => n * 3_600,
            "d" => n * 86_400,
            _ => bail!("Offset unit must be m, h or d: {}", value),
        };
        return Ok(Utc::now().timestamp() as u64 + secs);
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid time: {}", value))?;
    Ok(parsed.timestamp() as u64)
}
