use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use smartexam_sync::cache::{Clock, SystemClock};
use smartexam_sync::config;
use smartexam_sync::db;
use smartexam_sync::identity::Session;
use smartexam_sync::jobs;
use smartexam_sync::media::MediaDir;
use smartexam_sync::purchase::PurchaseRecorder;
use smartexam_sync::remote::RestDocumentClient;
use smartexam_sync::store::{LocalStore, SqliteStore};
use smartexam_sync::sync::SyncCoordinator;
use smartexam_sync::trial::TrialStateManager;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Signed-in user id
    #[arg(long, env = "SMARTEXAM_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync purchased packs (cache, then local store, then remote)
    Sync,
    /// Refetch purchased packs from the remote service
    Refresh,
    /// Record a completed purchase and queue its content download
    Purchase {
        #[arg(long)]
        pack: String,
        #[arg(long)]
        transaction: String,
    },
    /// List locally stored purchases
    Packs,
    /// Queue a fresh content download for an already purchased pack
    Resync {
        #[arg(long)]
        pack: String,
    },
    /// Print the questions stored for a pack
    Questions {
        #[arg(long)]
        pack: String,
    },
    /// Run queued content sync jobs
    Worker {
        /// Exit once the queue is empty instead of polling
        #[arg(long)]
        once: bool,
    },
    /// Show the reconciled trial state
    Trial {
        /// Start a trial on this device (terms accepted)
        #[arg(long)]
        start: bool,
        /// Device id the trial is bound to
        #[arg(long, env = "SMARTEXAM_DEVICE_ID")]
        device: Option<String>,
    },
    /// Write a test document to check connectivity
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool));
    let remote = Arc::new(RestDocumentClient::from_config(&cfg)?);
    let session = Arc::new(match args.user.as_deref() {
        Some(user) => Session::signed_in(user),
        None => Session::default(),
    });

    let media = MediaDir::new(cfg.media_root());
    let coordinator = SyncCoordinator::new(
        session.clone(),
        store.clone(),
        remote.clone(),
        cfg.rate_limit_window(),
    )
    .with_media(media.clone());

    match args.command {
        Command::Sync => {
            let count = coordinator.sync_purchased_packs().await?;
            println!("{count} questions available");
        }
        Command::Refresh => {
            let count = coordinator.force_refresh().await?;
            println!("{count} questions available after refresh");
        }
        Command::Purchase { pack, transaction } => {
            let recorder = PurchaseRecorder::new(session.clone(), store.clone(), remote.clone());
            recorder.record_purchase(&pack, &transaction).await?;
            println!("purchase of {pack} recorded; content sync queued");
        }
        Command::Packs => {
            let user = args.user.context("--user or SMARTEXAM_USER is required")?;
            for purchase in store.purchases_for_user(&user).await? {
                println!(
                    "{}\t{}\t{}\tsynced={}",
                    purchase.pack_id,
                    purchase.transaction_id,
                    purchase.purchased_at.to_rfc3339(),
                    purchase.synced
                );
            }
            println!(
                "{} questions stored, {} content jobs queued",
                db::count_content(store.pool()).await?,
                db::count_sync_jobs(store.pool()).await?
            );
        }
        Command::Resync { pack } => {
            let user = args.user.context("--user or SMARTEXAM_USER is required")?;
            if !store.is_pack_purchased(&user, &pack).await? {
                anyhow::bail!("pack {pack} is not purchased by {user}");
            }
            let job_id = store.enqueue_job(&user, &pack).await?;
            println!("content sync for {pack} queued (job {job_id})");
        }
        Command::Questions { pack } => {
            for item in coordinator.questions_for_pack(&pack).await? {
                println!("{}\t{}", item.id, item.question_text);
            }
        }
        Command::Worker { once } => {
            if once {
                let processed =
                    jobs::drain_jobs(remote.as_ref(), store.as_ref(), Some(&media)).await?;
                info!(processed, "job queue drained");
                return Ok(());
            }
            let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
            info!("starting content sync worker");
            loop {
                match jobs::process_next_job(remote.as_ref(), store.as_ref(), Some(&media)).await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(poll_sleep).await,
                    Err(err) => {
                        error!(?err, "content sync worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Command::Trial { start, device } => {
            let trials = TrialStateManager::new(
                session.clone(),
                store.clone(),
                remote.clone(),
                cfg.trial_sync_interval(),
            )
            .with_trial_length(cfg.trial_length());
            let state = if start {
                let device = device
                    .as_deref()
                    .context("--device or SMARTEXAM_DEVICE_ID is required to start a trial")?;
                trials.start_trial(device).await?
            } else {
                trials.get_trial_state().await?
            };
            println!("{}", serde_json::to_string_pretty(&state)?);
            let now = SystemClock.now();
            println!(
                "{}: {} days ({} hours) remaining",
                state.state,
                state.days_remaining(now),
                state.hours_remaining(now)
            );
            if let Some(device) = device.as_deref() {
                let bound = trials.is_device_valid_for_trial(device).await?;
                println!("trial bound to this device: {bound}");
            }
        }
        Command::Ping => {
            let check_id = coordinator.check_connection().await?;
            println!("ok ({check_id})");
        }
    }

    Ok(())
}
