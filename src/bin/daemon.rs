// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use groundeffect::modules::account::status::StatusBoard;
use groundeffect::modules::account::discover_accounts;
use groundeffect::modules::caldav::client::{GoogleCalDav, GOOGLE_CALDAV_BASE};
use groundeffect::modules::common::signal::SIGNAL_MANAGER;
use groundeffect::modules::common::Initialize;
use groundeffect::modules::embedder::{Embedder, HttpEmbeddingBackend};
use groundeffect::modules::error::code::ErrorCode;
use groundeffect::modules::error::GroundEffectResult;
use groundeffect::modules::imap::executor::GmailImap;
use groundeffect::modules::imap::pool::{build_imap_pool, ImapConnectionManager};
use groundeffect::modules::logger;
use groundeffect::modules::message::embedding_text;
use groundeffect::modules::oauth2::{CredentialVault, FileVault, TokenRefresher};
use groundeffect::modules::ratelimit::RATE_LIMITER;
use groundeffect::modules::settings::cli::SETTINGS;
use groundeffect::modules::settings::dir::DATA_DIR_MANAGER;
use groundeffect::modules::settings::CONFIG;
use groundeffect::modules::store::reader::StoreReader;
use groundeffect::modules::store::schema::AccountRecord;
use groundeffect::modules::store::writer::{
    spawn_commit_queue, CommitHandle, StoreWriter, WriteOp,
};
use groundeffect::modules::sync::hints::{sweep_hints, HintFile, SyncBus};
use groundeffect::modules::sync::orchestrator::SyncOrchestrator;
use groundeffect::modules::sync::state::SyncStateFile;
use groundeffect::modules::sync::task::FetchQueue;
use groundeffect::modules::sync::workers::FetchWorkers;
use groundeffect::modules::sync::AccountContext;
use groundeffect::groundeffect_version;
use mimalloc::MiMalloc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Local inference server spoken to by the embedding backend.
const EMBEDDING_SERVER_URL: &str = "http://127.0.0.1:8647";

const HINT_SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const REEMBED_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() {
    logger::initialize_logging("daemon", false);
    info!("Starting groundeffect-daemon");
    info!("Version:  {}", groundeffect_version!());

    match run().await {
        Ok(()) => {
            info!("clean shutdown");
        }
        Err(e) => {
            error!("fatal: {}", e.message());
            eprintln!("fatal: {}", e.message());
            let code = if e.code() == ErrorCode::WriterLockHeld { 3 } else { 1 };
            std::process::exit(code);
        }
    }
}

async fn run() -> GroundEffectResult<()> {
    groundeffect::modules::common::signal::SignalManager::initialize().await?;
    groundeffect::modules::settings::dir::DataDirManager::initialize().await?;

    // The writer lock is the daemon's first acquisition; a second daemon
    // learns who holds it and exits.
    let writer = StoreWriter::open(DATA_DIR_MANAGER.store_dir.clone())?;
    let existing_accounts: Vec<AccountRecord> =
        writer.state().accounts.values().cloned().collect();

    let (commits, commit_task) = spawn_commit_queue(
        writer,
        SETTINGS.groundeffect_commit_batch_size,
        Duration::from_secs(SETTINGS.groundeffect_commit_batch_secs),
        SIGNAL_MANAGER.subscribe(),
    );

    let vault: Arc<dyn CredentialVault> =
        Arc::new(FileVault::new(DATA_DIR_MANAGER.tokens_dir.clone()));
    let refresher = Arc::new(TokenRefresher::new(vault.clone()));
    let embedder = Arc::new(Embedder::new(Arc::new(HttpEmbeddingBackend::new(
        EMBEDDING_SERVER_URL,
        CONFIG.search.embedding_model.clone(),
        CONFIG.search.use_metal,
    ))));
    let model_path = DATA_DIR_MANAGER.model_path(&CONFIG.search.embedding_model);
    if !model_path.exists() {
        warn!(
            "embedding model not found at {}; items will be flagged for re-embedding until the \
             inference server has it",
            model_path.display()
        );
    }

    let bus = Arc::new(SyncBus::new());
    let status = Arc::new(StatusBoard::new());
    let queue = Arc::new(FetchQueue::new());
    let contexts = Arc::new(dashmap::DashMap::new());

    let accounts = discover_accounts(&vault, &CONFIG, |email| {
        existing_accounts.iter().find(|a| a.email == email).cloned()
    })
    .await?;
    reconcile_removed_accounts(&commits, &existing_accounts, &accounts).await?;
    info!(count = accounts.len(), "accounts discovered");

    for row in accounts {
        let email = row.email.clone();
        commits
            .submit_and_wait(vec![WriteOp::UpsertAccount(row.clone())])
            .await?;

        let manager = ImapConnectionManager::new(email.clone(), refresher.clone());
        let pool = build_imap_pool(email.clone(), refresher.clone()).await?;
        let mail = Arc::new(GmailImap::new(pool, manager));
        let calendar = Arc::new(GoogleCalDav::new(
            email.clone(),
            GOOGLE_CALDAV_BASE,
            refresher.clone(),
        ));

        let state_path = DATA_DIR_MANAGER.sync_state_path(&email);
        let state = SyncStateFile::load(&state_path, &email)?;
        let ctx = Arc::new(AccountContext::new(
            email.clone(),
            mail,
            calendar,
            embedder.clone(),
            commits.clone(),
            RATE_LIMITER.clone(),
            bus.clone(),
            status.clone(),
            CONFIG.sync.clone(),
            state,
            state_path,
            row,
            DATA_DIR_MANAGER.attachments_dir.clone(),
        ));
        contexts.insert(email.clone(), ctx.clone());
        SyncOrchestrator::spawn(
            ctx,
            queue.clone(),
            refresher.clone(),
            CONFIG.sync.email_idle_enabled,
            SIGNAL_MANAGER.subscribe(),
        );
    }

    let workers = FetchWorkers::spawn(
        queue.clone(),
        contexts.clone(),
        CONFIG.sync.max_concurrent_fetches,
        signal_sender(),
    );

    spawn_hint_sweeper(bus.clone());
    spawn_reembed_pass(commits.clone(), embedder.clone());

    // Park until SIGTERM/ctrl-c; the commit queue drains before the lock
    // is released.
    let mut shutdown = SIGNAL_MANAGER.subscribe();
    let _ = shutdown.recv().await;
    info!("shutdown signal received, draining");
    workers.join().await;
    let _ = commit_task.await;
    Ok(())
}

fn signal_sender() -> tokio::sync::broadcast::Sender<()> {
    // FetchWorkers wants the sender to mint one receiver per worker.
    let (sender, _) = tokio::sync::broadcast::channel(8);
    let mut upstream = SIGNAL_MANAGER.subscribe();
    let downstream = sender.clone();
    tokio::spawn(async move {
        let _ = upstream.recv().await;
        let _ = downstream.send(());
    });
    sender
}

/// A token bundle removed by the operator is an explicit account delete:
/// the row and every item under it go atomically.
async fn reconcile_removed_accounts(
    commits: &CommitHandle,
    existing: &[AccountRecord],
    discovered: &[AccountRecord],
) -> GroundEffectResult<()> {
    for account in existing {
        if !discovered.iter().any(|a| a.email == account.email) {
            warn!(account = %account.email, "credentials removed, deleting account and its items");
            commits
                .submit_and_wait(vec![WriteOp::DeleteAccount {
                    email: account.email.clone(),
                }])
                .await?;
        }
    }
    Ok(())
}

/// Bridges the query server's hint files onto the in-process bus.
fn spawn_hint_sweeper(bus: Arc<SyncBus>) {
    tokio::spawn(async move {
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        let mut interval = tokio::time::interval(HINT_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match sweep_hints(&DATA_DIR_MANAGER.data_root) {
                        Ok(hints) => {
                            for hint in hints {
                                bus.publish(HintFile::into_signal(hint));
                            }
                        }
                        Err(e) => warn!("hint sweep failed: {}", e.message()),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

/// Retries zero-vector rows at low priority until the embedder accepts
/// them.
fn spawn_reembed_pass(commits: CommitHandle, embedder: Arc<Embedder>) {
    tokio::spawn(async move {
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        let mut interval = tokio::time::interval(REEMBED_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = reembed_flagged(&commits, &embedder).await {
                        warn!("re-embed pass failed: {}", e.message());
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}

async fn reembed_flagged(
    commits: &CommitHandle,
    embedder: &Arc<Embedder>,
) -> GroundEffectResult<()> {
    let reader = StoreReader::open(DATA_DIR_MANAGER.store_dir.clone())?;
    let snapshot = reader.snapshot();
    let mut ops = Vec::new();
    for id in snapshot.filter_scan(
        groundeffect::modules::store::reader::Table::Mail,
        &Default::default(),
        usize::MAX,
    ) {
        let Some(record) = snapshot.mail(id) else { continue };
        if !record.needs_embedding {
            continue;
        }
        let mut record = record.clone();
        if let Ok(vector) = embedder.embed(&embedding_text(&record)).await {
            record.embedding = vector;
            record.needs_embedding = false;
            ops.push(WriteOp::UpsertMail(record));
        }
    }
    for id in snapshot.filter_scan(
        groundeffect::modules::store::reader::Table::Calendar,
        &Default::default(),
        usize::MAX,
    ) {
        let Some(record) = snapshot.calendar(id) else { continue };
        if !record.needs_embedding {
            continue;
        }
        let mut record = record.clone();
        if let Ok(vector) = embedder.embed(&record.summary).await {
            record.embedding = vector;
            record.needs_embedding = false;
            ops.push(WriteOp::UpsertCalendar(record));
        }
    }
    if !ops.is_empty() {
        info!(count = ops.len(), "re-embedded flagged items");
        commits.submit(ops).await?;
    }
    Ok(())
}
