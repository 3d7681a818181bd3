// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use groundeffect::modules::caldav::client::{GoogleCalDav, GOOGLE_CALDAV_BASE};
use groundeffect::modules::common::Initialize;
use groundeffect::modules::embedder::{Embedder, HttpEmbeddingBackend};
use groundeffect::modules::imap::executor::GmailImap;
use groundeffect::modules::imap::pool::{build_imap_pool, ImapConnectionManager};
use groundeffect::modules::logger;
use groundeffect::modules::mutation::{MutationRouter, SmtpSubmitter};
use groundeffect::modules::oauth2::{CredentialVault, FileVault, TokenRefresher};
use groundeffect::modules::ratelimit::RATE_LIMITER;
use groundeffect::modules::rpc::{serve, ToolContext};
use groundeffect::modules::settings::dir::DATA_DIR_MANAGER;
use groundeffect::modules::settings::CONFIG;
use groundeffect::modules::store::reader::StoreReader;
use groundeffect::{groundeffect_version, modules::error::GroundEffectResult};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Local inference server spoken to by the embedding backend.
const EMBEDDING_SERVER_URL: &str = "http://127.0.0.1:8647";

/// Short-lived read-only query server, one per external-host session.
/// Stdout belongs to the tool protocol, so logs always go to file.
#[tokio::main]
async fn main() {
    logger::initialize_logging("mcp", true);
    info!("Starting groundeffect-query {}", groundeffect_version!());

    if let Err(e) = run().await {
        error!("fatal: {}", e.message());
        eprintln!("fatal: {}", e.message());
        std::process::exit(1);
    }
}

async fn run() -> GroundEffectResult<()> {
    groundeffect::modules::settings::dir::DataDirManager::initialize().await?;

    let reader = StoreReader::open(DATA_DIR_MANAGER.store_dir.clone())?;
    let vault: Arc<dyn CredentialVault> =
        Arc::new(FileVault::new(DATA_DIR_MANAGER.tokens_dir.clone()));
    let refresher = Arc::new(TokenRefresher::new(vault));
    let embedder = Arc::new(Embedder::new(Arc::new(HttpEmbeddingBackend::new(
        EMBEDDING_SERVER_URL,
        CONFIG.search.embedding_model.clone(),
        CONFIG.search.use_metal,
    ))));

    let router = Arc::new(MutationRouter::new(
        Arc::new(SmtpSubmitter::new(refresher.clone())),
        RATE_LIMITER.clone(),
        DATA_DIR_MANAGER.data_root.clone(),
    ));

    // Mutations go straight to the provider; register a client pair for
    // every account the store knows about.
    let snapshot = reader.snapshot();
    for account in snapshot.accounts() {
        let email = account.email.clone();
        match build_imap_pool(email.clone(), refresher.clone()).await {
            Ok(pool) => {
                let manager = ImapConnectionManager::new(email.clone(), refresher.clone());
                router.register_account(
                    &email,
                    Arc::new(GmailImap::new(pool, manager)),
                    Arc::new(GoogleCalDav::new(
                        email.clone(),
                        GOOGLE_CALDAV_BASE,
                        refresher.clone(),
                    )),
                );
            }
            Err(e) => {
                warn!(account = %email, "mutation client unavailable: {}", e.message());
            }
        }
    }
    drop(snapshot);

    let ctx = ToolContext::new(
        reader,
        CONFIG.clone(),
        embedder,
        router,
        DATA_DIR_MANAGER.data_root.clone(),
    );
    serve(ctx)
        .await
        .map_err(groundeffect::modules::error::GroundEffectError::from)
}
