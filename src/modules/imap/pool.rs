// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::{GroundEffectError, GroundEffectResult};
use crate::modules::imap::client::Client;
use crate::modules::imap::session::SessionStream;
use crate::modules::oauth2::TokenRefresher;
use crate::raise_error;
use async_imap::Session;
use bb8::Pool;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Builds authenticated Gmail sessions on demand. The session count is the
/// pool's concern; the manager only knows how to mint one.
#[derive(Clone)]
pub struct ImapConnectionManager {
    pub email: String,
    refresher: Arc<TokenRefresher>,
}

impl ImapConnectionManager {
    pub fn new(email: String, refresher: Arc<TokenRefresher>) -> Self {
        Self { email, refresher }
    }

    pub async fn build(&self) -> GroundEffectResult<Session<Box<dyn SessionStream>>> {
        let tokens = self.refresher.current_tokens(&self.email).await?;
        let client = match Client::connect().await {
            Ok(client) => client,
            Err(e) => {
                error!(account = %self.email, "IMAP connect failed: {:#?}", e);
                return Err(e);
            }
        };
        client.authenticate(&self.email, &tokens.access_token).await
    }
}

impl bb8::ManageConnection for ImapConnectionManager {
    type Connection = Session<Box<dyn SessionStream>>;

    type Error = GroundEffectError;

    async fn connect(&self) -> GroundEffectResult<Self::Connection> {
        self.build().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> GroundEffectResult<()> {
        conn.noop()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::ImapCommandFailed))
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

/// One control channel per account: the pool holds a single session, so
/// command traffic for an account is serialised while IDLE listeners run on
/// their own dedicated connections.
pub async fn build_imap_pool(
    email: String,
    refresher: Arc<TokenRefresher>,
) -> GroundEffectResult<Pool<ImapConnectionManager>> {
    let manager = ImapConnectionManager::new(email, refresher);
    let pool = Pool::builder()
        .connection_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(120))
        .retry_connection(true)
        .max_size(1)
        .test_on_check_out(true)
        .build(manager)
        .await?;
    Ok(pool)
}
