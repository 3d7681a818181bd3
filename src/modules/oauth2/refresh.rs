// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::oauth2::token::{CredentialVault, TokenBundle};
use crate::raise_error;
use crate::utc_now;
use oauth2::{basic::BasicClient, ClientId, ClientSecret, RefreshToken, TokenResponse, TokenUrl};
use std::sync::Arc;
use tracing::{debug, info};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Exchanges a refresh token for a fresh access token and persists the new
/// bundle. A terminal failure here is an auth error: the caller moves the
/// account to NeedsReauth and stops scheduling fetches for it.
pub struct TokenRefresher {
    vault: Arc<dyn CredentialVault>,
}

impl TokenRefresher {
    pub fn new(vault: Arc<dyn CredentialVault>) -> Self {
        Self { vault }
    }

    /// Returns a bundle whose access token is valid for at least the
    /// refresh-ahead window, refreshing through the provider if needed.
    pub async fn current_tokens(&self, email: &str) -> GroundEffectResult<TokenBundle> {
        let bundle = self.vault.load_tokens(email).await?.ok_or_else(|| {
            raise_error!(
                format!("no credentials stored for '{email}'"),
                ErrorCode::MissingRefreshToken
            )
        })?;
        if !bundle.expires_soon() {
            return Ok(bundle);
        }
        debug!(account = %email, "access token near expiry, refreshing");
        self.refresh(bundle).await
    }

    async fn refresh(&self, bundle: TokenBundle) -> GroundEffectResult<TokenBundle> {
        let refresh_token = bundle.refresh_token.clone().ok_or_else(|| {
            raise_error!(
                format!("no refresh token stored for '{}'", bundle.email),
                ErrorCode::MissingRefreshToken
            )
        })?;

        let token_url = TokenUrl::new(GOOGLE_TOKEN_URL.to_string())
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InvalidParameter))?;
        let client = BasicClient::new(ClientId::new(bundle.client_id.clone()))
            .set_client_secret(ClientSecret::new(bundle.client_secret.clone()))
            .set_token_uri(token_url);

        let http_client = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;

        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(&http_client)
            .await
            .map_err(|e| {
                raise_error!(
                    format!(
                        "token refresh for '{}' failed: {}",
                        bundle.email,
                        e.to_string()
                    ),
                    ErrorCode::OAuth2RefreshFailed
                )
            })?;

        let refreshed = TokenBundle {
            access_token: response.access_token().secret().to_owned(),
            refresh_token: Some(
                response
                    .refresh_token()
                    .map(|r| r.secret().to_owned())
                    .unwrap_or(refresh_token),
            ),
            expires_at: utc_now!()
                + response
                    .expires_in()
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(3_600_000),
            ..bundle
        };
        self.vault
            .save_tokens(&refreshed.email, &refreshed)
            .await?;
        info!(account = %refreshed.email, "access token refreshed");
        Ok(refreshed)
    }
}
