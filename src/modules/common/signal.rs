// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::LazyLock;

use crate::modules::{
    common::Initialize, error::GroundEffectResult, utils::shutdown::shutdown_signal,
};
use tokio::sync::broadcast;

pub static SIGNAL_MANAGER: LazyLock<SignalManager> = LazyLock::new(SignalManager::new);

pub struct SignalManager {
    sender: broadcast::Sender<()>,
}

impl SignalManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        SignalManager { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Used by tests and by the daemon's fatal-error path to trigger the
    /// same drain that SIGTERM would.
    pub fn trigger(&self) {
        let _ = self.sender.send(());
    }
}

impl Initialize for SignalManager {
    async fn initialize() -> GroundEffectResult<()> {
        tokio::spawn({
            async move {
                shutdown_signal().await;
                println!("\nSending shutdown signal...");
                SIGNAL_MANAGER.trigger();
            }
        });
        Ok(())
    }
}
