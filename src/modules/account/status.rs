// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::utc_now;
use dashmap::DashMap;
use serde::Serialize;

const ERROR_COUNT_PER_ACCOUNT: usize = 20;

/// Daemon-side running state per account: the current sync phase, priming
/// progress, and a bounded ring of recent errors. This never leaves the
/// writer process; durable status lives on the account row in the store.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunningState {
    pub phase: String,
    pub priming_folder: Option<String>,
    pub priming_batch: Option<(u32, u32)>,
    pub last_email_sync_start: Option<i64>,
    pub last_calendar_sync_start: Option<i64>,
    pub errors: Vec<AccountError>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AccountError {
    pub error: String,
    pub at: i64,
}

#[derive(Default)]
pub struct StatusBoard {
    states: DashMap<String, RunningState>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, email: &str, phase: &str) {
        self.states.entry(email.to_string()).or_default().phase = phase.to_string();
    }

    pub fn set_priming_progress(&self, email: &str, folder: &str, batch: u32, total: u32) {
        let mut state = self.states.entry(email.to_string()).or_default();
        state.priming_folder = Some(folder.to_string());
        state.priming_batch = Some((batch, total));
    }

    pub fn mark_email_sync_start(&self, email: &str) {
        self.states
            .entry(email.to_string())
            .or_default()
            .last_email_sync_start = Some(utc_now!());
    }

    pub fn mark_calendar_sync_start(&self, email: &str) {
        self.states
            .entry(email.to_string())
            .or_default()
            .last_calendar_sync_start = Some(utc_now!());
    }

    pub fn append_error(&self, email: &str, error: String) {
        let mut state = self.states.entry(email.to_string()).or_default();
        state.errors.push(AccountError {
            error,
            at: utc_now!(),
        });
        if state.errors.len() > ERROR_COUNT_PER_ACCOUNT {
            let excess = state.errors.len() - ERROR_COUNT_PER_ACCOUNT;
            state.errors.drain(..excess);
        }
    }

    pub fn get(&self, email: &str) -> Option<RunningState> {
        self.states.get(email).map(|s| s.clone())
    }

    pub fn remove(&self, email: &str) {
        self.states.remove(email);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_is_bounded() {
        let board = StatusBoard::new();
        for i in 0..30 {
            board.append_error("a@x.test", format!("error {i}"));
        }
        let state = board.get("a@x.test").unwrap();
        assert_eq!(state.errors.len(), ERROR_COUNT_PER_ACCOUNT);
        assert_eq!(state.errors.last().unwrap().error, "error 29");
        assert_eq!(state.errors.first().unwrap().error, "error 10");
    }
}
