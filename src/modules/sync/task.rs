// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use ahash::AHashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How a mail scan selects UIDs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScanMode {
    /// Priming: last 90 days plus everything unread or flagged.
    RecentWindow,
    /// UIDs above the folder cursor.
    Incremental,
    /// Reverse-chronological batch below the folder cursor.
    Backfill,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FetchTaskKind {
    /// Resolve folders and calendars, detect UID-validity changes, seed
    /// per-folder scans.
    FolderList { mode: ScanMode },
    /// UID selection for one folder.
    MailScan { folder: String, mode: ScanMode },
    /// Fetch and ingest a concrete UID group (envelopes and bodies ride
    /// the same grouped round-trip, capped by group size).
    EnvelopeBatch { folder: String, uids: Vec<u32> },
    /// Download attachment payloads for one ingested message.
    AttachmentFetch {
        folder: String,
        uid: u32,
        gmail_message_id: u64,
    },
    /// sync-collection report for one calendar.
    CalDavDelta { calendar_id: String },
    /// Multiget and ingest changed events.
    CalDavEvent {
        calendar_id: String,
        hrefs: Vec<String>,
    },
}

/// Strict priority within an account: recent-window work beats
/// IDLE-triggered incrementals, which beat backfill, which beats
/// attachment downloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    Recent = 0,
    Incremental = 1,
    Backfill = 2,
    Attachment = 3,
}

pub const PRIORITY_LEVELS: usize = 4;

#[derive(Clone, Debug)]
pub struct FetchTask {
    pub account: String,
    pub kind: FetchTaskKind,
    pub priority: Priority,
    pub deadline: Instant,
    pub attempt: u32,
}

impl FetchTask {
    pub fn new(account: &str, kind: FetchTaskKind, priority: Priority) -> Self {
        Self {
            account: account.to_string(),
            kind,
            priority,
            deadline: Instant::now() + Duration::from_secs(300),
            attempt: 0,
        }
    }
}

#[derive(Default)]
struct QueueState {
    /// Account rotation order; `next` indexes the account served next.
    accounts: Vec<String>,
    next: usize,
    per_account: AHashMap<String, [VecDeque<FetchTask>; PRIORITY_LEVELS]>,
}

/// The fetch work queue: strict priority within an account, round-robin
/// across accounts so no mailbox starves another.
pub struct FetchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, task: FetchTask) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.per_account.contains_key(&task.account) {
                state.accounts.push(task.account.clone());
            }
            let lanes = state.per_account.entry(task.account.clone()).or_default();
            lanes[task.priority as usize].push_back(task);
        }
        self.notify.notify_one();
    }

    /// Drops every queued task for an account (Disabled / NeedsReauth).
    pub fn cancel_account(&self, account: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(lanes) = state.per_account.get_mut(account) {
            for lane in lanes {
                lane.clear();
            }
        }
    }

    fn try_pop(&self) -> Option<FetchTask> {
        let mut state = self.state.lock().unwrap();
        let count = state.accounts.len();
        for offset in 0..count {
            let index = (state.next + offset) % count;
            let account = state.accounts[index].clone();
            if let Some(lanes) = state.per_account.get_mut(&account) {
                for lane in lanes.iter_mut() {
                    if let Some(task) = lane.pop_front() {
                        state.next = (index + 1) % count;
                        return Some(task);
                    }
                }
            }
        }
        None
    }

    pub async fn pop(&self) -> FetchTask {
        loop {
            if let Some(task) = self.try_pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(account: &str, priority: Priority) -> FetchTask {
        FetchTask::new(
            account,
            FetchTaskKind::MailScan {
                folder: "INBOX".into(),
                mode: ScanMode::Incremental,
            },
            priority,
        )
    }

    #[test]
    fn strict_priority_within_an_account() {
        let queue = FetchQueue::new();
        queue.push(task("a@x.test", Priority::Backfill));
        queue.push(task("a@x.test", Priority::Recent));
        queue.push(task("a@x.test", Priority::Attachment));
        queue.push(task("a@x.test", Priority::Incremental));

        let order: Vec<Priority> = (0..4).map(|_| queue.try_pop().unwrap().priority).collect();
        assert_eq!(
            order,
            vec![
                Priority::Recent,
                Priority::Incremental,
                Priority::Backfill,
                Priority::Attachment
            ]
        );
    }

    #[test]
    fn round_robin_across_accounts() {
        let queue = FetchQueue::new();
        for _ in 0..2 {
            queue.push(task("a@x.test", Priority::Recent));
            queue.push(task("b@y.test", Priority::Recent));
        }
        let order: Vec<String> = (0..4).map(|_| queue.try_pop().unwrap().account).collect();
        assert_eq!(order, vec!["a@x.test", "b@y.test", "a@x.test", "b@y.test"]);
    }

    #[test]
    fn backfill_for_one_account_does_not_block_recent_for_another() {
        let queue = FetchQueue::new();
        for _ in 0..5 {
            queue.push(task("a@x.test", Priority::Backfill));
        }
        queue.push(task("b@y.test", Priority::Recent));
        // b's task surfaces within the first rotation.
        let first_two: Vec<String> = (0..2).map(|_| queue.try_pop().unwrap().account).collect();
        assert!(first_two.contains(&"b@y.test".to_string()));
    }

    #[test]
    fn cancelled_accounts_are_drained() {
        let queue = FetchQueue::new();
        queue.push(task("a@x.test", Priority::Recent));
        queue.push(task("b@y.test", Priority::Recent));
        queue.cancel_account("a@x.test");
        assert_eq!(queue.try_pop().unwrap().account, "b@y.test");
        assert!(queue.try_pop().is_none());
    }
}
