// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::settings::cli::SETTINGS;
use crate::raise_error;
use dashmap::DashMap;
use governor::{
    clock::QuantaClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{
    num::NonZeroU32,
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

pub static RATE_LIMITER: LazyLock<Arc<SyncRateLimiter>> =
    LazyLock::new(|| Arc::new(SyncRateLimiter::new(SETTINGS.groundeffect_global_rate_limit)));

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware>;

/// Requests per second one account may issue, regardless of the global
/// budget. Keeps a single backfilling account from starving the others.
const PER_ACCOUNT_QUOTA: u32 = 5;

/// Backfill is capped at 100 messages per minute across all accounts.
const BACKFILL_PER_MINUTE: u32 = 100;

/// At most this many large body fetches may be in flight at once.
const BODY_FETCHES_IN_FLIGHT: usize = 3;

fn direct(quota: Quota) -> Arc<DirectLimiter> {
    Arc::new(RateLimiter::direct_with_clock(quota, QuantaClock::default()))
}

/// Process-wide provider request budget, shared by every account and task.
///
/// Acquisition order is the global bucket first, then the per-account
/// sub-bucket; both are fair in arrival order. A server-supplied
/// Retry-After suspends the affected account's bucket by pushing its
/// earliest permitted acquisition forward.
pub struct SyncRateLimiter {
    global: Arc<DirectLimiter>,
    per_account: DashMap<String, Arc<DirectLimiter>>,
    backfill: Arc<DirectLimiter>,
    body_fetches: Arc<Semaphore>,
    suspended: DashMap<String, Instant>,
    fifo: Mutex<()>,
}

impl SyncRateLimiter {
    pub fn new(global_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(global_per_second.max(1)).unwrap();
        Self {
            global: direct(Quota::per_second(per_second)),
            per_account: DashMap::new(),
            backfill: direct(Quota::per_minute(
                NonZeroU32::new(BACKFILL_PER_MINUTE).unwrap(),
            )),
            body_fetches: Arc::new(Semaphore::new(BODY_FETCHES_IN_FLIGHT)),
            suspended: DashMap::new(),
            fifo: Mutex::new(()),
        }
    }

    /// Suspends until `n` tokens are available for `account`. `deadline`
    /// bounds the wait; a message on `cancel` abandons it. A cancelled or
    /// timed-out wait consumes no tokens.
    pub async fn acquire(
        &self,
        account: &str,
        n: u32,
        deadline: Option<Instant>,
        mut cancel: Option<&mut broadcast::Receiver<()>>,
    ) -> GroundEffectResult<()> {
        let n = NonZeroU32::new(n.max(1)).unwrap();
        let wait = self.wait_for(account, n);
        tokio::pin!(wait);
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            _ = &mut wait => Ok(()),
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                Err(raise_error!(
                    format!("rate-limit wait for '{account}' exceeded its deadline"),
                    ErrorCode::RequestTimeout
                ))
            }
            _ = async {
                match cancel.as_deref_mut() {
                    Some(rx) => { let _ = rx.recv().await; }
                    None => futures::future::pending().await,
                }
            } => {
                Err(raise_error!(
                    format!("rate-limit wait for '{account}' was cancelled"),
                    ErrorCode::Cancelled
                ))
            }
        }
    }

    async fn wait_for(&self, account: &str, n: NonZeroU32) {
        // A Retry-After suspension only gates the affected account, so it is
        // slept off before joining the shared queue.
        while let Some(until) = self.suspension_for(account) {
            tokio::time::sleep_until(until).await;
        }
        self.suspended.remove(account);
        {
            // Arrival order on the global bucket is preserved by funnelling
            // every waiter through one async mutex.
            let _ticket = self.fifo.lock().await;
            self.global
                .until_n_ready(n)
                .await
                .expect("quota burst below request size");
        }
        let bucket = self.account_bucket(account);
        bucket
            .until_n_ready(n)
            .await
            .expect("quota burst below request size");
    }

    fn account_bucket(&self, account: &str) -> Arc<DirectLimiter> {
        self.per_account
            .entry(account.to_string())
            .or_insert_with(|| {
                direct(Quota::per_second(
                    NonZeroU32::new(PER_ACCOUNT_QUOTA).unwrap(),
                ))
            })
            .value()
            .clone()
    }

    fn suspension_for(&self, account: &str) -> Option<Instant> {
        let until = *self.suspended.get(account)?;
        (until > Instant::now()).then_some(until)
    }

    /// Honours a server Retry-After: no acquisition for `account` succeeds
    /// before `now + retry_after`.
    pub fn honour_retry_after(&self, account: &str, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        self.suspended
            .entry(account.to_string())
            .and_modify(|existing| {
                if until > *existing {
                    *existing = until;
                }
            })
            .or_insert(until);
    }

    /// Permit for a large body fetch; at most three in flight globally.
    pub async fn body_fetch_permit(&self) -> GroundEffectResult<OwnedSemaphorePermit> {
        self.body_fetches
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))
    }

    /// Additional gate for backfill batches, 100 messages/minute shared
    /// across accounts. `count` is the number of messages in the batch.
    pub async fn acquire_backfill(&self, count: u32) {
        let count = NonZeroU32::new(count.clamp(1, BACKFILL_PER_MINUTE)).unwrap();
        self.backfill
            .until_n_ready(count)
            .await
            .expect("quota burst below request size");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquisitions_respect_the_global_budget() {
        let limiter = SyncRateLimiter::new(10);
        let start = std::time::Instant::now();
        for _ in 0..13 {
            limiter.acquire("a@x.test", 1, None, None).await.unwrap();
        }
        // Burst covers the first 10; the remaining 3 must each wait ~100ms.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn retry_after_suspends_the_bucket() {
        let limiter = SyncRateLimiter::new(100);
        limiter.acquire("a@x.test", 1, None, None).await.unwrap();
        limiter.honour_retry_after("a@x.test", Duration::from_millis(300));
        let start = std::time::Instant::now();
        limiter.acquire("a@x.test", 1, None, None).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn deadline_bounds_the_wait() {
        let limiter = SyncRateLimiter::new(100);
        limiter.honour_retry_after("a@x.test", Duration::from_secs(30));
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = limiter
            .acquire("a@x.test", 1, Some(deadline), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RequestTimeout);
    }

    #[tokio::test]
    async fn cancellation_abandons_the_wait() {
        let limiter = SyncRateLimiter::new(100);
        limiter.honour_retry_after("a@x.test", Duration::from_secs(30));
        let (tx, mut rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        let err = limiter
            .acquire("a@x.test", 1, None, Some(&mut rx))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn body_fetch_permits_are_capped() {
        let limiter = SyncRateLimiter::new(100);
        let _a = limiter.body_fetch_permit().await.unwrap();
        let _b = limiter.body_fetch_permit().await.unwrap();
        let _c = limiter.body_fetch_permit().await.unwrap();
        let fourth = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.body_fetch_permit(),
        )
        .await;
        assert!(fourth.is_err());
    }

    #[tokio::test]
    async fn other_accounts_are_not_suspended() {
        let limiter = SyncRateLimiter::new(100);
        limiter.honour_retry_after("a@x.test", Duration::from_secs(30));
        let start = std::time::Instant::now();
        limiter.acquire("b@y.test", 1, None, None).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
