// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::caldav::CalendarProvider;
use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::imap::MailProvider;
use crate::modules::ratelimit::SyncRateLimiter;
use crate::modules::store::reader::Snapshot;
use crate::modules::store::schema::MailRecord;
use crate::modules::sync::hints::{drop_hint, HintChannel};
use crate::raise_error;
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub mod calendar;
pub mod send;

pub use calendar::{EventDraft, EventWriteResult};
pub use send::{build_outgoing, BuiltMail, MailSubmitter, OutgoingMail, SmtpSubmitter};

/// What a send would do, returned when the caller has not asserted the
/// confirmation flag. No provider call is made for a preview.
#[derive(Clone, Debug, Serialize)]
pub struct SendPreview {
    pub from_account: String,
    pub to: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub preview: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SendResult {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Mutations never touch the store: every operation goes to the provider
/// and the change is re-observed through sync. After a successful call
/// the router drops a hint file so the daemon pulls the result promptly.
pub struct MutationRouter {
    mail: DashMap<String, Arc<dyn MailProvider>>,
    calendars: DashMap<String, Arc<dyn CalendarProvider>>,
    submitter: Arc<dyn MailSubmitter>,
    limiter: Arc<SyncRateLimiter>,
    data_root: PathBuf,
}

impl MutationRouter {
    pub fn new(
        submitter: Arc<dyn MailSubmitter>,
        limiter: Arc<SyncRateLimiter>,
        data_root: PathBuf,
    ) -> Self {
        Self {
            mail: DashMap::new(),
            calendars: DashMap::new(),
            submitter,
            limiter,
            data_root,
        }
    }

    pub fn register_account(
        &self,
        email: &str,
        mail: Arc<dyn MailProvider>,
        calendar: Arc<dyn CalendarProvider>,
    ) {
        self.mail.insert(email.to_string(), mail);
        self.calendars.insert(email.to_string(), calendar);
    }

    fn mail_provider(&self, account: &str) -> GroundEffectResult<Arc<dyn MailProvider>> {
        self.mail.get(account).map(|p| p.clone()).ok_or_else(|| {
            raise_error!(
                format!("unknown account '{account}'"),
                ErrorCode::UnknownAccount
            )
        })
    }

    fn calendar_provider(&self, account: &str) -> GroundEffectResult<Arc<dyn CalendarProvider>> {
        self.calendars.get(account).map(|p| p.clone()).ok_or_else(|| {
            raise_error!(
                format!("unknown account '{account}'"),
                ErrorCode::UnknownAccount
            )
        })
    }

    /// Returns false when the hint could not be written; the provider call
    /// already succeeded, so the caller reports success with a note.
    fn hint(&self, account: &str, channel: HintChannel) -> bool {
        match drop_hint(&self.data_root, Some(account), Some(channel)) {
            Ok(()) => true,
            Err(e) => {
                warn!(account, "failed to drop mutation hint: {}", e.message());
                false
            }
        }
    }

    /// Send-mail. Without `confirm`, returns the structured preview and
    /// performs no provider call.
    pub async fn send_mail(
        &self,
        mail: OutgoingMail,
        confirm: bool,
    ) -> GroundEffectResult<Result<SendResult, SendPreview>> {
        let built = build_outgoing(&mail)?;
        if !confirm {
            return Ok(Err(SendPreview {
                from_account: mail.from_account,
                to: built.to,
                cc: built.cc,
                bcc: built.bcc,
                subject: built.subject,
                body: mail.body,
                in_reply_to: built.in_reply_to,
                preview: true,
            }));
        }

        self.limiter.acquire(&mail.from_account, 1, None, None).await?;
        let mut recipients = built.to.clone();
        recipients.extend(built.cc.clone());
        recipients.extend(built.bcc.clone());
        self.submitter
            .submit(&mail.from_account, &recipients, built.bytes.clone())
            .await?;
        info!(account = %mail.from_account, message_id = %built.message_id, "mail sent");
        let hinted = self.hint(&mail.from_account, HintChannel::Mail);
        Ok(Ok(SendResult {
            message_id: built.message_id,
            note: (!hinted).then(|| {
                "sent; the local mirror will observe the message on the next sync cycle"
                    .to_string()
            }),
        }))
    }

    fn locate<'a>(
        snapshot: &'a Snapshot,
        account: &str,
        item_id: u64,
    ) -> GroundEffectResult<&'a MailRecord> {
        let record = snapshot.mail(item_id).ok_or_else(|| {
            raise_error!(
                format!("mail item {item_id} not found"),
                ErrorCode::ResourceNotFound
            )
        })?;
        if record.account_id != account {
            return Err(raise_error!(
                format!("mail item {item_id} does not belong to '{account}'"),
                ErrorCode::InvalidParameter
            ));
        }
        Ok(record)
    }

    pub async fn mark_read(
        &self,
        snapshot: &Snapshot,
        account: &str,
        item_id: u64,
    ) -> GroundEffectResult<()> {
        let record = Self::locate(snapshot, account, item_id)?;
        let provider = self.mail_provider(account)?;
        self.limiter.acquire(account, 1, None, None).await?;
        provider
            .add_flags(&record.folder, record.uid, "\\Seen")
            .await?;
        self.hint(account, HintChannel::Mail);
        Ok(())
    }

    pub async fn mark_unread(
        &self,
        snapshot: &Snapshot,
        account: &str,
        item_id: u64,
    ) -> GroundEffectResult<()> {
        let record = Self::locate(snapshot, account, item_id)?;
        let provider = self.mail_provider(account)?;
        self.limiter.acquire(account, 1, None, None).await?;
        provider
            .remove_flags(&record.folder, record.uid, "\\Seen")
            .await?;
        self.hint(account, HintChannel::Mail);
        Ok(())
    }

    /// Gmail archive: move out of INBOX into the archive folder.
    pub async fn archive(
        &self,
        snapshot: &Snapshot,
        account: &str,
        item_id: u64,
    ) -> GroundEffectResult<()> {
        self.move_mail(snapshot, account, item_id, "[Gmail]/All Mail")
            .await
    }

    pub async fn move_mail(
        &self,
        snapshot: &Snapshot,
        account: &str,
        item_id: u64,
        destination: &str,
    ) -> GroundEffectResult<()> {
        let record = Self::locate(snapshot, account, item_id)?;
        let provider = self.mail_provider(account)?;
        self.limiter.acquire(account, 1, None, None).await?;
        provider
            .move_message(&record.folder, record.uid, destination)
            .await?;
        self.hint(account, HintChannel::Mail);
        Ok(())
    }

    pub async fn delete_mail(
        &self,
        snapshot: &Snapshot,
        account: &str,
        item_id: u64,
    ) -> GroundEffectResult<()> {
        let record = Self::locate(snapshot, account, item_id)?;
        let provider = self.mail_provider(account)?;
        self.limiter.acquire(account, 1, None, None).await?;
        provider.delete_message(&record.folder, record.uid).await?;
        self.hint(account, HintChannel::Mail);
        Ok(())
    }

    pub async fn create_event(
        &self,
        account: &str,
        draft: EventDraft,
        confirm: bool,
    ) -> GroundEffectResult<Result<EventWriteResult, EventDraft>> {
        if !confirm {
            return Ok(Err(draft));
        }
        let provider = self.calendar_provider(account)?;
        self.limiter.acquire(account, 1, None, None).await?;
        let result = calendar::create_event(provider.as_ref(), account, draft).await?;
        self.hint(account, HintChannel::Calendar);
        Ok(Ok(result))
    }

    pub async fn update_event(
        &self,
        snapshot: &Snapshot,
        account: &str,
        item_id: u64,
        draft: EventDraft,
        confirm: bool,
    ) -> GroundEffectResult<Result<EventWriteResult, EventDraft>> {
        if !confirm {
            return Ok(Err(draft));
        }
        let record = snapshot.calendar(item_id).ok_or_else(|| {
            raise_error!(
                format!("event {item_id} not found"),
                ErrorCode::ResourceNotFound
            )
        })?;
        if record.account_id != account {
            return Err(raise_error!(
                format!("event {item_id} does not belong to '{account}'"),
                ErrorCode::InvalidParameter
            ));
        }
        let provider = self.calendar_provider(account)?;
        self.limiter.acquire(account, 1, None, None).await?;
        let result = calendar::update_event(provider.as_ref(), record, draft).await?;
        self.hint(account, HintChannel::Calendar);
        Ok(Ok(result))
    }

    pub async fn delete_event(
        &self,
        snapshot: &Snapshot,
        account: &str,
        item_id: u64,
    ) -> GroundEffectResult<()> {
        let record = snapshot.calendar(item_id).ok_or_else(|| {
            raise_error!(
                format!("event {item_id} not found"),
                ErrorCode::ResourceNotFound
            )
        })?;
        let provider = self.calendar_provider(account)?;
        self.limiter.acquire(account, 1, None, None).await?;
        provider
            .delete_event(&record.calendar_id, &record.event_id, Some(&record.etag))
            .await?;
        self.hint(account, HintChannel::Calendar);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::sync::hints::sweep_hints;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSubmitter {
        pub sent: Mutex<Vec<(String, Vec<String>, Vec<u8>)>>,
    }

    #[async_trait]
    impl MailSubmitter for RecordingSubmitter {
        async fn submit(
            &self,
            from_account: &str,
            recipients: &[String],
            message: Vec<u8>,
        ) -> GroundEffectResult<()> {
            self.sent.lock().unwrap().push((
                from_account.to_string(),
                recipients.to_vec(),
                message,
            ));
            Ok(())
        }
    }

    fn router(dir: &TempDir) -> (MutationRouter, Arc<RecordingSubmitter>) {
        let submitter = Arc::new(RecordingSubmitter::default());
        let router = MutationRouter::new(
            submitter.clone(),
            Arc::new(SyncRateLimiter::new(100)),
            dir.path().to_path_buf(),
        );
        (router, submitter)
    }

    fn outgoing() -> OutgoingMail {
        OutgoingMail {
            from_account: "a@x.test".into(),
            to: vec!["c@z.test".into()],
            subject: "Hi".into(),
            body: "hello".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn preview_mode_performs_no_provider_call() {
        let dir = TempDir::new().unwrap();
        let (router, submitter) = router(&dir);
        let outcome = router.send_mail(outgoing(), false).await.unwrap();
        let preview = outcome.unwrap_err();
        assert!(preview.preview);
        assert_eq!(preview.subject, "Hi");
        assert!(submitter.sent.lock().unwrap().is_empty());
        assert!(sweep_hints(dir.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirmed_send_submits_and_drops_a_hint() {
        let dir = TempDir::new().unwrap();
        let (router, submitter) = router(&dir);
        let outcome = router.send_mail(outgoing(), true).await.unwrap();
        let result = outcome.unwrap();
        assert!(result.message_id.contains("@x.test"));

        let sent = submitter.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@x.test");
        assert_eq!(sent[0].1, vec!["c@z.test"]);

        let hints = sweep_hints(dir.path()).unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].account.as_deref(), Some("a@x.test"));
    }
}
