// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::caldav::ical::parse_calendar_objects;
use crate::modules::caldav::{event_id_from_href, CalendarObject};
use crate::modules::error::GroundEffectResult;
use crate::modules::imap::RawMessage;
use crate::modules::message::{build_mail_record, embedding_text};
use crate::modules::store::schema::CalendarRecord;
use crate::modules::store::writer::WriteOp;
use crate::modules::sync::AccountContext;
use crate::utc_now;
use mail_parser::MessageParser;
use tracing::{debug, info, warn};

/// Outcome of one ingested message, enough for the worker to plan
/// follow-up attachment downloads.
#[derive(Clone, Debug)]
pub struct IngestedMail {
    pub uid: u32,
    pub gmail_message_id: u64,
    pub has_attachments: bool,
}

/// normalise -> extract text -> snippet -> embed -> commit, for one
/// fetched UID group. Poison payloads are quarantined in the sync state
/// and skipped forever; the rest of the batch proceeds.
pub async fn ingest_mail_batch(
    ctx: &AccountContext,
    folder: &str,
    raws: Vec<RawMessage>,
) -> GroundEffectResult<Vec<IngestedMail>> {
    if raws.is_empty() {
        return Ok(Vec::new());
    }
    let uid_validity = raws[0].uid_validity;
    let cap = ctx.sync_config.body_truncation_chars;

    let mut ops: Vec<WriteOp> = Vec::with_capacity(raws.len() + 1);
    let mut ingested: Vec<IngestedMail> = Vec::new();
    let mut observed: Vec<u32> = Vec::new();

    for raw in &raws {
        {
            let state = ctx.state.lock().await;
            if state.is_poisoned(folder, raw.uid) {
                continue;
            }
        }
        match build_mail_record(&ctx.email, folder, raw, cap) {
            Ok(mut record) => {
                let (embedding, needs_embedding) =
                    ctx.embedder.embed_or_flag(&embedding_text(&record)).await;
                record.embedding = embedding;
                record.needs_embedding = needs_embedding;
                observed.push(raw.uid);
                ingested.push(IngestedMail {
                    uid: raw.uid,
                    gmail_message_id: record.gmail_message_id,
                    has_attachments: !record.attachments.is_empty(),
                });
                ops.push(WriteOp::UpsertMail(record));
            }
            Err(e) if e.code().is_poison() => {
                warn!(
                    account = %ctx.email,
                    folder,
                    uid = raw.uid,
                    "quarantining malformed message: {}",
                    e.message()
                );
                let mut state = ctx.state.lock().await;
                state.poison_uid(folder, raw.uid);
            }
            Err(e) => return Err(e),
        }
    }

    if ops.is_empty() {
        return Ok(ingested);
    }

    let now = utc_now!();
    {
        let mut row = ctx.account_row.lock().await;
        row.last_email_sync = Some(now);
        ops.push(WriteOp::UpsertAccount(row.clone()));
    }

    ctx.commits.submit_and_wait(ops).await?;
    {
        let mut state = ctx.state.lock().await;
        state.observe_uids(folder, uid_validity, &observed);
        state.last_email_sync = Some(now);
    }
    ctx.save_state().await?;
    ctx.mark_committed();
    debug!(
        account = %ctx.email,
        folder,
        count = observed.len(),
        "mail batch committed"
    );
    Ok(ingested)
}

/// Applies one calendar delta: multiget results become upserts, removals
/// become deletes, and the new sync token is durably recorded only after
/// the commit lands.
pub async fn ingest_calendar_batch(
    ctx: &AccountContext,
    calendar_id: &str,
    objects: Vec<CalendarObject>,
    deleted_hrefs: Vec<String>,
    sync_token: Option<String>,
) -> GroundEffectResult<usize> {
    let mut ops: Vec<WriteOp> = Vec::new();
    let mut count = 0usize;

    for object in objects {
        let event_id = event_id_from_href(&object.href);
        {
            let state = ctx.state.lock().await;
            if state.poison_events.contains(&object.href) {
                continue;
            }
        }
        match parse_calendar_objects(&ctx.email, calendar_id, &event_id, &object.etag, &object.ical)
        {
            Ok(records) => {
                for mut record in records {
                    let (embedding, needs_embedding) = ctx
                        .embedder
                        .embed_or_flag(&calendar_embedding_text(&record))
                        .await;
                    record.embedding = embedding;
                    record.needs_embedding = needs_embedding;
                    count += 1;
                    ops.push(WriteOp::UpsertCalendar(record));
                }
            }
            Err(e) if e.code().is_poison() => {
                warn!(
                    account = %ctx.email,
                    calendar = calendar_id,
                    href = %object.href,
                    "quarantining malformed event: {}",
                    e.message()
                );
                let mut state = ctx.state.lock().await;
                state.poison_events.insert(object.href.clone());
            }
            Err(e) => return Err(e),
        }
    }

    for href in &deleted_hrefs {
        ops.push(WriteOp::DeleteCalendar {
            account_id: ctx.email.clone(),
            event_id: event_id_from_href(href),
        });
    }

    if ops.is_empty() && sync_token.is_none() {
        return Ok(0);
    }

    let now = utc_now!();
    {
        let mut row = ctx.account_row.lock().await;
        row.last_calendar_sync = Some(now);
        ops.push(WriteOp::UpsertAccount(row.clone()));
    }
    ctx.commits.submit_and_wait(ops).await?;
    {
        let mut state = ctx.state.lock().await;
        if let Some(token) = sync_token {
            state
                .calendar_tokens
                .insert(calendar_id.to_string(), token);
        }
        state.last_calendar_sync = Some(now);
    }
    ctx.save_state().await?;
    ctx.mark_committed();
    Ok(count)
}

fn calendar_embedding_text(record: &CalendarRecord) -> String {
    let mut text = record.summary.clone();
    if let Some(description) = &record.description {
        text.push('\n');
        text.push_str(description);
    }
    if let Some(location) = &record.location {
        text.push('\n');
        text.push_str(location);
    }
    text
}

/// Lazy attachment download: re-fetches the message under a large-body
/// permit, writes payloads under the size cap, and republishes the row
/// with local paths filled in.
pub async fn download_attachments(
    ctx: &AccountContext,
    folder: &str,
    uid: u32,
) -> GroundEffectResult<usize> {
    let _permit = ctx.limiter.body_fetch_permit().await?;
    let raws = ctx.mail.fetch_messages(folder, &[uid]).await?;
    let Some(raw) = raws.into_iter().next() else {
        debug!(account = %ctx.email, folder, uid, "attachment source vanished");
        return Ok(0);
    };

    let mut record = build_mail_record(&ctx.email, folder, &raw, ctx.sync_config.body_truncation_chars)?;
    let max_bytes = ctx.sync_config.attachment_max_size_mb * 1024 * 1024;

    let written = {
        // mail-parser structures are not Send; keep them scoped clear of
        // the awaits below.
        let message = MessageParser::default().parse(&raw.rfc822);
        let mut written = 0usize;
        if let Some(message) = message {
            for (index, part) in message.attachments().enumerate() {
                let Some(meta) = record.attachments.get_mut(index) else {
                    break;
                };
                if meta.size > max_bytes {
                    info!(
                        account = %ctx.email,
                        filename = %meta.filename,
                        size = meta.size,
                        "attachment exceeds size cap, skipped"
                    );
                    continue;
                }
                let path = crate::modules::settings::dir::attachment_path_under(
                    &ctx.attachments_dir,
                    &ctx.email,
                    record.gmail_message_id,
                    &meta.filename,
                );
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, part.contents())?;
                meta.local_path = Some(path.to_string_lossy().into_owned());
                written += 1;
            }
        }
        written
    };

    if written == 0 {
        return Ok(0);
    }
    let (embedding, needs_embedding) = ctx.embedder.embed_or_flag(&embedding_text(&record)).await;
    record.embedding = embedding;
    record.needs_embedding = needs_embedding;
    ctx.commits
        .submit(vec![WriteOp::UpsertMail(record)])
        .await?;
    Ok(written)
}
