// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::embedder::Embedder;
use crate::modules::error::{code::ErrorCode, GroundEffectError, GroundEffectResult};
use crate::modules::mutation::{EventDraft, MutationRouter, OutgoingMail};
use crate::modules::search::envelope::{EventEnvelope, MailItemEnvelope};
use crate::modules::search::{plan, HybridSearcher, SearchRequest};
use crate::modules::settings::config::Config;
use crate::modules::store::reader::{Snapshot, StoreReader, Table};
use crate::modules::store::schema::AccountStatus;
use crate::modules::sync::hints::drop_hint;
use crate::raise_error;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared state of one query-server session.
pub struct ToolContext {
    pub reader: Mutex<StoreReader>,
    pub config: Config,
    pub searcher: HybridSearcher,
    pub router: Arc<MutationRouter>,
    pub data_root: PathBuf,
    pub body_cap: usize,
}

impl ToolContext {
    pub fn new(
        reader: StoreReader,
        config: Config,
        embedder: Arc<Embedder>,
        router: Arc<MutationRouter>,
        data_root: PathBuf,
    ) -> Self {
        let body_cap = config.sync.body_truncation_chars;
        Self {
            reader: Mutex::new(reader),
            config,
            searcher: HybridSearcher::new(embedder),
            router,
            data_root,
            body_cap,
        }
    }

    /// Each invocation pins the latest published manifest and keeps it for
    /// the whole request.
    async fn snapshot(&self) -> GroundEffectResult<Arc<Snapshot>> {
        let mut reader = self.reader.lock().await;
        reader.refresh()?;
        Ok(reader.snapshot())
    }
}

fn error_envelope(e: &GroundEffectError) -> Value {
    let mut error = json!({
        "code": e.code().wire_name(),
        "message": e.message(),
    });
    let action = match e.code() {
        ErrorCode::OAuth2RefreshFailed
        | ErrorCode::MissingRefreshToken
        | ErrorCode::ImapAuthenticationFailed
        | ErrorCode::CalDavAuthenticationFailed => {
            Some("re-authorize the account from the menu bar")
        }
        ErrorCode::ConfirmationRequired => Some("repeat the call with confirm=true"),
        ErrorCode::TooManyRequest => Some("retry after a short delay"),
        _ => None,
    };
    if let Some(action) = action {
        error["action"] = json!(action);
    }
    json!({ "error": error })
}

fn parse<T: for<'de> Deserialize<'de>>(args: &Value) -> GroundEffectResult<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| raise_error!(format!("invalid arguments: {e}"), ErrorCode::InvalidParameter))
}

/// Every tool returns a result or a structured error, never both.
pub async fn dispatch(ctx: &ToolContext, tool: &str, args: Value) -> Value {
    match run(ctx, tool, args).await {
        Ok(result) => json!({ "result": result }),
        Err(e) => error_envelope(&e),
    }
}

async fn run(ctx: &ToolContext, tool: &str, args: Value) -> GroundEffectResult<Value> {
    match tool {
        "search_mail" => search_items(ctx, args, Table::Mail).await,
        "search_calendar" => search_items(ctx, args, Table::Calendar).await,
        "get_mail" => get_mail(ctx, args).await,
        "get_thread" => get_thread(ctx, args).await,
        "get_event" => get_event(ctx, args).await,
        "list_folders" => list_folders(ctx, args).await,
        "list_calendars" => list_calendars(ctx, args).await,
        "list_accounts" => list_accounts(ctx).await,
        "get_sync_status" => get_sync_status(ctx, args).await,
        "send_mail" => send_mail(ctx, args).await,
        "create_event" => create_event(ctx, args).await,
        "update_event" => update_event(ctx, args).await,
        "delete_event" => delete_event(ctx, args).await,
        "mark_read" => flag_op(ctx, args, FlagOp::MarkRead).await,
        "mark_unread" => flag_op(ctx, args, FlagOp::MarkUnread).await,
        "archive" => flag_op(ctx, args, FlagOp::Archive).await,
        "move_mail" => flag_op(ctx, args, FlagOp::Move).await,
        "delete_mail" => flag_op(ctx, args, FlagOp::Delete).await,
        "trigger_sync" => trigger_sync(ctx, args).await,
        "get_attachment" => get_attachment(ctx, args).await,
        other => Err(raise_error!(
            format!("unknown tool '{other}'"),
            ErrorCode::InvalidParameter
        )),
    }
}

async fn search_items(ctx: &ToolContext, args: Value, table: Table) -> GroundEffectResult<Value> {
    let request: SearchRequest = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    let planned = plan(&snapshot, &ctx.config, &request)?;
    let outcome = ctx.searcher.search(&snapshot, table, &planned).await?;

    let results: Vec<Value> = outcome
        .hits
        .iter()
        .filter_map(|hit| {
            let score = (hit.score > 0.0).then_some(hit.score);
            match table {
                Table::Mail => snapshot
                    .mail(hit.id)
                    .map(|r| serde_json::to_value(MailItemEnvelope::from_record(r, &snapshot, score)).unwrap()),
                Table::Calendar => snapshot
                    .calendar(hit.id)
                    .map(|r| serde_json::to_value(EventEnvelope::from_record(r, score)).unwrap()),
            }
        })
        .collect();

    let mut body = json!({
        "results": results,
        "accounts_searched": outcome.accounts_searched,
        "total_candidates": outcome.candidates,
        "elapsed_ms": outcome.elapsed_ms,
    });
    if outcome.degraded {
        body["degraded"] = json!(true);
    }
    Ok(body)
}

#[derive(Deserialize)]
struct ItemArgs {
    account: Option<String>,
    id: u64,
}

async fn get_mail(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let item: ItemArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    let record = snapshot.mail(item.id).ok_or_else(|| {
        raise_error!(
            format!("mail item {} not found", item.id),
            ErrorCode::ResourceNotFound
        )
    })?;
    let envelope =
        MailItemEnvelope::from_record(record, &snapshot, None).with_body(record, ctx.body_cap);
    Ok(serde_json::to_value(envelope).unwrap())
}

#[derive(Deserialize)]
struct ThreadArgs {
    account: String,
    thread_id: u64,
}

async fn get_thread(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let thread: ThreadArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    let messages: Vec<Value> = snapshot
        .thread(&thread.account, thread.thread_id)
        .into_iter()
        .map(|record| {
            serde_json::to_value(
                MailItemEnvelope::from_record(record, &snapshot, None)
                    .with_body(record, ctx.body_cap),
            )
            .unwrap()
        })
        .collect();
    if messages.is_empty() {
        return Err(raise_error!(
            format!("thread {} not found", thread.thread_id),
            ErrorCode::ResourceNotFound
        ));
    }
    Ok(json!({ "thread_id": thread.thread_id, "messages": messages }))
}

async fn get_event(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let item: ItemArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    let record = snapshot.calendar(item.id).ok_or_else(|| {
        raise_error!(
            format!("event {} not found", item.id),
            ErrorCode::ResourceNotFound
        )
    })?;
    Ok(serde_json::to_value(EventEnvelope::from_record(record, None)).unwrap())
}

#[derive(Deserialize)]
struct AccountArgs {
    account: String,
}

async fn list_folders(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let account: AccountArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    require_account(&snapshot, &account.account)?;
    let folders: Vec<Value> = snapshot
        .folders(&account.account)
        .into_iter()
        .map(|(name, count)| json!({ "name": name, "message_count": count }))
        .collect();
    Ok(json!({ "folders": folders }))
}

async fn list_calendars(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let account: AccountArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    require_account(&snapshot, &account.account)?;
    let calendars: Vec<Value> = snapshot
        .calendars(&account.account)
        .into_iter()
        .map(|(id, count)| json!({ "id": id, "event_count": count }))
        .collect();
    Ok(json!({ "calendars": calendars }))
}

fn require_account<'a>(
    snapshot: &'a Snapshot,
    account: &str,
) -> GroundEffectResult<&'a crate::modules::store::schema::AccountRecord> {
    snapshot.account(account).ok_or_else(|| {
        raise_error!(
            format!("unknown account '{account}'"),
            ErrorCode::UnknownAccount
        )
    })
}

fn account_status_value(record: &crate::modules::store::schema::AccountRecord) -> Value {
    json!({
        "email": record.email,
        "alias": record.alias,
        "display_name": record.display_name,
        "status": format!("{:?}", record.status).to_lowercase(),
        "needs_reauth": record.status == AccountStatus::NeedsReauth,
        "last_email_sync": record.last_email_sync.map(crate::modules::search::envelope::iso8601),
        "last_calendar_sync": record.last_calendar_sync.map(crate::modules::search::envelope::iso8601),
        "email_sync_enabled": record.email_sync_enabled,
        "calendar_sync_enabled": record.calendar_sync_enabled,
    })
}

async fn list_accounts(ctx: &ToolContext) -> GroundEffectResult<Value> {
    let snapshot = ctx.snapshot().await?;
    let accounts: Vec<Value> = snapshot
        .accounts()
        .into_iter()
        .map(account_status_value)
        .collect();
    Ok(json!({ "accounts": accounts }))
}

#[derive(Deserialize)]
struct SyncStatusArgs {
    account: Option<String>,
}

async fn get_sync_status(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let request: SyncStatusArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    let accounts: Vec<Value> = match &request.account {
        Some(account) => vec![account_status_value(require_account(&snapshot, account)?)],
        None => snapshot
            .accounts()
            .into_iter()
            .map(account_status_value)
            .collect(),
    };
    Ok(json!({
        "accounts": accounts,
        "store_version": snapshot.version,
        "mail_items": snapshot.mail_count(),
        "calendar_items": snapshot.calendar_count(),
    }))
}

#[derive(Deserialize)]
struct SendMailArgs {
    from_account: String,
    to: Vec<String>,
    #[serde(default)]
    cc: Vec<String>,
    #[serde(default)]
    bcc: Vec<String>,
    #[serde(default)]
    subject: String,
    body: String,
    /// Internal id of the message being replied to.
    reply_to: Option<u64>,
    #[serde(default)]
    confirm: bool,
}

async fn send_mail(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let request: SendMailArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    require_account(&snapshot, &request.from_account)?;

    let reply = match request.reply_to {
        Some(parent_id) => {
            let parent = snapshot.mail(parent_id).ok_or_else(|| {
                raise_error!(
                    format!("reply parent {parent_id} not found"),
                    ErrorCode::ResourceNotFound
                )
            })?;
            Some(crate::modules::mutation::send::ReplyContext {
                parent_message_id: parent.message_id.clone(),
                parent_references: parent.references.clone(),
                parent_subject: parent.subject.clone(),
            })
        }
        None => None,
    };

    let outgoing = OutgoingMail {
        from_account: request.from_account,
        to: request.to,
        cc: request.cc,
        bcc: request.bcc,
        subject: request.subject,
        body: request.body,
        reply,
    };
    match ctx.router.send_mail(outgoing, request.confirm).await? {
        Ok(result) => Ok(serde_json::to_value(result).unwrap()),
        Err(preview) => Ok(serde_json::to_value(preview).unwrap()),
    }
}

#[derive(Deserialize)]
struct CreateEventArgs {
    account: String,
    #[serde(flatten)]
    draft: EventDraft,
    #[serde(default)]
    confirm: bool,
}

async fn create_event(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let request: CreateEventArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    require_account(&snapshot, &request.account)?;
    match ctx
        .router
        .create_event(&request.account, request.draft, request.confirm)
        .await?
    {
        Ok(result) => Ok(serde_json::to_value(result).unwrap()),
        Err(draft) => Ok(json!({ "preview": true, "event": draft })),
    }
}

#[derive(Deserialize)]
struct UpdateEventArgs {
    account: String,
    id: u64,
    #[serde(flatten)]
    draft: EventDraft,
    #[serde(default)]
    confirm: bool,
}

async fn update_event(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let request: UpdateEventArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    require_account(&snapshot, &request.account)?;
    match ctx
        .router
        .update_event(&snapshot, &request.account, request.id, request.draft, request.confirm)
        .await?
    {
        Ok(result) => Ok(serde_json::to_value(result).unwrap()),
        Err(draft) => Ok(json!({ "preview": true, "event": draft })),
    }
}

async fn delete_event(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let item: ItemArgs = parse(&args)?;
    let account = item.account.clone().ok_or_else(|| {
        raise_error!("'account' is required".into(), ErrorCode::InvalidParameter)
    })?;
    let snapshot = ctx.snapshot().await?;
    require_account(&snapshot, &account)?;
    ctx.router.delete_event(&snapshot, &account, item.id).await?;
    Ok(json!({ "deleted": true }))
}

enum FlagOp {
    MarkRead,
    MarkUnread,
    Archive,
    Move,
    Delete,
}

#[derive(Deserialize)]
struct FlagArgs {
    account: String,
    id: u64,
    destination: Option<String>,
}

async fn flag_op(ctx: &ToolContext, args: Value, op: FlagOp) -> GroundEffectResult<Value> {
    let request: FlagArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    require_account(&snapshot, &request.account)?;
    match op {
        FlagOp::MarkRead => {
            ctx.router
                .mark_read(&snapshot, &request.account, request.id)
                .await?
        }
        FlagOp::MarkUnread => {
            ctx.router
                .mark_unread(&snapshot, &request.account, request.id)
                .await?
        }
        FlagOp::Archive => {
            ctx.router
                .archive(&snapshot, &request.account, request.id)
                .await?
        }
        FlagOp::Move => {
            let destination = request.destination.as_deref().ok_or_else(|| {
                raise_error!(
                    "'destination' is required".into(),
                    ErrorCode::InvalidParameter
                )
            })?;
            ctx.router
                .move_mail(&snapshot, &request.account, request.id, destination)
                .await?
        }
        FlagOp::Delete => {
            ctx.router
                .delete_mail(&snapshot, &request.account, request.id)
                .await?
        }
    }
    Ok(json!({ "ok": true }))
}

async fn trigger_sync(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let request: SyncStatusArgs = parse(&args)?;
    if let Some(account) = &request.account {
        let snapshot = ctx.snapshot().await?;
        require_account(&snapshot, account)?;
    }
    drop_hint(&ctx.data_root, request.account.as_deref(), None)?;
    Ok(json!({ "triggered": true }))
}

#[derive(Deserialize)]
struct AttachmentArgs {
    id: u64,
    attachment_id: String,
}

async fn get_attachment(ctx: &ToolContext, args: Value) -> GroundEffectResult<Value> {
    let request: AttachmentArgs = parse(&args)?;
    let snapshot = ctx.snapshot().await?;
    let record = snapshot.mail(request.id).ok_or_else(|| {
        raise_error!(
            format!("mail item {} not found", request.id),
            ErrorCode::ResourceNotFound
        )
    })?;
    let meta = record
        .attachments
        .iter()
        .find(|a| a.id == request.attachment_id)
        .ok_or_else(|| {
            raise_error!(
                format!(
                    "attachment '{}' not found on item {}",
                    request.attachment_id, request.id
                ),
                ErrorCode::ResourceNotFound
            )
        })?;
    let mut body = json!({
        "filename": meta.filename,
        "mime": meta.mime,
        "size": meta.size,
        "downloaded": meta.local_path.is_some(),
        "local_path": meta.local_path,
    });
    // Small payloads ride along inline; larger ones stay path-only.
    if let Some(path) = &meta.local_path {
        if meta.size <= INLINE_ATTACHMENT_BYTES {
            if let Ok(bytes) = std::fs::read(path) {
                body["content_base64"] = json!(crate::base64_encode!(&bytes));
            }
        }
    }
    Ok(body)
}

const INLINE_ATTACHMENT_BYTES: u64 = 1024 * 1024;
