// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::imap::RawMessage;
use crate::modules::store::schema::{Addr, AttachmentMeta, MailRecord};
use crate::raise_error;
use crate::utc_now;
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};

pub const SNIPPET_CHARS: usize = 200;

/// Stable 64-bit id for provider-side string identifiers (FNV-1a). The
/// same Message-ID maps to the same id on every sync pass and across
/// restarts, which is what makes ingest idempotent.
pub fn stable_hash64(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Plain text from an HTML part: tag-stripped text nodes, script and style
/// dropped, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let skip = scraper::Selector::parse("script, style, head").unwrap();
    let skipped: ahash::AHashSet<_> = document
        .select(&skip)
        .flat_map(|el| el.descendants().map(|n| n.id()))
        .collect();
    let mut out = String::new();
    for node in document.tree.nodes() {
        if skipped.contains(&node.id()) {
            continue;
        }
        if let scraper::Node::Text(text) = node.value() {
            out.push_str(text);
            out.push(' ');
        }
    }
    collapse_whitespace(&out)
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn make_snippet(text: &str) -> String {
    let collapsed = collapse_whitespace(text);
    if collapsed.chars().count() <= SNIPPET_CHARS {
        return collapsed;
    }
    collapsed.chars().take(SNIPPET_CHARS).collect()
}

fn collect_addrs(address: Option<&Address>) -> Vec<Addr> {
    fn convert(a: &mail_parser::Addr<'_>) -> Option<Addr> {
        a.address.as_ref().map(|email| Addr {
            name: a.name.as_ref().map(|n| n.to_string()),
            email: email.to_string(),
        })
    }
    match address {
        Some(Address::List(addrs)) => addrs.iter().filter_map(convert).collect(),
        Some(Address::Group(groups)) => groups
            .iter()
            .flat_map(|group| group.addresses.iter().filter_map(convert))
            .collect(),
        None => Vec::new(),
    }
}

fn text_list(value: &HeaderValue) -> Vec<String> {
    match value {
        HeaderValue::Text(text) => vec![text.to_string()],
        HeaderValue::TextList(list) => list.iter().map(|t| t.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Parses one fetched message into a store row. The embedding is left
/// zeroed; the ingest pipeline fills it in. A payload mail-parser cannot
/// make sense of is a poison error: the caller quarantines the UID and
/// moves on.
pub fn build_mail_record(
    account_id: &str,
    folder: &str,
    raw: &RawMessage,
    body_truncation_chars: usize,
) -> GroundEffectResult<MailRecord> {
    let message = MessageParser::default().parse(&raw.rfc822).ok_or_else(|| {
        raise_error!(
            format!("unparseable message at uid {} in '{folder}'", raw.uid),
            ErrorCode::MalformedMessage
        )
    })?;
    // The parser is lenient enough to accept arbitrary bytes as a headerless
    // body; a payload with none of the identifying headers is quarantined.
    if message.message_id().is_none() && message.from().is_none() && message.subject().is_none() {
        return Err(raise_error!(
            format!("message at uid {} in '{folder}' carries no usable headers", raw.uid),
            ErrorCode::MalformedMessage
        ));
    }

    let message_id = message
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("missing-{}-{}-{}", account_id, folder, raw.uid));

    let in_reply_to = text_list(message.in_reply_to()).into_iter().next();
    let references: Vec<String> = text_list(message.references())
        .iter()
        .flat_map(|entry| entry.split_whitespace())
        .map(|id| id.trim_matches(['<', '>']).to_string())
        .filter(|id| !id.is_empty())
        .collect();

    // Thread identity: the conversation root when the headers name one,
    // otherwise the message stands alone.
    let thread_root = references
        .first()
        .cloned()
        .or_else(|| {
            in_reply_to
                .as_deref()
                .map(|id| id.trim_matches(['<', '>']).to_string())
        })
        .unwrap_or_else(|| message_id.clone());

    let mut body_text = message
        .body_text(0)
        .map(|t| t.to_string())
        .unwrap_or_default();
    let body_html = message.body_html(0).map(|h| h.to_string());
    if body_text.trim().is_empty() {
        if let Some(html) = &body_html {
            body_text = html_to_text(html);
        }
    }
    if body_text.chars().count() > body_truncation_chars {
        body_text = body_text.chars().take(body_truncation_chars).collect();
    }

    let attachments: Vec<AttachmentMeta> = message
        .attachments()
        .enumerate()
        .map(|(index, part)| {
            let filename = part
                .attachment_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment-{index}"));
            let mime = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| {
                    mime_guess::from_path(&filename)
                        .first_or_octet_stream()
                        .essence_str()
                        .to_string()
                });
            AttachmentMeta {
                id: format!("{}", index + 1),
                filename,
                mime,
                size: part.contents().len() as u64,
                content_id: part.content_id().map(str::to_string),
                local_path: None,
            }
        })
        .collect();

    let date = message
        .date()
        .map(|d| d.to_timestamp() * 1000)
        .unwrap_or(raw.internal_date);

    let from = collect_addrs(message.from())
        .into_iter()
        .next()
        .unwrap_or_default();

    Ok(MailRecord {
        id: crate::modules::utils::generate_id(),
        account_id: account_id.to_string(),
        gmail_message_id: stable_hash64(&message_id),
        gmail_thread_id: stable_hash64(&thread_root),
        message_id,
        in_reply_to,
        references,
        folder: folder.to_string(),
        uid: raw.uid,
        uid_validity: raw.uid_validity,
        labels: vec![folder.to_string()],
        flags: raw.flags.clone(),
        from,
        to: collect_addrs(message.to()),
        cc: collect_addrs(message.cc()),
        bcc: collect_addrs(message.bcc()),
        subject: message.subject().unwrap_or_default().to_string(),
        date,
        snippet: make_snippet(&body_text),
        body_text,
        body_html,
        attachments,
        embedding: vec![0.0; crate::modules::store::schema::EMBEDDING_DIM],
        needs_embedding: true,
        synced_at: utc_now!(),
        size: raw.size,
    })
}

/// The text a mail item is embedded from: headers people search by, then
/// the body.
pub fn embedding_text(record: &MailRecord) -> String {
    let recipients = record
        .to
        .iter()
        .map(|a| a.email.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "From: {}\nTo: {}\nSubject: {}\n\n{}",
        record.from.email, recipients, record.subject, record.body_text
    )
}

#[cfg(test)]
pub mod testing {
    use crate::modules::imap::RawMessage;

    /// Minimal RFC-5322 fixture used across the sync and search tests.
    pub fn raw_message(
        uid: u32,
        uid_validity: u32,
        message_id: &str,
        subject: &str,
        body: &str,
        date_millis: i64,
    ) -> RawMessage {
        let rfc822 = format!(
            "Message-ID: <{message_id}>\r\n\
             From: Alice Example <alice@x.test>\r\n\
             To: Bob <bob@y.test>\r\n\
             Subject: {subject}\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             {body}\r\n"
        );
        RawMessage {
            uid,
            uid_validity,
            flags: Vec::new(),
            internal_date: date_millis,
            size: rfc822.len() as u64,
            rfc822: rfc822.into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::raw_message;
    use super::*;

    #[test]
    fn parses_a_plain_message() {
        let raw = raw_message(7, 1, "m1@x.test", "Invoice enclosed", "Please pay soon.", 1_000);
        let record = build_mail_record("a@x.test", "INBOX", &raw, 40_000).unwrap();
        assert_eq!(record.uid, 7);
        assert_eq!(record.subject, "Invoice enclosed");
        assert_eq!(record.from.email, "alice@x.test");
        assert_eq!(record.to[0].email, "bob@y.test");
        assert_eq!(record.message_id, "m1@x.test");
        assert!(record.needs_embedding);
        assert_eq!(record.snippet, "Please pay soon.");
    }

    #[test]
    fn duplicate_parses_share_provider_ids() {
        let raw = raw_message(7, 1, "m1@x.test", "s", "b", 1_000);
        let a = build_mail_record("a@x.test", "INBOX", &raw, 40_000).unwrap();
        let b = build_mail_record("a@x.test", "INBOX", &raw, 40_000).unwrap();
        assert_eq!(a.gmail_message_id, b.gmail_message_id);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn garbage_is_poison() {
        let raw = RawMessage {
            uid: 9,
            uid_validity: 1,
            rfc822: vec![0xff, 0xfe, 0x00],
            ..Default::default()
        };
        let err = build_mail_record("a@x.test", "INBOX", &raw, 40_000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedMessage);
    }

    #[test]
    fn html_fallback_and_snippet() {
        let html_body = "<html><head><style>p{}</style></head>\
                         <body><p>Hello&nbsp;there</p><script>x()</script></body></html>";
        let text = html_to_text(html_body);
        assert!(text.contains("Hello"));
        assert!(!text.contains("x()"));
        assert!(!text.contains("p{}"));
    }

    #[test]
    fn snippet_is_capped() {
        let long = "word ".repeat(100);
        let snippet = make_snippet(&long);
        assert!(snippet.chars().count() <= SNIPPET_CHARS);
    }

    #[test]
    fn replies_share_a_thread() {
        let root = raw_message(1, 1, "root@x.test", "Hi", "first", 1_000);
        let mut reply_raw = raw_message(2, 1, "reply@x.test", "Re: Hi", "second", 2_000);
        let text = String::from_utf8(reply_raw.rfc822).unwrap();
        reply_raw.rfc822 = text
            .replace(
                "MIME-Version:",
                "In-Reply-To: <root@x.test>\r\nReferences: <root@x.test>\r\nMIME-Version:",
            )
            .into_bytes();

        let a = build_mail_record("a@x.test", "INBOX", &root, 40_000).unwrap();
        let b = build_mail_record("a@x.test", "INBOX", &reply_raw, 40_000).unwrap();
        assert_eq!(a.gmail_thread_id, b.gmail_thread_id);
    }
}
