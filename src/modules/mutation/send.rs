// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::{code::ErrorCode, GroundEffectResult};
use crate::modules::oauth2::TokenRefresher;
use crate::raise_error;
use async_trait::async_trait;
use mail_send::{mail_builder::MessageBuilder, Credentials, SmtpClientBuilder};
use std::sync::Arc;
use tracing::info;

pub const GMAIL_SMTP_HOST: &str = "smtp.gmail.com";
pub const GMAIL_SMTP_PORT: u16 = 465;

/// Submission boundary: hands a finished RFC-5322 message to the
/// provider. Tests substitute a recorder.
#[async_trait]
pub trait MailSubmitter: Send + Sync {
    async fn submit(
        &self,
        from_account: &str,
        recipients: &[String],
        message: Vec<u8>,
    ) -> GroundEffectResult<()>;
}

/// Gmail submission over SMTP with XOAUTH2; the same bearer token the
/// IMAP side uses.
pub struct SmtpSubmitter {
    refresher: Arc<TokenRefresher>,
}

impl SmtpSubmitter {
    pub fn new(refresher: Arc<TokenRefresher>) -> Self {
        Self { refresher }
    }
}

#[async_trait]
impl MailSubmitter for SmtpSubmitter {
    async fn submit(
        &self,
        from_account: &str,
        recipients: &[String],
        message: Vec<u8>,
    ) -> GroundEffectResult<()> {
        let tokens = self.refresher.current_tokens(from_account).await?;
        let mut client = SmtpClientBuilder::new(GMAIL_SMTP_HOST, GMAIL_SMTP_PORT)
            .implicit_tls(true)
            .credentials(Credentials::XOauth2 {
                username: from_account,
                secret: tokens.access_token.as_str(),
            })
            .connect()
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::SmtpCommandFailed))?;
        client
            .send(
                mail_send::smtp::message::Message::new(
                    from_account.to_string(),
                    recipients.to_vec(),
                    message,
                ),
            )
            .await
            .map_err(|e| raise_error!(format!("{e}"), ErrorCode::SmtpCommandFailed))?;
        info!(account = %from_account, "message submitted");
        Ok(())
    }
}

/// Reply context pulled from the parent item.
#[derive(Clone, Debug, Default)]
pub struct ReplyContext {
    pub parent_message_id: String,
    pub parent_references: Vec<String>,
    pub parent_subject: String,
}

#[derive(Clone, Debug, Default)]
pub struct OutgoingMail {
    pub from_account: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub reply: Option<ReplyContext>,
}

/// The built message: headers resolved, bytes ready for the submit
/// endpoint. Also the structured shape preview mode returns.
#[derive(Clone, Debug)]
pub struct BuiltMail {
    pub message_id: String,
    pub subject: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub bytes: Vec<u8>,
}

fn reply_subject(parent_subject: &str) -> String {
    if parent_subject.to_ascii_lowercase().starts_with("re:") {
        parent_subject.to_string()
    } else {
        format!("Re: {parent_subject}")
    }
}

/// Assembles the RFC-5322 message. Replies thread correctly: In-Reply-To
/// names the parent, References extends the parent's chain, and the
/// subject gains its "Re: " exactly once.
pub fn build_outgoing(mail: &OutgoingMail) -> GroundEffectResult<BuiltMail> {
    if mail.to.is_empty() {
        return Err(raise_error!(
            "at least one recipient is required".into(),
            ErrorCode::InvalidParameter
        ));
    }
    for address in mail.to.iter().chain(&mail.cc).chain(&mail.bcc) {
        crate::modules::utils::validate_email(address)?;
    }

    let domain = mail
        .from_account
        .rsplit('@')
        .next()
        .unwrap_or("localhost");
    let message_id = format!(
        "{}.{}@{}",
        crate::modules::utils::generate_id(),
        "groundeffect",
        domain
    );

    let (subject, in_reply_to, references) = match &mail.reply {
        Some(reply) => {
            let mut references = reply.parent_references.clone();
            references.push(reply.parent_message_id.clone());
            (
                if mail.subject.is_empty() {
                    reply_subject(&reply.parent_subject)
                } else {
                    reply_subject(&mail.subject)
                },
                Some(reply.parent_message_id.clone()),
                references,
            )
        }
        None => (mail.subject.clone(), None, Vec::new()),
    };

    let mut builder = MessageBuilder::new()
        .message_id(message_id.clone())
        .from(mail.from_account.clone())
        .to(mail.to.clone())
        .subject(subject.clone())
        .text_body(mail.body.clone());
    if !mail.cc.is_empty() {
        builder = builder.cc(mail.cc.clone());
    }
    if !mail.bcc.is_empty() {
        builder = builder.bcc(mail.bcc.clone());
    }
    if let Some(parent) = &in_reply_to {
        builder = builder.in_reply_to(parent.clone());
        let chain = references
            .iter()
            .map(|id| format!("<{id}>"))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.header(
            "References",
            mail_send::mail_builder::headers::raw::Raw::from(chain),
        );
    }

    let bytes = builder
        .write_to_vec()
        .map_err(|e| raise_error!(format!("{e}"), ErrorCode::InternalError))?;

    Ok(BuiltMail {
        message_id,
        subject,
        to: mail.to.clone(),
        cc: mail.cc.clone(),
        bcc: mail.bcc.clone(),
        in_reply_to,
        references,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_mail() -> OutgoingMail {
        OutgoingMail {
            from_account: "a@x.test".into(),
            to: vec!["c@z.test".into()],
            subject: "Hi".into(),
            body: "hello".into(),
            ..Default::default()
        }
    }

    #[test]
    fn builds_a_plain_message() {
        let built = build_outgoing(&base_mail()).unwrap();
        let text = String::from_utf8_lossy(&built.bytes).into_owned();
        assert!(text.contains("Subject: Hi"));
        assert!(text.contains("To: <c@z.test>") || text.contains("To: c@z.test"));
        assert!(built.in_reply_to.is_none());
        assert!(built.message_id.ends_with("@x.test"));
    }

    #[test]
    fn replies_thread_and_prefix_once() {
        let mut mail = base_mail();
        mail.subject = String::new();
        mail.reply = Some(ReplyContext {
            parent_message_id: "parent@x.test".into(),
            parent_references: vec!["root@x.test".into()],
            parent_subject: "Budget".into(),
        });
        let built = build_outgoing(&mail).unwrap();
        assert_eq!(built.subject, "Re: Budget");
        assert_eq!(built.in_reply_to.as_deref(), Some("parent@x.test"));
        assert_eq!(built.references, vec!["root@x.test", "parent@x.test"]);

        mail.reply.as_mut().unwrap().parent_subject = "Re: Budget".into();
        let built = build_outgoing(&mail).unwrap();
        assert_eq!(built.subject, "Re: Budget");
    }

    #[test]
    fn recipients_are_validated() {
        let mut mail = base_mail();
        mail.to = vec!["not-an-address".into()];
        assert!(build_outgoing(&mail).is_err());
        mail.to = Vec::new();
        assert!(build_outgoing(&mail).is_err());
    }
}
