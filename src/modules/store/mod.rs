// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

pub mod fragment;
pub mod index;
pub mod manifest;
pub mod reader;
pub mod schema;
pub mod snapshot;
pub mod writer;

#[cfg(test)]
mod tests {
    use super::reader::{StoreReader, Table};
    use super::schema::*;
    use super::writer::{StoreWriter, WriteOp};
    use crate::modules::utils::generate_id;
    use tempfile::TempDir;

    fn account(email: &str) -> AccountRecord {
        AccountRecord {
            email: email.into(),
            display_name: email.into(),
            status: AccountStatus::Active,
            added_at: 1,
            email_sync_enabled: true,
            calendar_sync_enabled: true,
            ..Default::default()
        }
    }

    fn mail(account_id: &str, gmail_message_id: u64, folder: &str, uid: u32) -> MailRecord {
        MailRecord {
            id: generate_id(),
            account_id: account_id.into(),
            gmail_message_id,
            gmail_thread_id: gmail_message_id,
            message_id: format!("<{gmail_message_id}@x.test>"),
            folder: folder.into(),
            uid,
            uid_validity: 1,
            from: Addr::new(None, "sender@x.test"),
            subject: format!("message {gmail_message_id}"),
            date: 1_700_000_000_000 + gmail_message_id as i64,
            body_text: "body".into(),
            snippet: "body".into(),
            embedding: vec![0.0; EMBEDDING_DIM],
            needs_embedding: true,
            synced_at: 1,
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_deliveries_keep_one_row() {
        let dir = TempDir::new().unwrap();
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        writer
            .commit(vec![WriteOp::UpsertAccount(account("a@x.test"))])
            .unwrap();

        let first = mail("a@x.test", 77, "INBOX", 1);
        writer.commit(vec![WriteOp::UpsertMail(first)]).unwrap();

        // Same logical item observed again, now read and with a new flag.
        let mut second = mail("a@x.test", 77, "INBOX", 1);
        second.flags = vec!["\\Seen".into()];
        writer.commit(vec![WriteOp::UpsertMail(second)]).unwrap();

        let reader = StoreReader::open(dir.path().to_path_buf()).unwrap();
        let snapshot = reader.snapshot();
        assert_eq!(snapshot.mail_count(), 1);
        let row = snapshot.mail_by_provider_id("a@x.test", 77).unwrap();
        assert_eq!(row.flags, vec!["\\Seen"]);
    }

    #[test]
    fn uid_validity_rollover_leaves_no_stale_rows() {
        let dir = TempDir::new().unwrap();
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        writer
            .commit(vec![WriteOp::UpsertAccount(account("a@x.test"))])
            .unwrap();
        writer
            .commit(vec![
                WriteOp::UpsertMail(mail("a@x.test", 1, "INBOX", 10)),
                WriteOp::UpsertMail(mail("a@x.test", 2, "INBOX", 11)),
                WriteOp::UpsertMail(mail("a@x.test", 3, "Sent", 5)),
            ])
            .unwrap();

        // The server re-issued UIDs for INBOX: message 1 is re-mapped in the
        // same commit, message 2 was not re-observed.
        let mut remapped = mail("a@x.test", 1, "INBOX", 99);
        remapped.uid_validity = 2;
        writer
            .commit(vec![
                WriteOp::UpsertMail(remapped),
                WriteOp::InvalidateFolderUids {
                    account_id: "a@x.test".into(),
                    folder: "INBOX".into(),
                    uid_validity: 2,
                },
            ])
            .unwrap();

        let reader = StoreReader::open(dir.path().to_path_buf()).unwrap();
        let snapshot = reader.snapshot();
        // Logical identity is preserved for the re-mapped message.
        let kept = snapshot.mail_by_provider_id("a@x.test", 1).unwrap();
        assert_eq!((kept.uid, kept.uid_validity), (99, 2));
        assert!(snapshot.mail_by_provider_id("a@x.test", 2).is_none());
        // Other folders keep their epoch.
        assert!(snapshot.mail_by_provider_id("a@x.test", 3).is_some());
    }

    #[test]
    fn reader_snapshots_are_stable_across_commits() {
        let dir = TempDir::new().unwrap();
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        writer
            .commit(vec![
                WriteOp::UpsertAccount(account("a@x.test")),
                WriteOp::UpsertMail(mail("a@x.test", 1, "INBOX", 1)),
            ])
            .unwrap();

        let mut reader = StoreReader::open(dir.path().to_path_buf()).unwrap();
        let before = reader.snapshot();

        writer
            .commit(vec![WriteOp::UpsertMail(mail("a@x.test", 2, "INBOX", 2))])
            .unwrap();

        // The pinned snapshot still sees the pre-commit state.
        assert_eq!(before.mail_count(), 1);
        // Refreshing picks up the post-commit state.
        assert!(reader.refresh().unwrap());
        assert_eq!(reader.snapshot().mail_count(), 2);
        // And the old handle is still whole.
        assert_eq!(before.mail_count(), 1);
    }

    #[test]
    fn account_delete_cascades() {
        let dir = TempDir::new().unwrap();
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        writer
            .commit(vec![
                WriteOp::UpsertAccount(account("a@x.test")),
                WriteOp::UpsertAccount(account("b@y.test")),
                WriteOp::UpsertMail(mail("a@x.test", 1, "INBOX", 1)),
                WriteOp::UpsertMail(mail("b@y.test", 2, "INBOX", 1)),
            ])
            .unwrap();
        writer
            .commit(vec![WriteOp::DeleteAccount {
                email: "a@x.test".into(),
            }])
            .unwrap();

        let reader = StoreReader::open(dir.path().to_path_buf()).unwrap();
        let snapshot = reader.snapshot();
        assert!(snapshot.account("a@x.test").is_none());
        assert!(snapshot.mail_by_provider_id("a@x.test", 1).is_none());
        assert!(snapshot.mail_by_provider_id("b@y.test", 2).is_some());
    }

    #[test]
    fn rows_for_unknown_accounts_are_dropped() {
        let dir = TempDir::new().unwrap();
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        writer
            .commit(vec![WriteOp::UpsertMail(mail("ghost@x.test", 1, "INBOX", 1))])
            .unwrap();
        let reader = StoreReader::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reader.snapshot().mail_count(), 0);
    }

    #[test]
    fn wrong_embedding_width_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        writer
            .commit(vec![WriteOp::UpsertAccount(account("a@x.test"))])
            .unwrap();
        let mut bad = mail("a@x.test", 1, "INBOX", 1);
        bad.embedding = vec![0.5; 12];
        assert!(writer.commit(vec![WriteOp::UpsertMail(bad)]).is_err());
    }

    #[test]
    fn writer_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
            writer
                .commit(vec![
                    WriteOp::UpsertAccount(account("a@x.test")),
                    WriteOp::UpsertMail(mail("a@x.test", 1, "INBOX", 1)),
                ])
                .unwrap();
        }
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(writer.state().mail.len(), 1);
        // The reopened writer keeps deduplicating against reloaded keys.
        writer
            .commit(vec![WriteOp::UpsertMail(mail("a@x.test", 1, "INBOX", 1))])
            .unwrap();
        assert_eq!(writer.state().mail.len(), 1);
    }

    #[test]
    fn filter_scan_orders_by_date_descending() {
        let dir = TempDir::new().unwrap();
        let mut writer = StoreWriter::open(dir.path().to_path_buf()).unwrap();
        writer
            .commit(vec![
                WriteOp::UpsertAccount(account("a@x.test")),
                WriteOp::UpsertMail(mail("a@x.test", 1, "INBOX", 1)),
                WriteOp::UpsertMail(mail("a@x.test", 9, "INBOX", 2)),
                WriteOp::UpsertMail(mail("a@x.test", 5, "INBOX", 3)),
            ])
            .unwrap();
        let reader = StoreReader::open(dir.path().to_path_buf()).unwrap();
        let snapshot = reader.snapshot();
        let ids = snapshot.filter_scan(Table::Mail, &Predicate::default(), 10);
        let provider_ids: Vec<u64> = ids
            .iter()
            .map(|id| snapshot.mail(*id).unwrap().gmail_message_id)
            .collect();
        assert_eq!(provider_ids, vec![9, 5, 1]);
    }
}
