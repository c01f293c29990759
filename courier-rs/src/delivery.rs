//! Message hand-off after SMTP DATA
//!
//! The forward listener relays through a [`Forwarder`]; the other listeners
//! hand messages to a [`Processor`] for local delivery.

use crate::error::{MailError, Result};
use crate::smtp::SmtpClient;
use crate::storage::MaildirStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Relays a completed message to another server
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward_email(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Result<()>;
}

/// Accepts a completed message for local handling
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process_email(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Result<()>;
}

/// Forwards through a configured smart host
pub struct RelayForwarder {
    client: SmtpClient,
}

impl RelayForwarder {
    pub fn new(client: SmtpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Forwarder for RelayForwarder {
    async fn forward_email(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Result<()> {
        self.client.send_mail(sender, recipients, raw).await
    }
}

/// Forwarder used when no relay host is configured; every message fails
pub struct NoRelay;

#[async_trait]
impl Forwarder for NoRelay {
    async fn forward_email(&self, _sender: &str, _recipients: &[String], _raw: &[u8]) -> Result<()> {
        Err(MailError::Delivery("No relay host configured".to_string()))
    }
}

/// Delivers into each recipient's maildir INBOX
pub struct MaildirProcessor {
    store: Arc<MaildirStore>,
}

impl MaildirProcessor {
    pub fn new(store: Arc<MaildirStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Processor for MaildirProcessor {
    async fn process_email(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Result<()> {
        let mut delivered = 0;
        for recipient in recipients {
            let mailbox = recipient.to_lowercase();
            if mailbox.contains(['/', '\\']) || mailbox.starts_with('.') {
                warn!("Refusing delivery to unsafe mailbox name {}", recipient);
                continue;
            }
            self.store.deliver(&mailbox, raw).await?;
            delivered += 1;
        }

        if delivered == 0 {
            return Err(MailError::Delivery("No deliverable recipients".to_string()));
        }
        info!("Delivered message from {} to {} mailbox(es)", sender, delivered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::store::EmailStore;
    use crate::imap::search::SearchFilter;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_maildir_processor_delivers_to_each_recipient() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MaildirStore::new(dir.path()));
        let processor = MaildirProcessor::new(store.clone());

        processor
            .process_email(
                "sender@example.com",
                &["Alice@example.com".to_string(), "bob@example.com".to_string()],
                b"Subject: hello\r\n\r\nbody\r\n",
            )
            .await
            .unwrap();

        for user in ["alice@example.com", "bob@example.com"] {
            let items = store.find(user, "INBOX", &SearchFilter::All).await.unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].subject.as_deref(), Some("hello"));
        }
    }

    #[tokio::test]
    async fn test_maildir_processor_rejects_path_tricks() {
        let dir = TempDir::new().unwrap();
        let processor = MaildirProcessor::new(Arc::new(MaildirStore::new(dir.path())));

        let result = processor
            .process_email("a@example.com", &["../escape@example.com".to_string()], b"x\r\n")
            .await;
        assert!(matches!(result, Err(MailError::Delivery(_))));
    }

    #[tokio::test]
    async fn test_no_relay_fails() {
        assert!(NoRelay
            .forward_email("a@example.com", &["b@example.com".to_string()], b"x")
            .await
            .is_err());
    }
}
