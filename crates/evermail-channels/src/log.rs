//! Dry-run transport — logs each message instead of sending it. The
//! default when no real provider is configured, and handy for rehearsing
//! a campaign.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use evermail_core::error::DeliveryError;
use evermail_core::traits::MailTransport;
use evermail_core::types::{Receipt, RenderedMessage};

#[derive(Default)]
pub struct LogTransport {
    sent: AtomicU64,
}

impl LogTransport {
    /// Messages "sent" so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &RenderedMessage) -> Result<Receipt, DeliveryError> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "📧 [dry-run #{n}] to={} subject={:?}",
            message.to,
            message.subject
        );
        Ok(Receipt {
            message_id: format!("dry-run-{n}"),
        })
    }
}
