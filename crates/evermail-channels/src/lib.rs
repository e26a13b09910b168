//! # Evermail Channels
//! Mail transport implementations behind the engine's send seam.
//!
//! - `smtp` relays through an SMTP server (lettre)
//! - `http_api` posts to a SendGrid-shaped JSON API (reqwest)
//! - `log` is the dry-run transport that only logs

pub mod http_api;
pub mod log;
pub mod smtp;

use std::sync::Arc;

use evermail_core::config::TransportConfig;
use evermail_core::error::{EvermailError, Result};
use evermail_core::traits::MailTransport;

/// Build the configured transport.
pub fn build_transport(config: &TransportConfig) -> Result<Arc<dyn MailTransport>> {
    match config.kind.as_str() {
        "smtp" => Ok(Arc::new(smtp::SmtpTransport::new(config.smtp.clone())?)),
        "http" => Ok(Arc::new(http_api::HttpApiTransport::new(
            config.http.clone(),
        )?)),
        "log" => Ok(Arc::new(log::LogTransport::default())),
        other => Err(EvermailError::Config(format!(
            "unknown transport kind '{other}' (expected smtp, http, or log)"
        ))),
    }
}
