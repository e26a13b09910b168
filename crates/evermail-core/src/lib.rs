//! # Evermail Core
//!
//! Shared foundation for the Evermail campaign delivery engine: the data
//! model (campaigns, schedules, jobs, engagement events), the TOML
//! configuration system, the error taxonomy, and the traits that seam the
//! engine off from its external collaborators (job store, mail provider).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{CampaignSettings, EngineConfig, EvermailConfig, SendWindow, TransportConfig};
pub use error::{DeliveryError, EvermailError, Result};
pub use traits::{JobStore, MailTransport};
pub use types::{
    Campaign, CampaignStatus, EngagementEvent, EventKind, Job, JobStatus, MessageVariant,
    Receipt, Recipient, RenderedMessage, Schedule,
};
