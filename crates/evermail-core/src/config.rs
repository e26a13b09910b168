//! Evermail configuration system.
//!
//! Loaded once from `~/.evermail/config.toml`; the scheduler loop takes an
//! immutable snapshot of the relevant [`CampaignSettings`] at the start of
//! every tick, so an admin edit never half-applies to a pass in flight.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{EvermailError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvermailConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    /// Settings applied to campaigns with no explicit entry.
    #[serde(default)]
    pub defaults: CampaignSettings,
    /// Per-campaign overrides, keyed by campaign id.
    #[serde(default)]
    pub campaigns: HashMap<String, CampaignSettings>,
}

impl EvermailConfig {
    /// Load config from the default path, falling back to defaults when
    /// the file does not exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EvermailError::Config(format!("read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EvermailError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| EvermailError::Config(format!("serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".evermail")
    }

    /// Immutable settings snapshot for one campaign.
    pub fn settings_for(&self, campaign_id: &str) -> CampaignSettings {
        self.campaigns
            .get(campaign_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    fn validate(&self) -> Result<()> {
        for (id, settings) in
            std::iter::once(("defaults", &self.defaults)).chain(self.campaigns.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if settings.throttle_per_minute == 0 {
                return Err(EvermailError::Config(format!(
                    "campaign '{id}': throttle_per_minute must be at least 1"
                )));
            }
            if settings.max_concurrent == 0 {
                return Err(EvermailError::Config(format!(
                    "campaign '{id}': max_concurrent must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Scheduler/dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Poll cadence of the scheduler loop, seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Size of the global dispatch worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Timeout around one provider send call.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// RUNNING jobs older than this are treated as crashed and retried.
    #[serde(default = "default_recovery")]
    pub job_recovery_secs: u64,
    /// Transient failures beyond this become terminal FAILED.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// System-wide sends per minute across all campaigns.
    #[serde(default = "default_global_per_minute")]
    pub global_per_minute: u32,
    /// Max jobs handed to the worker pool per schedule per tick.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_tick_interval() -> u64 {
    60
}
fn default_workers() -> usize {
    4
}
fn default_send_timeout() -> u64 {
    30
}
fn default_recovery() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff() -> u64 {
    60
}
fn default_max_backoff() -> u64 {
    3600
}
fn default_global_per_minute() -> u32 {
    600
}
fn default_batch_limit() -> usize {
    200
}
fn default_db_path() -> String {
    "~/.evermail/evermail.db".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            workers: default_workers(),
            send_timeout_secs: default_send_timeout(),
            job_recovery_secs: default_recovery(),
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            global_per_minute: default_global_per_minute(),
            batch_limit: default_batch_limit(),
            db_path: default_db_path(),
        }
    }
}

/// Which transport the binary wires in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// "smtp", "http", or "log" (dry-run).
    #[serde(default = "default_transport_kind")]
    pub kind: String,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub http: HttpApiConfig,
}

fn default_transport_kind() -> String {
    "log".into()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            smtp: SmtpConfig::default(),
            http: HttpApiConfig::default(),
        }
    }
}

/// SMTP relay settings (lettre).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from() -> String {
    "Evermail <noreply@example.com>".into()
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: default_from(),
        }
    }
}

/// JSON HTTP provider settings (SendGrid-shaped API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_from")]
    pub from: String,
}

fn default_api_url() -> String {
    "https://api.sendgrid.com/v3/mail/send".into()
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            api_key: String::new(),
            from: default_from(),
        }
    }
}

/// Per-campaign throttle and window settings. Read once per scheduling
/// pass; mutated only by an external admin action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSettings {
    /// Daily send windows in the schedule's local time. Empty = always
    /// open.
    #[serde(default)]
    pub windows: Vec<SendWindow>,
    /// Quiet-hour intervals. Take precedence over windows.
    #[serde(default)]
    pub quiet_hours: Vec<SendWindow>,
    /// Campaign-wide token rate, sends per minute.
    #[serde(default = "default_throttle")]
    pub throttle_per_minute: u32,
    /// In-flight dispatch cap for this campaign.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-recipient-domain caps, sends per minute.
    #[serde(default)]
    pub per_domain: HashMap<String, u32>,
    /// Cap applied to domains not listed in `per_domain`.
    #[serde(default = "default_domain_cap")]
    pub default_domain_cap: u32,
    #[serde(default)]
    pub paused: bool,
}

fn default_throttle() -> u32 {
    60
}
fn default_max_concurrent() -> usize {
    4
}
fn default_domain_cap() -> u32 {
    30
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            windows: Vec::new(),
            quiet_hours: Vec::new(),
            throttle_per_minute: default_throttle(),
            max_concurrent: default_max_concurrent(),
            per_domain: HashMap::new(),
            default_domain_cap: default_domain_cap(),
            paused: false,
        }
    }
}

impl CampaignSettings {
    /// Rate cap for one recipient domain.
    pub fn domain_cap(&self, domain: &str) -> u32 {
        self.per_domain
            .get(domain)
            .copied()
            .unwrap_or(self.default_domain_cap)
    }
}

/// A daily local-time interval. `start > end` wraps past midnight
/// (e.g. 22:00–06:00).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SendWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl SendWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether a local time falls inside this interval, wrap-around
    /// included. Boundaries: start inclusive, end exclusive.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Serde helper: "HH:MM" (also accepts "HH:MM:SS").
mod hhmm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(de)?;
        NaiveTime::parse_from_str(&s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(|e| serde::de::Error::custom(format!("bad time '{s}': {e}")))
    }
}
