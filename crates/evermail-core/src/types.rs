//! Data model for campaigns, schedules, recipients, jobs, and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EvermailError, Result};

/// Campaign lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => CampaignStatus::Scheduled,
            "sending" => CampaignStatus::Sending,
            "paused" => CampaignStatus::Paused,
            "completed" => CampaignStatus::Completed,
            _ => CampaignStatus::Draft,
        }
    }
}

/// A campaign — owns zero or more schedule steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
}

/// One planned send event (a "step") of a campaign: one template, one
/// audience group, either a fixed `send_at` or a smart window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub campaign_id: String,
    pub template_id: String,
    pub group_id: String,
    pub step_order: u32,
    /// Fixed send time. Mutually exclusive with the smart window in
    /// practice; when both are set the fixed time wins.
    pub send_at: Option<DateTime<Utc>>,
    pub smart_window_start: Option<DateTime<Utc>>,
    pub smart_window_end: Option<DateTime<Utc>>,
    /// IANA timezone name, e.g. "America/Vancouver".
    pub time_zone: String,
    /// Polling cursor — only ever moves forward.
    pub next_run_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Recurring steps re-arm `next_run_at` this many minutes after a
    /// pass instead of completing.
    pub repeat_interval_mins: Option<u32>,
}

impl Schedule {
    /// Resolve the schedule's timezone, failing the tick on a bad name.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.time_zone
            .parse()
            .map_err(|_| EvermailError::Config(format!("unknown timezone '{}'", self.time_zone)))
    }
}

/// A recipient as seen by this engine. Validated at the store boundary:
/// `email` must contain a domain part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub unsubscribed: bool,
    /// Cross-schedule exclusion from bounce/complaint/unsubscribe.
    pub suppressed: bool,
}

impl Recipient {
    /// Domain part of the email, lowercased. Used as the per-domain
    /// throttle key.
    pub fn domain(&self) -> &str {
        self.email.rsplit('@').next().unwrap_or("")
    }

    /// Whether this recipient may still be targeted by new jobs.
    pub fn is_sendable(&self) -> bool {
        !self.unsubscribed && !self.suppressed && self.email.contains('@')
    }
}

/// Job status — the unit of consistency for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Sent,
    Failed,
    Suppressed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Sent => "sent",
            JobStatus::Failed => "failed",
            JobStatus::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "sent" => JobStatus::Sent,
            "failed" => JobStatus::Failed,
            "suppressed" => JobStatus::Suppressed,
            _ => JobStatus::Pending,
        }
    }

    /// Terminal states are never re-dispatched.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed | JobStatus::Suppressed)
    }
}

/// The send unit: one recipient's message for one schedule step.
/// At most one job exists per (schedule_id, recipient_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub schedule_id: String,
    pub recipient_id: String,
    pub recipient_email: String,
    /// Assigned variant label — never changes once assigned.
    pub variant: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Engagement event kinds reported by the provider or tracking surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complaint,
    Unsubscribed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Delivered => "delivered",
            EventKind::Opened => "opened",
            EventKind::Clicked => "clicked",
            EventKind::Bounced => "bounced",
            EventKind::Complaint => "complaint",
            EventKind::Unsubscribed => "unsubscribed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "delivered" => Ok(EventKind::Delivered),
            "opened" => Ok(EventKind::Opened),
            "clicked" => Ok(EventKind::Clicked),
            "bounced" => Ok(EventKind::Bounced),
            "complaint" => Ok(EventKind::Complaint),
            "unsubscribed" => Ok(EventKind::Unsubscribed),
            other => Err(EvermailError::InvalidInput(format!("unknown event kind '{other}'"))),
        }
    }

    /// Terminal kinds are recorded at most once per job; opens and
    /// clicks may repeat and are all retained.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventKind::Opened | EventKind::Clicked)
    }

    /// Kinds that flag the recipient as suppressed for all future
    /// schedules.
    pub fn suppresses_recipient(&self) -> bool {
        matches!(self, EventKind::Bounced | EventKind::Complaint | EventKind::Unsubscribed)
    }
}

/// An engagement event. Append-only — a job's derived engagement state
/// is the aggregate of its events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub job_id: String,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub meta: serde_json::Value,
}

/// One message rendering of a template (A/B/C testing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageVariant {
    /// Stable label, e.g. "A", "B".
    pub label: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

impl MessageVariant {
    /// Render for one recipient: `{{ name }}`, `{{ email }}`, and
    /// `{{ recipient_id }}` tokens are substituted in subject and bodies.
    pub fn render(&self, recipient: &Recipient) -> RenderedMessage {
        let name = recipient.name.clone().unwrap_or_else(|| "there".to_string());
        let ctx = [
            ("name", name.as_str()),
            ("email", recipient.email.as_str()),
            ("recipient_id", recipient.id.as_str()),
        ];
        RenderedMessage {
            to: recipient.email.clone(),
            subject: replace_tokens(&self.subject, &ctx),
            html: replace_tokens(&self.html_body, &ctx),
            text: self.text_body.as_deref().map(|t| replace_tokens(t, &ctx)),
        }
    }
}

/// A fully rendered message ready for a transport.
#[derive(Debug, Clone)]
pub struct RenderedMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub message_id: String,
}

/// Replace `{{key}}` / `{{ key }}` tokens.
fn replace_tokens(input: &str, ctx: &[(&str, &str)]) -> String {
    let mut out = input.to_string();
    for (key, value) in ctx {
        out = out
            .replace(&format!("{{{{{key}}}}}"), value)
            .replace(&format!("{{{{ {key} }}}}"), value);
    }
    out
}

pub fn new_job_id() -> String {
    format!("job-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(id: &str, email: &str) -> Recipient {
        Recipient {
            id: id.into(),
            email: email.into(),
            name: Some("Pat".into()),
            unsubscribed: false,
            suppressed: false,
        }
    }

    #[test]
    fn test_domain_extraction() {
        let r = recipient("b1", "owner@northcoast.ca");
        assert_eq!(r.domain(), "northcoast.ca");
    }

    #[test]
    fn test_render_substitutes_tokens() {
        let v = MessageVariant {
            label: "A".into(),
            subject: "Hello {{ name }}".into(),
            html_body: "<p>Hi {{name}}, reply to {{ email }}</p>".into(),
            text_body: None,
        };
        let msg = v.render(&recipient("b1", "owner@northcoast.ca"));
        assert_eq!(msg.subject, "Hello Pat");
        assert!(msg.html.contains("Hi Pat"));
        assert!(msg.html.contains("owner@northcoast.ca"));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Sent,
            JobStatus::Failed,
            JobStatus::Suppressed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_terminal_event_kinds() {
        assert!(EventKind::Bounced.is_terminal());
        assert!(!EventKind::Opened.is_terminal());
        assert!(EventKind::Unsubscribed.suppresses_recipient());
        assert!(!EventKind::Delivered.suppresses_recipient());
    }
}
