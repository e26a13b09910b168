//! Seams between the engine and its external collaborators: the durable
//! job store and the mail provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DeliveryError, Result};
use crate::types::{
    CampaignStatus, EngagementEvent, EventKind, Job, JobStatus, MessageVariant, Recipient,
    Receipt, RenderedMessage, Schedule,
};

/// Durable store for schedules, recipients, jobs, and events.
///
/// Methods are synchronous — the bundled SQLite adapter does cheap local
/// work and is called from inside tokio tasks. Job status transitions are
/// the unit of consistency: `claim_job` must be a compare-and-swap so two
/// workers can never both own the same job.
pub trait JobStore: Send + Sync {
    /// Schedules with status scheduled/sending and `next_run_at <= now`.
    fn find_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>>;

    fn load_schedule(&self, id: &str) -> Result<Option<Schedule>>;

    /// Persist schedule cursor/status changes. `next_run_at` only moves
    /// forward; the adapter ignores attempts to move it back.
    fn update_schedule(&self, schedule: &Schedule) -> Result<()>;

    fn set_schedule_status(&self, id: &str, status: CampaignStatus) -> Result<()>;

    fn campaign_status(&self, campaign_id: &str) -> Result<Option<CampaignStatus>>;

    fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<()>;

    /// Audience membership for a group, suppressed recipients included —
    /// the scheduler filters them out per tick.
    fn find_recipients(&self, group_id: &str) -> Result<Vec<Recipient>>;

    /// Message variants of a template, in stable label order. The
    /// assigner indexes into this list, so the order must not change
    /// between ticks.
    fn variants(&self, template_id: &str) -> Result<Vec<MessageVariant>>;

    fn load_recipient(&self, id: &str) -> Result<Option<Recipient>>;

    /// Idempotent upsert keyed on (schedule_id, recipient_id). Returns
    /// the job and whether this call created it. The variant, once
    /// written, never changes for that pair.
    fn upsert_job(
        &self,
        schedule_id: &str,
        recipient: &Recipient,
        variant: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<(Job, bool)>;

    /// Compare-and-swap on status. Returns false when another worker got
    /// there first — a skip, not an error.
    fn claim_job(&self, job_id: &str, from: JobStatus, to: JobStatus) -> Result<bool>;

    /// Persist status/attempts/error/sent_at after a dispatch attempt.
    fn update_job(&self, job: &Job) -> Result<()>;

    fn load_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Pending jobs for a schedule whose `scheduled_for` has passed.
    fn due_jobs(&self, schedule_id: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Recipients of a schedule with no terminal job yet.
    fn unsent_count(&self, schedule_id: &str) -> Result<u64>;

    /// Append an engagement event. Returns false when a terminal kind
    /// already exists for the job (no-op).
    fn append_event(&self, event: &EngagementEvent) -> Result<bool>;

    fn has_event(&self, job_id: &str, kind: EventKind) -> Result<bool>;

    /// Flag a recipient so future schedules skip them.
    fn suppress_recipient(&self, recipient_id: &str) -> Result<()>;

    /// Close out pending jobs whose recipient was unsubscribed or
    /// suppressed after the job was created, so a finished schedule
    /// leaves no job without a terminal status. Returns how many were
    /// closed.
    fn close_unsendable_jobs(&self, schedule_id: &str) -> Result<u32>;

    /// RUNNING jobs older than `cutoff` are crash leftovers: flip them
    /// back to pending so the next tick retries them.
    fn recover_stuck_jobs(&self, cutoff: DateTime<Utc>) -> Result<u32>;
}

/// The injected send capability. Implementations live in
/// `evermail-channels` (SMTP, HTTP API); tests use fakes.
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &str;

    /// One delivery attempt. The dispatcher wraps this in a timeout and
    /// maps the error class onto retry/suppression.
    async fn send(&self, message: &RenderedMessage) -> std::result::Result<Receipt, DeliveryError>;
}
