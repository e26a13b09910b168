//! Engagement recorder — folds provider feedback (deliveries, opens,
//! bounces, complaints, unsubscribes) into the store.
//!
//! Events are append-only; a terminal kind is recorded at most once per
//! job, and negative kinds suppress the recipient for all future
//! schedules.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use evermail_core::error::{EvermailError, Result};
use evermail_core::traits::JobStore;
use evermail_core::types::{EngagementEvent, EventKind};

/// What `record_event` did with one incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Recorded,
    /// A terminal kind already exists for this job; the report was
    /// dropped as a duplicate.
    Duplicate,
    /// Recorded, and the recipient was suppressed as a consequence.
    RecordedAndSuppressed,
}

/// Record one engagement event against a job.
///
/// Unknown job ids are an input error: feedback must always be tied to a
/// send this engine made.
pub fn record_event(
    store: &Arc<dyn JobStore>,
    job_id: &str,
    kind: EventKind,
    at: DateTime<Utc>,
    meta: serde_json::Value,
) -> Result<EventOutcome> {
    let Some(job) = store.load_job(job_id)? else {
        return Err(EvermailError::InvalidInput(format!(
            "event for unknown job '{job_id}'"
        )));
    };

    let event = EngagementEvent {
        job_id: job_id.to_string(),
        kind,
        at,
        meta,
    };
    if !store.append_event(&event)? {
        tracing::debug!("⏳ Duplicate {} event for job {job_id}, ignored", kind.as_str());
        return Ok(EventOutcome::Duplicate);
    }

    if kind.suppresses_recipient() {
        store.suppress_recipient(&job.recipient_id)?;
        tracing::warn!(
            "🚫 Recipient {} suppressed after {} on job {job_id}",
            job.recipient_id,
            kind.as_str()
        );
        return Ok(EventOutcome::RecordedAndSuppressed);
    }

    tracing::debug!("📨 Recorded {} for job {job_id}", kind.as_str());
    Ok(EventOutcome::Recorded)
}
