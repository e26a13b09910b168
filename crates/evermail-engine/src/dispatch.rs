//! Dispatcher — takes one claimed job through concurrency slot, throttle
//! tokens, the provider send call, and outcome persistence.
//!
//! Every attempt is persisted before the concurrency slot is released,
//! so a crash mid-dispatch cannot silently duplicate a send on restart:
//! job creation is idempotent and stale RUNNING jobs are recovered by
//! the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use evermail_core::config::{CampaignSettings, EngineConfig};
use evermail_core::error::{DeliveryError, Result};
use evermail_core::traits::{JobStore, MailTransport};
use evermail_core::types::{Job, JobStatus, MessageVariant, Recipient};

use crate::throttle::{ThrottleDecision, ThrottleGovernor};

/// Backoff parameters for transient delivery failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_secs(config.base_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }

    /// `min(max_backoff, base * 2^attempts)` plus up to 25% jitter so a
    /// burst of failures does not retry in lockstep.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.min(20);
        let base = self
            .base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        base.mul_f64(1.0 + jitter).min(self.max_backoff)
    }
}

/// What happened to one job on one pass through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Throttled or transiently failed — pending again at a later
    /// `scheduled_for`.
    Requeued,
    /// Transient failures exhausted `max_attempts`.
    Failed,
    /// Permanent failure; recipient suppressed for all future schedules.
    Suppressed,
    /// Another worker owns the job, or the campaign is paused. Not an
    /// error.
    Skipped,
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    transport: Arc<dyn MailTransport>,
    governor: Arc<ThrottleGovernor>,
    retry: RetryPolicy,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn MailTransport>,
        governor: Arc<ThrottleGovernor>,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            governor,
            retry,
            send_timeout,
        }
    }

    /// Dispatch one job. The caller resolved the recipient and the
    /// assigned variant's content; this method owns claiming, throttling,
    /// the send itself, and persisting the outcome.
    pub async fn dispatch(
        &self,
        job: &Job,
        campaign_id: &str,
        settings: &CampaignSettings,
        recipient: &Recipient,
        variant: &MessageVariant,
    ) -> Result<DispatchOutcome> {
        // Pause is observed before every dispatch attempt.
        if settings.paused {
            return Ok(DispatchOutcome::Skipped);
        }

        // Suppression may have landed after the job was created.
        if !recipient.is_sendable() {
            let mut updated = job.clone();
            updated.status = JobStatus::Suppressed;
            updated.last_error = Some("recipient suppressed or unsubscribed".into());
            self.store.update_job(&updated)?;
            return Ok(DispatchOutcome::Suppressed);
        }

        // Claim the job; losing the CAS means another worker owns it.
        if !self
            .store
            .claim_job(&job.id, JobStatus::Pending, JobStatus::Running)?
        {
            return Ok(DispatchOutcome::Skipped);
        }

        // Concurrency slot, bounded wait.
        let semaphore = self.governor.concurrency(campaign_id, settings);
        let permit = match tokio::time::timeout(self.send_timeout, semaphore.acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                // No slot came free — requeue untouched for the next pass.
                return self.requeue(job, Duration::from_secs(5), None);
            }
        };

        // Throttle tokens at all scopes, all-or-nothing.
        match self
            .governor
            .try_acquire(campaign_id, settings, recipient.domain())
        {
            ThrottleDecision::Granted => {}
            ThrottleDecision::Denied { scope, retry_after } => {
                tracing::debug!(
                    "⏳ Throttled at {} scope: job {} retries in {:?}",
                    scope,
                    job.id,
                    retry_after
                );
                drop(permit);
                return self.requeue(job, retry_after, None);
            }
        }

        let message = variant.render(recipient);
        let outcome = tokio::time::timeout(self.send_timeout, self.transport.send(&message))
            .await
            .unwrap_or_else(|_| {
                Err(DeliveryError::Transient(format!(
                    "send timed out after {:?}",
                    self.send_timeout
                )))
            });

        // Persist before the permit drops.
        let result = match outcome {
            Ok(receipt) => {
                let mut updated = job.clone();
                updated.status = JobStatus::Sent;
                updated.attempts = job.attempts + 1;
                updated.sent_at = Some(Utc::now());
                updated.last_error = None;
                self.store.update_job(&updated)?;
                tracing::info!(
                    "📨 Sent job {} to {} via {} (message {})",
                    job.id,
                    recipient.email,
                    self.transport.name(),
                    receipt.message_id
                );
                Ok(DispatchOutcome::Sent)
            }
            Err(DeliveryError::Permanent(reason)) => {
                let mut updated = job.clone();
                updated.status = JobStatus::Suppressed;
                updated.attempts = job.attempts + 1;
                updated.last_error = Some(reason.clone());
                self.store.update_job(&updated)?;
                self.store.suppress_recipient(&recipient.id)?;
                tracing::warn!(
                    "🚫 Permanent failure for {}: {} — recipient suppressed",
                    recipient.email,
                    reason
                );
                Ok(DispatchOutcome::Suppressed)
            }
            Err(DeliveryError::Transient(reason)) => {
                let attempts = job.attempts + 1;
                if attempts >= self.retry.max_attempts {
                    let mut updated = job.clone();
                    updated.status = JobStatus::Failed;
                    updated.attempts = attempts;
                    updated.last_error = Some(reason.clone());
                    self.store.update_job(&updated)?;
                    tracing::error!(
                        "❌ Job {} failed after {} attempts: {}",
                        job.id,
                        attempts,
                        reason
                    );
                    Ok(DispatchOutcome::Failed)
                } else {
                    let backoff = self.retry.backoff(attempts);
                    tracing::warn!(
                        "🔁 Transient failure for job {} (attempt {}): {} — retrying in {:?}",
                        job.id,
                        attempts,
                        reason,
                        backoff
                    );
                    self.requeue_with_attempt(job, backoff, attempts, Some(reason))
                }
            }
        };
        drop(permit);
        result
    }

    /// Running → pending at `now + delay`, attempts untouched (throttle
    /// denial is not a failure).
    fn requeue(
        &self,
        job: &Job,
        delay: Duration,
        reason: Option<String>,
    ) -> Result<DispatchOutcome> {
        self.requeue_with_attempt(job, delay, job.attempts, reason)
    }

    fn requeue_with_attempt(
        &self,
        job: &Job,
        delay: Duration,
        attempts: u32,
        reason: Option<String>,
    ) -> Result<DispatchOutcome> {
        let mut updated = job.clone();
        updated.status = JobStatus::Pending;
        updated.attempts = attempts;
        updated.scheduled_for = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        if reason.is_some() {
            updated.last_error = reason;
        }
        self.store.update_job(&updated)?;
        Ok(DispatchOutcome::Requeued)
    }
}
