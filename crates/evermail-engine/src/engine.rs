//! Scheduler loop — polls for due schedules, materializes jobs, and hands
//! each schedule's due batch to a spawned dispatch pass.
//!
//! A tick stays short: it resolves windows, creates jobs, and returns.
//! Dispatch runs on spawned tasks guarded by the per-schedule
//! single-flight set, so one slow provider call never delays another
//! schedule's window resolution or cursor update. Job creation is an
//! upsert keyed on (schedule, recipient) and dispatch claims jobs with a
//! compare-and-swap, so overlapping or repeated ticks never duplicate a
//! send.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;

use evermail_core::config::{CampaignSettings, EvermailConfig};
use evermail_core::error::Result;
use evermail_core::traits::{JobStore, MailTransport};
use evermail_core::types::{CampaignStatus, Job, MessageVariant, Schedule};

use crate::dispatch::{DispatchOutcome, Dispatcher, RetryPolicy};
use crate::throttle::ThrottleGovernor;
use crate::variant;
use crate::windows::{self, WindowDecision};

/// Counters from one scheduling pass. `tick` fills the materialization
/// side; the dispatch counters come from [`SchedulerEngine::drain`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub schedules_seen: usize,
    pub jobs_created: u64,
    pub sent: u64,
    pub requeued: u64,
    pub failed: u64,
    pub suppressed: u64,
    pub skipped: u64,
    pub recovered: u32,
}

impl TickReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent => self.sent += 1,
            DispatchOutcome::Requeued => self.requeued += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Suppressed => self.suppressed += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: TickReport) {
        self.schedules_seen += other.schedules_seen;
        self.jobs_created += other.jobs_created;
        self.sent += other.sent;
        self.requeued += other.requeued;
        self.failed += other.failed;
        self.suppressed += other.suppressed;
        self.skipped += other.skipped;
        self.recovered += other.recovered;
    }
}

/// The long-running scheduling engine. Shared behind an `Arc`; `run`
/// loops on the configured tick cadence, `tick` does one pass.
pub struct SchedulerEngine {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    config: EvermailConfig,
    /// Schedule ids with a dispatch pass in flight. A schedule still
    /// being worked when the next tick fires is skipped, not run twice.
    in_flight: Mutex<HashSet<String>>,
    /// Handles of spawned dispatch passes, reaped between ticks and
    /// awaited by `drain`.
    pending: Mutex<Vec<JoinHandle<TickReport>>>,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn MailTransport>,
        config: EvermailConfig,
    ) -> Self {
        let governor = Arc::new(ThrottleGovernor::new(config.engine.global_per_minute));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            transport,
            governor,
            RetryPolicy::from_engine(&config.engine),
            Duration::from_secs(config.engine.send_timeout_secs),
        ));
        Self {
            store,
            dispatcher,
            config,
            in_flight: Mutex::new(HashSet::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Poll loop. Ticks every `tick_interval_secs` until the task is
    /// dropped or aborted.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.engine.tick_interval_secs.max(1),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            "🔁 Scheduler running, tick every {}s, {} workers",
            self.config.engine.tick_interval_secs,
            self.config.engine.workers
        );
        loop {
            interval.tick().await;
            self.reap().await;
            match self.clone().tick(Utc::now()).await {
                Ok(report) if report.schedules_seen > 0 => {
                    tracing::info!(
                        "✅ Tick: {} schedules, {} jobs created, {} recovered",
                        report.schedules_seen,
                        report.jobs_created,
                        report.recovered
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("❌ Tick failed: {e}"),
            }
        }
    }

    /// One scheduling pass at `now`. Returns once every due schedule has
    /// been resolved and its jobs materialized; the dispatch passes run
    /// on spawned tasks.
    pub async fn tick(self: Arc<Self>, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let cutoff = now - chrono::Duration::seconds(self.config.engine.job_recovery_secs as i64);
        report.recovered = self.store.recover_stuck_jobs(cutoff)?;
        if report.recovered > 0 {
            tracing::warn!("⚠️ Recovered {} stale running jobs", report.recovered);
        }

        for schedule in self.store.find_due_schedules(now)? {
            if !self.lock_schedule(&schedule.id) {
                tracing::debug!("⏳ Schedule {} still in flight, skipping", schedule.id);
                continue;
            }
            report.schedules_seen += 1;
            match self.prepare_schedule(&schedule, now) {
                Ok(Some((settings, variants, created))) => {
                    report.jobs_created += created;
                    Self::spawn_dispatch(&self, schedule, settings, variants, now);
                }
                Ok(None) => self.unlock_schedule(&schedule.id),
                Err(e) => {
                    self.unlock_schedule(&schedule.id);
                    tracing::error!("❌ Schedule {} pass failed: {e}", schedule.id);
                }
            }
        }
        Ok(report)
    }

    /// Await every spawned dispatch pass and return the summed outcome
    /// counters. Used by the one-shot tick command and by tests; the
    /// daemon loop reaps finished passes instead.
    pub async fn drain(&self) -> TickReport {
        let handles: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        let mut total = TickReport::default();
        for handle in handles {
            if let Ok(report) = handle.await {
                total.merge(report);
            }
        }
        total
    }

    /// Release finished dispatch passes without blocking on the ones
    /// still running.
    async fn reap(&self) {
        let finished: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let mut finished = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].is_finished() {
                    finished.push(pending.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            finished
        };
        for handle in finished {
            handle.await.ok();
        }
    }

    /// Everything that must happen before dispatch, kept cheap: pause
    /// check, window decision, and idempotent job creation. Returns None
    /// when the schedule was deferred or completed instead.
    fn prepare_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Option<(CampaignSettings, Vec<MessageVariant>, u64)>> {
        let settings = self.config.settings_for(&schedule.campaign_id);

        // Pause is checked at the campaign record and the config, both.
        let campaign_paused = matches!(
            self.store.campaign_status(&schedule.campaign_id)?,
            Some(CampaignStatus::Paused)
        );
        if campaign_paused || settings.paused {
            tracing::info!("🚫 Campaign {} paused, deferring", schedule.campaign_id);
            self.defer(schedule, now + self.tick_cadence())?;
            return Ok(None);
        }

        match windows::resolve(schedule, &settings, now)? {
            WindowDecision::Defer(at) => {
                tracing::debug!("⏳ Schedule {} deferred to {at}", schedule.id);
                self.defer(schedule, at)?;
                return Ok(None);
            }
            WindowDecision::WindowClosed => {
                tracing::info!("✅ Schedule {} window closed, completing", schedule.id);
                self.store
                    .set_schedule_status(&schedule.id, CampaignStatus::Completed)?;
                return Ok(None);
            }
            WindowDecision::SendNow => {}
        }

        let variants = self.store.variants(&schedule.template_id)?;
        if variants.is_empty() {
            tracing::warn!(
                "⚠️ Template {} has no variants, deferring schedule {}",
                schedule.template_id,
                schedule.id
            );
            self.defer(schedule, now + self.tick_cadence())?;
            return Ok(None);
        }

        let created = self.materialize_jobs(schedule, &variants, now)?;

        if schedule.status != CampaignStatus::Sending {
            self.store
                .set_schedule_status(&schedule.id, CampaignStatus::Sending)?;
        }
        if matches!(
            self.store.campaign_status(&schedule.campaign_id)?,
            Some(CampaignStatus::Scheduled)
        ) {
            self.store
                .set_campaign_status(&schedule.campaign_id, CampaignStatus::Sending)?;
        }

        Ok(Some((settings, variants, created)))
    }

    /// Hand the schedule's due batch to a spawned task. The task owns
    /// the single-flight lock until its cursor update lands.
    fn spawn_dispatch(
        this: &Arc<Self>,
        schedule: Schedule,
        settings: CampaignSettings,
        variants: Vec<MessageVariant>,
        now: DateTime<Utc>,
    ) {
        let engine = Arc::clone(this);
        let handle = tokio::spawn(async move {
            let mut report = TickReport::default();
            if let Err(e) = engine
                .dispatch_batch(&schedule, &settings, &variants, now, &mut report)
                .await
            {
                tracing::error!("❌ Schedule {} dispatch failed: {e}", schedule.id);
            }
            if let Err(e) = engine.advance_cursor(&schedule, now) {
                tracing::error!("❌ Schedule {} cursor update failed: {e}", schedule.id);
            }
            if report.sent + report.requeued + report.failed + report.suppressed > 0 {
                tracing::info!(
                    "📨 Schedule {}: {} sent, {} requeued, {} failed, {} suppressed",
                    schedule.id,
                    report.sent,
                    report.requeued,
                    report.failed,
                    report.suppressed
                );
            }
            engine.unlock_schedule(&schedule.id);
            report
        });
        this.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Create pending jobs for every sendable recipient of the audience
    /// group that does not have one yet. Variant assignment is stable per
    /// recipient id; the upsert ignores pairs that already exist.
    fn materialize_jobs(
        &self,
        schedule: &Schedule,
        variants: &[MessageVariant],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut created = 0u64;
        for recipient in self.store.find_recipients(&schedule.group_id)? {
            if !recipient.is_sendable() {
                continue;
            }
            let Some(variant) = variant::assign(&recipient.id, variants) else {
                continue;
            };
            let (_, was_created) =
                self.store
                    .upsert_job(&schedule.id, &recipient, &variant.label, now)?;
            if was_created {
                created += 1;
            }
        }
        if created > 0 {
            tracing::info!("📨 Schedule {}: {} new jobs", schedule.id, created);
        }
        Ok(created)
    }

    /// Dispatch due jobs for one schedule on the worker pool.
    async fn dispatch_batch(
        &self,
        schedule: &Schedule,
        settings: &CampaignSettings,
        variants: &[MessageVariant],
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let due = self
            .store
            .due_jobs(&schedule.id, now, self.config.engine.batch_limit)?;
        let workers = self.config.engine.workers.max(1);

        let outcomes: Vec<Result<DispatchOutcome>> = stream::iter(due)
            .map(|job| self.dispatch_one(job, schedule, settings, variants))
            .buffer_unordered(workers)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(e) => tracing::error!("❌ Dispatch error on schedule {}: {e}", schedule.id),
            }
        }
        Ok(())
    }

    async fn dispatch_one(
        &self,
        job: Job,
        schedule: &Schedule,
        settings: &CampaignSettings,
        variants: &[MessageVariant],
    ) -> Result<DispatchOutcome> {
        let Some(recipient) = self.store.load_recipient(&job.recipient_id)? else {
            tracing::warn!("⚠️ Job {} references missing recipient, skipping", job.id);
            return Ok(DispatchOutcome::Skipped);
        };
        // The job pins the variant label; fall back to assignment only if
        // the stored label vanished from the template.
        let variant = variants
            .iter()
            .find(|v| v.label == job.variant)
            .or_else(|| variant::assign(&recipient.id, variants));
        let Some(variant) = variant else {
            return Ok(DispatchOutcome::Skipped);
        };
        self.dispatcher
            .dispatch(&job, &schedule.campaign_id, settings, &recipient, variant)
            .await
    }

    /// After a dispatch pass: completed schedules stop or re-arm,
    /// unfinished ones poll again next tick.
    fn advance_cursor(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
        let mut updated = schedule.clone();
        updated.last_run_at = Some(now);
        updated.status = CampaignStatus::Sending;

        if self.store.unsent_count(&schedule.id)? == 0 {
            // Jobs for recipients suppressed since creation must not be
            // left pending forever.
            let closed = self.store.close_unsendable_jobs(&schedule.id)?;
            if closed > 0 {
                tracing::info!(
                    "🚫 Schedule {}: closed {} jobs for unsendable recipients",
                    schedule.id,
                    closed
                );
            }
            if let Some(mins) = schedule.repeat_interval_mins {
                updated.status = CampaignStatus::Scheduled;
                updated.next_run_at = Some(now + chrono::Duration::minutes(i64::from(mins)));
                tracing::info!(
                    "🔁 Schedule {} re-armed for {}",
                    schedule.id,
                    updated.next_run_at.unwrap_or(now)
                );
            } else {
                updated.status = CampaignStatus::Completed;
                updated.next_run_at = None;
                tracing::info!("✅ Schedule {} completed", schedule.id);
            }
        } else {
            updated.next_run_at = Some(now + self.tick_cadence());
        }
        self.store.update_schedule(&updated)
    }

    fn defer(&self, schedule: &Schedule, until: DateTime<Utc>) -> Result<()> {
        let mut updated = schedule.clone();
        updated.next_run_at = Some(until);
        self.store.update_schedule(&updated)
    }

    fn tick_cadence(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.engine.tick_interval_secs.max(1) as i64)
    }

    fn lock_schedule(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string())
    }

    fn unlock_schedule(&self, id: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use evermail_core::error::DeliveryError;
    use evermail_core::types::{Campaign, Receipt, Recipient, RenderedMessage};

    use crate::persistence::SqliteJobStore;

    struct CountingTransport {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: true,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MailTransport for CountingTransport {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(
            &self,
            message: &RenderedMessage,
        ) -> std::result::Result<Receipt, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DeliveryError::Transient("mx unreachable".into()))
            } else {
                Ok(Receipt {
                    message_id: format!("msg-{}", message.to),
                })
            }
        }
    }

    fn seeded_store(recipients: usize, variant_count: usize) -> Arc<SqliteJobStore> {
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        store
            .save_campaign(&Campaign {
                id: "camp-1".into(),
                name: "Spring launch".into(),
                status: CampaignStatus::Scheduled,
            })
            .unwrap();
        store
            .save_schedule(&Schedule {
                id: "sched-1".into(),
                campaign_id: "camp-1".into(),
                template_id: "tpl-1".into(),
                group_id: "grp-1".into(),
                step_order: 1,
                send_at: None,
                smart_window_start: None,
                smart_window_end: None,
                time_zone: "America/Vancouver".into(),
                next_run_at: Some(Utc::now() - chrono::Duration::minutes(1)),
                status: CampaignStatus::Scheduled,
                last_run_at: None,
                repeat_interval_mins: None,
            })
            .unwrap();
        for i in 0..recipients {
            store
                .save_recipient(
                    "grp-1",
                    &Recipient {
                        id: format!("biz-{i:04}"),
                        email: format!("owner{i}@northcoast.ca"),
                        name: Some(format!("Owner {i}")),
                        unsubscribed: false,
                        suppressed: false,
                    },
                )
                .unwrap();
        }
        for v in 0..variant_count {
            store
                .save_variant(
                    "tpl-1",
                    &MessageVariant {
                        label: char::from(b'A' + v as u8).to_string(),
                        subject: format!("Hello {{{{ name }}}} ({v})"),
                        html_body: "<p>Hi {{ name }}</p>".into(),
                        text_body: None,
                    },
                )
                .unwrap();
        }
        store
    }

    fn engine(
        store: Arc<SqliteJobStore>,
        transport: Arc<CountingTransport>,
    ) -> Arc<SchedulerEngine> {
        let mut config = EvermailConfig::default();
        config.engine.global_per_minute = 10_000;
        config.defaults.throttle_per_minute = 10_000;
        config.defaults.default_domain_cap = 10_000;
        Arc::new(SchedulerEngine::new(store, transport, config))
    }

    #[tokio::test]
    async fn test_full_pass_creates_and_sends_all_jobs() {
        let store = seeded_store(5, 2);
        let transport = CountingTransport::ok();
        let engine = engine(store.clone(), transport.clone());

        let report = engine.clone().tick(Utc::now()).await.unwrap();
        assert_eq!(report.schedules_seen, 1);
        assert_eq!(report.jobs_created, 5);

        let totals = engine.drain().await;
        assert_eq!(totals.sent, 5);
        assert_eq!(transport.calls(), 5);

        // Every job carries one of the two variant labels, deterministically.
        let jobs = store.jobs_for_schedule("sched-1").unwrap();
        assert_eq!(jobs.len(), 5);
        assert!(jobs.iter().all(|j| j.variant == "A" || j.variant == "B"));

        // All sent and no repeat interval: the schedule is done.
        let sched = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(sched.status, CampaignStatus::Completed);
        assert_eq!(sched.next_run_at, None);
    }

    #[tokio::test]
    async fn test_tick_returns_before_dispatch_settles() {
        let store = seeded_store(3, 1);
        let transport = CountingTransport::ok();
        let engine = engine(store.clone(), transport.clone());

        let report = engine.clone().tick(Utc::now()).await.unwrap();
        // Materialization is reported by the tick itself; the dispatch
        // outcome only by drain.
        assert_eq!(report.jobs_created, 3);
        assert_eq!(report.sent, 0);

        let totals = engine.drain().await;
        assert_eq!(totals.sent, 3);
    }

    #[tokio::test]
    async fn test_second_tick_is_idempotent() {
        let store = seeded_store(3, 1);
        let transport = CountingTransport::ok();
        let engine = engine(store.clone(), transport.clone());

        engine.clone().tick(Utc::now()).await.unwrap();
        engine.drain().await;
        let second = engine.clone().tick(Utc::now()).await.unwrap();
        engine.drain().await;

        // Completed schedules are no longer due; no job is re-sent.
        assert_eq!(second.schedules_seen, 0);
        assert_eq!(transport.calls(), 3);
        assert_eq!(store.jobs_for_schedule("sched-1").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_paused_campaign_defers_without_sending() {
        let store = seeded_store(3, 1);
        let transport = CountingTransport::ok();
        let mut config = EvermailConfig::default();
        config.defaults.paused = true;
        let engine = Arc::new(SchedulerEngine::new(store.clone(), transport.clone(), config));

        let report = engine.clone().tick(Utc::now()).await.unwrap();
        engine.drain().await;
        assert_eq!(report.jobs_created, 0);
        assert_eq!(transport.calls(), 0);
        // Deferred, not completed.
        let sched = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(sched.status, CampaignStatus::Scheduled);
        assert!(sched.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_smart_window_completes_schedule() {
        let store = seeded_store(2, 1);
        let transport = CountingTransport::ok();
        let mut sched = store.load_schedule("sched-1").unwrap().unwrap();
        sched.smart_window_start = Some(Utc::now() - chrono::Duration::hours(3));
        sched.smart_window_end = Some(Utc::now() - chrono::Duration::hours(1));
        store.save_schedule(&sched).unwrap();

        let engine = engine(store.clone(), transport.clone());
        engine.clone().tick(Utc::now()).await.unwrap();
        engine.drain().await;

        assert_eq!(transport.calls(), 0);
        let sched = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(sched.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn test_repeat_interval_rearms_after_completion() {
        let store = seeded_store(2, 1);
        let transport = CountingTransport::ok();
        let mut sched = store.load_schedule("sched-1").unwrap().unwrap();
        sched.repeat_interval_mins = Some(30);
        store.save_schedule(&sched).unwrap();

        let engine = engine(store.clone(), transport.clone());
        let now = Utc::now();
        engine.clone().tick(now).await.unwrap();
        engine.drain().await;

        let sched = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(sched.status, CampaignStatus::Scheduled);
        let next = sched.next_run_at.unwrap();
        assert!(next >= now + chrono::Duration::minutes(29));
        assert!(next <= now + chrono::Duration::minutes(31));
    }

    #[tokio::test]
    async fn test_unsubscribed_recipient_gets_no_job() {
        let store = seeded_store(3, 1);
        store
            .save_recipient(
                "grp-1",
                &Recipient {
                    id: "biz-gone".into(),
                    email: "gone@northcoast.ca".into(),
                    name: None,
                    unsubscribed: true,
                    suppressed: false,
                },
            )
            .unwrap();
        let transport = CountingTransport::ok();
        let engine = engine(store.clone(), transport.clone());

        let report = engine.clone().tick(Utc::now()).await.unwrap();
        engine.drain().await;
        assert_eq!(report.jobs_created, 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_bounced_recipient_excluded_from_next_step() {
        let store = seeded_store(2, 1);
        let transport = CountingTransport::ok();
        let engine = engine(store.clone(), transport.clone());
        engine.clone().tick(Utc::now()).await.unwrap();
        engine.drain().await;

        // One recipient hard-bounces on step 1.
        let job = store.jobs_for_schedule("sched-1").unwrap().remove(0);
        let dyn_store: Arc<dyn JobStore> = store.clone();
        crate::events::record_event(
            &dyn_store,
            &job.id,
            evermail_core::types::EventKind::Bounced,
            Utc::now(),
            serde_json::json!({}),
        )
        .unwrap();

        // Step 2 targets the same group; the bounced recipient gets no job.
        let mut step2 = store.load_schedule("sched-1").unwrap().unwrap();
        step2.id = "sched-2".into();
        step2.step_order = 2;
        step2.status = CampaignStatus::Scheduled;
        step2.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.save_schedule(&step2).unwrap();
        store
            .set_campaign_status("camp-1", CampaignStatus::Sending)
            .unwrap();

        let report = engine.clone().tick(Utc::now()).await.unwrap();
        engine.drain().await;
        assert_eq!(report.jobs_created, 1);
        assert_eq!(store.jobs_for_schedule("sched-2").unwrap().len(), 1);
        assert_ne!(
            store.jobs_for_schedule("sched-2").unwrap()[0].recipient_id,
            job.recipient_id
        );
    }

    #[tokio::test]
    async fn test_transient_failures_requeue_and_schedule_stays_open() {
        let store = seeded_store(2, 1);
        let transport = CountingTransport::failing();
        let engine = engine(store.clone(), transport.clone());

        engine.clone().tick(Utc::now()).await.unwrap();
        let totals = engine.drain().await;
        assert_eq!(totals.sent, 0);
        assert_eq!(totals.requeued, 2);

        // Unsent work remains, so the schedule polls again instead of
        // completing.
        let sched = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(sched.status, CampaignStatus::Sending);
        assert!(sched.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_operator_pause_survives_in_flight_pass() {
        let store = seeded_store(2, 1);
        let transport = CountingTransport::ok();
        let engine = engine(store.clone(), transport.clone());

        engine.clone().tick(Utc::now()).await.unwrap();
        // Pause lands while the dispatch pass may still be running; its
        // cursor update must not flip the schedule back.
        store
            .set_schedule_status("sched-1", CampaignStatus::Paused)
            .unwrap();
        engine.drain().await;

        let sched = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(sched.status, CampaignStatus::Paused);
    }
}
