//! SQLite-backed job store — the bundled [`JobStore`] implementation.
//! Survives restarts and gives the engine its consistency primitives:
//! the (schedule, recipient) uniqueness constraint and compare-and-swap
//! status updates.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use evermail_core::error::{EvermailError, Result};
use evermail_core::traits::JobStore;
use evermail_core::types::{
    Campaign, CampaignStatus, EngagementEvent, EventKind, Job, JobStatus, MessageVariant,
    Recipient, Schedule,
};

/// SQLite persistence for campaigns, schedules, recipients, jobs, and
/// engagement events.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

fn store_err<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> EvermailError + '_ {
    move |e| EvermailError::Store(format!("{context}: {e}"))
}

impl SqliteJobStore {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(store_err("open"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err("open"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft'
            );

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                template_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                step_order INTEGER NOT NULL DEFAULT 1,
                send_at TEXT,
                smart_window_start TEXT,
                smart_window_end TEXT,
                time_zone TEXT NOT NULL DEFAULT 'America/Vancouver',
                next_run_at TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                last_run_at TEXT,
                repeat_interval_mins INTEGER
            );

            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                email TEXT NOT NULL,
                name TEXT,
                unsubscribed INTEGER NOT NULL DEFAULT 0,
                suppressed INTEGER NOT NULL DEFAULT 0
            );

            -- Template variants for A/B/C assignment.
            CREATE TABLE IF NOT EXISTS variants (
                template_id TEXT NOT NULL,
                label TEXT NOT NULL,
                subject TEXT NOT NULL,
                html_body TEXT NOT NULL,
                text_body TEXT,
                PRIMARY KEY (template_id, label)
            );

            -- The send units. At most one job per (schedule, recipient).
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                recipient_email TEXT NOT NULL,
                variant TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL,
                running_since TEXT,
                UNIQUE (schedule_id, recipient_id)
            );

            -- Engagement events, append-only.
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                at TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_schedule_status
                ON jobs (schedule_id, status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_events_job ON events (job_id, kind);
         ",
            )
            .map_err(store_err("migrate"))?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Admin helpers (seeding, control surface) ─────────────

    pub fn save_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO campaigns (id, name, status) VALUES (?1, ?2, ?3)",
                params![campaign.id, campaign.name, campaign.status.as_str()],
            )
            .map_err(store_err("save campaign"))?;
        Ok(())
    }

    pub fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO schedules
                 (id, campaign_id, template_id, group_id, step_order, send_at,
                  smart_window_start, smart_window_end, time_zone, next_run_at,
                  status, last_run_at, repeat_interval_mins)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    schedule.id,
                    schedule.campaign_id,
                    schedule.template_id,
                    schedule.group_id,
                    schedule.step_order,
                    schedule.send_at.map(|t| t.to_rfc3339()),
                    schedule.smart_window_start.map(|t| t.to_rfc3339()),
                    schedule.smart_window_end.map(|t| t.to_rfc3339()),
                    schedule.time_zone,
                    schedule.next_run_at.map(|t| t.to_rfc3339()),
                    schedule.status.as_str(),
                    schedule.last_run_at.map(|t| t.to_rfc3339()),
                    schedule.repeat_interval_mins,
                ],
            )
            .map_err(store_err("save schedule"))?;
        Ok(())
    }

    pub fn save_recipient(&self, group_id: &str, recipient: &Recipient) -> Result<()> {
        if !recipient.email.contains('@') {
            return Err(EvermailError::InvalidInput(format!(
                "recipient '{}' has no usable email address",
                recipient.id
            )));
        }
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO recipients
                 (id, group_id, email, name, unsubscribed, suppressed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    recipient.id,
                    group_id,
                    recipient.email,
                    recipient.name,
                    recipient.unsubscribed as i32,
                    recipient.suppressed as i32,
                ],
            )
            .map_err(store_err("save recipient"))?;
        Ok(())
    }

    pub fn save_variant(&self, template_id: &str, variant: &MessageVariant) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO variants
                 (template_id, label, subject, html_body, text_body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    template_id,
                    variant.label,
                    variant.subject,
                    variant.html_body,
                    variant.text_body,
                ],
            )
            .map_err(store_err("save variant"))?;
        Ok(())
    }

    pub fn jobs_for_schedule(&self, schedule_id: &str) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, schedule_id, recipient_id, recipient_email, variant,
                        scheduled_for, status, attempts, last_error, sent_at, created_at
                 FROM jobs WHERE schedule_id = ?1 ORDER BY created_at",
            )
            .map_err(store_err("jobs for schedule"))?;
        let rows = stmt
            .query_map([schedule_id], job_from_row)
            .map_err(store_err("jobs for schedule"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules ORDER BY campaign_id, step_order"
            ))
            .map_err(store_err("list schedules"))?;
        let rows = stmt
            .query_map([], schedule_from_row)
            .map_err(store_err("list schedules"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

const SCHEDULE_COLS: &str = "id, campaign_id, template_id, group_id, step_order, send_at, \
     smart_window_start, smart_window_end, time_zone, next_run_at, status, last_run_at, \
     repeat_interval_mins";

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        template_id: row.get(2)?,
        group_id: row.get(3)?,
        step_order: row.get(4)?,
        send_at: parse_ts(row.get(5)?),
        smart_window_start: parse_ts(row.get(6)?),
        smart_window_end: parse_ts(row.get(7)?),
        time_zone: row.get(8)?,
        next_run_at: parse_ts(row.get(9)?),
        status: CampaignStatus::parse(&row.get::<_, String>(10)?),
        last_run_at: parse_ts(row.get(11)?),
        repeat_interval_mins: row.get(12)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        recipient_id: row.get(2)?,
        recipient_email: row.get(3)?,
        variant: row.get(4)?,
        scheduled_for: parse_ts(row.get(5)?).unwrap_or_else(Utc::now),
        status: JobStatus::parse(&row.get::<_, String>(6)?),
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        sent_at: parse_ts(row.get(9)?),
        created_at: parse_ts(row.get(10)?).unwrap_or_else(Utc::now),
    })
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        unsubscribed: row.get::<_, i32>(3)? != 0,
        suppressed: row.get::<_, i32>(4)? != 0,
    })
}

impl JobStore for SqliteJobStore {
    fn find_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules
                 WHERE status IN ('scheduled', 'sending')
                   AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at"
            ))
            .map_err(store_err("find due schedules"))?;
        let rows = stmt
            .query_map([now.to_rfc3339()], schedule_from_row)
            .map_err(store_err("find due schedules"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn load_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        self.conn()
            .query_row(
                &format!("SELECT {SCHEDULE_COLS} FROM schedules WHERE id = ?1"),
                [id],
                schedule_from_row,
            )
            .optional()
            .map_err(store_err("load schedule"))
    }

    fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        // The cursor only moves forward: keep whichever next_run_at is
        // later, except that completion clears it.
        let existing = self.load_schedule(&schedule.id)?;
        let mut to_save = schedule.clone();
        if let (Some(old), Some(new)) = (
            existing.as_ref().and_then(|s| s.next_run_at),
            to_save.next_run_at,
        ) {
            if new < old && to_save.status != CampaignStatus::Completed {
                to_save.next_run_at = Some(old);
            }
        }
        // An operator pause wins over a pass that started before it: a
        // cursor update never un-pauses a schedule.
        if existing.map(|s| s.status) == Some(CampaignStatus::Paused)
            && to_save.status != CampaignStatus::Paused
        {
            to_save.status = CampaignStatus::Paused;
        }
        self.save_schedule(&to_save)
    }

    fn set_schedule_status(&self, id: &str, status: CampaignStatus) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE schedules SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .map_err(store_err("set schedule status"))?;
        Ok(())
    }

    fn campaign_status(&self, campaign_id: &str) -> Result<Option<CampaignStatus>> {
        self.conn()
            .query_row(
                "SELECT status FROM campaigns WHERE id = ?1",
                [campaign_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(store_err("campaign status"))
            .map(|s| s.map(|s| CampaignStatus::parse(&s)))
    }

    fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE campaigns SET status = ?2 WHERE id = ?1",
                params![campaign_id, status.as_str()],
            )
            .map_err(store_err("set campaign status"))?;
        Ok(())
    }

    fn find_recipients(&self, group_id: &str) -> Result<Vec<Recipient>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, email, name, unsubscribed, suppressed
                 FROM recipients WHERE group_id = ?1 ORDER BY id",
            )
            .map_err(store_err("find recipients"))?;
        let rows = stmt
            .query_map([group_id], recipient_from_row)
            .map_err(store_err("find recipients"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn load_recipient(&self, id: &str) -> Result<Option<Recipient>> {
        self.conn()
            .query_row(
                "SELECT id, email, name, unsubscribed, suppressed
                 FROM recipients WHERE id = ?1",
                [id],
                recipient_from_row,
            )
            .optional()
            .map_err(store_err("load recipient"))
    }

    fn variants(&self, template_id: &str) -> Result<Vec<MessageVariant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT label, subject, html_body, text_body
                 FROM variants WHERE template_id = ?1 ORDER BY label",
            )
            .map_err(store_err("variants"))?;
        let rows = stmt
            .query_map([template_id], |row| {
                Ok(MessageVariant {
                    label: row.get(0)?,
                    subject: row.get(1)?,
                    html_body: row.get(2)?,
                    text_body: row.get(3)?,
                })
            })
            .map_err(store_err("variants"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn upsert_job(
        &self,
        schedule_id: &str,
        recipient: &Recipient,
        variant: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<(Job, bool)> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT INTO jobs
                 (id, schedule_id, recipient_id, recipient_email, variant,
                  scheduled_for, status, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)
                 ON CONFLICT (schedule_id, recipient_id) DO NOTHING",
                params![
                    evermail_core::types::new_job_id(),
                    schedule_id,
                    recipient.id,
                    recipient.email,
                    variant,
                    scheduled_for.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(store_err("upsert job"))?;

        let job = conn
            .query_row(
                "SELECT id, schedule_id, recipient_id, recipient_email, variant,
                        scheduled_for, status, attempts, last_error, sent_at, created_at
                 FROM jobs WHERE schedule_id = ?1 AND recipient_id = ?2",
                params![schedule_id, recipient.id],
                job_from_row,
            )
            .map_err(store_err("upsert job"))?;
        Ok((job, inserted == 1))
    }

    fn claim_job(&self, job_id: &str, from: JobStatus, to: JobStatus) -> Result<bool> {
        let running_since = if to == JobStatus::Running {
            Some(Utc::now().to_rfc3339())
        } else {
            None
        };
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?2, running_since = ?3
                 WHERE id = ?1 AND status = ?4",
                params![job_id, to.as_str(), running_since, from.as_str()],
            )
            .map_err(store_err("claim job"))?;
        Ok(updated == 1)
    }

    fn update_job(&self, job: &Job) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = ?2, attempts = ?3, last_error = ?4,
                        sent_at = ?5, scheduled_for = ?6, running_since = NULL
                 WHERE id = ?1",
                params![
                    job.id,
                    job.status.as_str(),
                    job.attempts,
                    job.last_error,
                    job.sent_at.map(|t| t.to_rfc3339()),
                    job.scheduled_for.to_rfc3339(),
                ],
            )
            .map_err(store_err("update job"))?;
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.conn()
            .query_row(
                "SELECT id, schedule_id, recipient_id, recipient_email, variant,
                        scheduled_for, status, attempts, last_error, sent_at, created_at
                 FROM jobs WHERE id = ?1",
                [job_id],
                job_from_row,
            )
            .optional()
            .map_err(store_err("load job"))
    }

    fn due_jobs(&self, schedule_id: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, schedule_id, recipient_id, recipient_email, variant,
                        scheduled_for, status, attempts, last_error, sent_at, created_at
                 FROM jobs
                 WHERE schedule_id = ?1 AND status = 'pending' AND scheduled_for <= ?2
                 ORDER BY scheduled_for LIMIT ?3",
            )
            .map_err(store_err("due jobs"))?;
        let rows = stmt
            .query_map(
                params![schedule_id, now.to_rfc3339(), limit as i64],
                job_from_row,
            )
            .map_err(store_err("due jobs"))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn unsent_count(&self, schedule_id: &str) -> Result<u64> {
        self.conn()
            .query_row(
                "SELECT COUNT(*)
                 FROM recipients r
                 JOIN schedules s ON s.id = ?1
                 WHERE r.group_id = s.group_id
                   AND r.unsubscribed = 0 AND r.suppressed = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM jobs j
                       WHERE j.schedule_id = ?1 AND j.recipient_id = r.id
                         AND j.status IN ('sent', 'failed', 'suppressed'))",
                [schedule_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(store_err("unsent count"))
    }

    fn append_event(&self, event: &EngagementEvent) -> Result<bool> {
        if event.kind.is_terminal() && self.has_event(&event.job_id, event.kind)? {
            return Ok(false);
        }
        self.conn()
            .execute(
                "INSERT INTO events (job_id, kind, at, meta) VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.job_id,
                    event.kind.as_str(),
                    event.at.to_rfc3339(),
                    event.meta.to_string(),
                ],
            )
            .map_err(store_err("append event"))?;
        Ok(true)
    }

    fn has_event(&self, job_id: &str, kind: EventKind) -> Result<bool> {
        self.conn()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM events WHERE job_id = ?1 AND kind = ?2)",
                params![job_id, kind.as_str()],
                |row| row.get::<_, i32>(0),
            )
            .map(|n| n != 0)
            .map_err(store_err("has event"))
    }

    fn suppress_recipient(&self, recipient_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE recipients SET suppressed = 1 WHERE id = ?1",
                [recipient_id],
            )
            .map_err(store_err("suppress recipient"))?;
        Ok(())
    }

    fn close_unsendable_jobs(&self, schedule_id: &str) -> Result<u32> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'suppressed', last_error = 'recipient no longer sendable'
                 WHERE schedule_id = ?1 AND status = 'pending'
                   AND recipient_id IN (
                       SELECT id FROM recipients
                       WHERE unsubscribed = 1 OR suppressed = 1)",
                [schedule_id],
            )
            .map_err(store_err("close unsendable jobs"))?;
        Ok(updated as u32)
    }

    fn recover_stuck_jobs(&self, cutoff: DateTime<Utc>) -> Result<u32> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'pending', attempts = attempts + 1,
                     last_error = 'recovered stale running job', running_since = NULL
                 WHERE status = 'running' AND running_since < ?1",
                [cutoff.to_rfc3339()],
            )
            .map_err(store_err("recover stuck jobs"))?;
        Ok(updated as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn recipient(id: &str, email: &str) -> Recipient {
        Recipient {
            id: id.into(),
            email: email.into(),
            name: None,
            unsubscribed: false,
            suppressed: false,
        }
    }

    fn seed_schedule(store: &SqliteJobStore, next_run_at: Option<DateTime<Utc>>) -> Schedule {
        let schedule = Schedule {
            id: "sched-1".into(),
            campaign_id: "camp-1".into(),
            template_id: "tpl-1".into(),
            group_id: "grp-1".into(),
            step_order: 1,
            send_at: None,
            smart_window_start: None,
            smart_window_end: None,
            time_zone: "America/Vancouver".into(),
            next_run_at,
            status: CampaignStatus::Scheduled,
            last_run_at: None,
            repeat_interval_mins: None,
        };
        store.save_schedule(&schedule).unwrap();
        schedule
    }

    #[test]
    fn test_upsert_job_is_idempotent() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        seed_schedule(&store, Some(Utc::now()));
        let r = recipient("biz-1", "a@x.com");

        let (job1, created1) = store.upsert_job("sched-1", &r, "A", Utc::now()).unwrap();
        let (job2, created2) = store.upsert_job("sched-1", &r, "B", Utc::now()).unwrap();

        assert!(created1);
        assert!(!created2);
        assert_eq!(job1.id, job2.id);
        // Variant never changes once assigned.
        assert_eq!(job2.variant, "A");
    }

    #[test]
    fn test_claim_job_is_compare_and_swap() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        seed_schedule(&store, Some(Utc::now()));
        let (job, _) = store
            .upsert_job("sched-1", &recipient("biz-1", "a@x.com"), "A", Utc::now())
            .unwrap();

        assert!(store
            .claim_job(&job.id, JobStatus::Pending, JobStatus::Running)
            .unwrap());
        // Second claimer loses.
        assert!(!store
            .claim_job(&job.id, JobStatus::Pending, JobStatus::Running)
            .unwrap());
    }

    #[test]
    fn test_due_schedules_filtering() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc::now();
        seed_schedule(&store, Some(now - Duration::minutes(1)));

        assert_eq!(store.find_due_schedules(now).unwrap().len(), 1);
        assert!(store
            .find_due_schedules(now - Duration::minutes(5))
            .unwrap()
            .is_empty());

        store
            .set_schedule_status("sched-1", CampaignStatus::Paused)
            .unwrap();
        assert!(store.find_due_schedules(now).unwrap().is_empty());
    }

    #[test]
    fn test_next_run_at_only_moves_forward() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut schedule = seed_schedule(&store, Some(now));

        schedule.next_run_at = Some(now - Duration::hours(1));
        store.update_schedule(&schedule).unwrap();

        let loaded = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(loaded.next_run_at.unwrap().timestamp(), now.timestamp());
    }

    #[test]
    fn test_pause_survives_stale_cursor_update() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut schedule = seed_schedule(&store, Some(now));

        // Operator pauses while a pass holding the old snapshot is still
        // running; the pass then writes its cursor update back.
        store
            .set_schedule_status("sched-1", CampaignStatus::Paused)
            .unwrap();
        schedule.status = CampaignStatus::Sending;
        schedule.last_run_at = Some(now);
        schedule.next_run_at = Some(now + Duration::minutes(1));
        store.update_schedule(&schedule).unwrap();

        let loaded = store.load_schedule("sched-1").unwrap().unwrap();
        assert_eq!(loaded.status, CampaignStatus::Paused);
        // The cursor itself still advances.
        assert_eq!(
            loaded.next_run_at.unwrap().timestamp(),
            (now + Duration::minutes(1)).timestamp()
        );
    }

    #[test]
    fn test_close_unsendable_jobs_leaves_no_dangling_pending() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        seed_schedule(&store, Some(Utc::now()));
        store.save_recipient("grp-1", &recipient("biz-1", "a@x.com")).unwrap();
        store.save_recipient("grp-1", &recipient("biz-2", "b@y.com")).unwrap();
        let (mut sent_job, _) = store
            .upsert_job("sched-1", &recipient("biz-1", "a@x.com"), "A", Utc::now())
            .unwrap();
        let (stale_job, _) = store
            .upsert_job("sched-1", &recipient("biz-2", "b@y.com"), "A", Utc::now())
            .unwrap();

        sent_job.status = JobStatus::Sent;
        sent_job.sent_at = Some(Utc::now());
        store.update_job(&sent_job).unwrap();
        // biz-2 bounces out after their job was created but before its
        // send. The schedule now counts as finished.
        store.suppress_recipient("biz-2").unwrap();
        assert_eq!(store.unsent_count("sched-1").unwrap(), 0);

        assert_eq!(store.close_unsendable_jobs("sched-1").unwrap(), 1);
        let reloaded = store.load_job(&stale_job.id).unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Suppressed);
        assert!(reloaded.last_error.is_some());
        // Already-terminal jobs are untouched.
        let sent = store.load_job(&sent_job.id).unwrap().unwrap();
        assert_eq!(sent.status, JobStatus::Sent);
    }

    #[test]
    fn test_unsent_count_excludes_suppressed_and_terminal() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        seed_schedule(&store, Some(Utc::now()));
        store.save_recipient("grp-1", &recipient("biz-1", "a@x.com")).unwrap();
        store.save_recipient("grp-1", &recipient("biz-2", "b@y.com")).unwrap();
        let mut unsub = recipient("biz-3", "c@z.com");
        unsub.unsubscribed = true;
        store.save_recipient("grp-1", &unsub).unwrap();

        assert_eq!(store.unsent_count("sched-1").unwrap(), 2);

        let (mut job, _) = store
            .upsert_job("sched-1", &recipient("biz-1", "a@x.com"), "A", Utc::now())
            .unwrap();
        job.status = JobStatus::Sent;
        job.sent_at = Some(Utc::now());
        store.update_job(&job).unwrap();

        assert_eq!(store.unsent_count("sched-1").unwrap(), 1);
    }

    #[test]
    fn test_terminal_events_are_idempotent() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let event = EngagementEvent {
            job_id: "job-1".into(),
            kind: EventKind::Bounced,
            at: Utc::now(),
            meta: serde_json::json!({}),
        };
        assert!(store.append_event(&event).unwrap());
        assert!(!store.append_event(&event).unwrap());

        // Opens may repeat.
        let open = EngagementEvent {
            kind: EventKind::Opened,
            ..event.clone()
        };
        assert!(store.append_event(&open).unwrap());
        assert!(store.append_event(&open).unwrap());
    }

    #[test]
    fn test_recover_stuck_jobs() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        seed_schedule(&store, Some(Utc::now()));
        let (job, _) = store
            .upsert_job("sched-1", &recipient("biz-1", "a@x.com"), "A", Utc::now())
            .unwrap();
        store
            .claim_job(&job.id, JobStatus::Pending, JobStatus::Running)
            .unwrap();

        // Cutoff in the future treats the running job as stale.
        let recovered = store
            .recover_stuck_jobs(Utc::now() + Duration::minutes(1))
            .unwrap();
        assert_eq!(recovered, 1);

        let reloaded = store.load_job(&job.id).unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Pending);
        assert_eq!(reloaded.attempts, 1);
    }

    #[test]
    fn test_rejects_recipient_without_domain() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let bad = recipient("biz-1", "not-an-email");
        assert!(store.save_recipient("grp-1", &bad).is_err());
    }
}
