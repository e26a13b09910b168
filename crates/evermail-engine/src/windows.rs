//! Window resolver — decides whether "now" is a legal instant to send for
//! a schedule, and when the next legal instant is.
//!
//! Rules: an instant is eligible iff it falls inside at least one
//! configured send window AND outside every quiet-hour interval. Quiet
//! hours always win over windows. An empty window list means the whole
//! day is open (quiet hours still apply).

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use evermail_core::config::CampaignSettings;
use evermail_core::types::Schedule;
use evermail_core::Result;

/// Outcome of resolving a schedule against the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// The current instant is eligible — dispatch this pass.
    SendNow,
    /// Not eligible yet; advance `next_run_at` to this instant.
    Defer(DateTime<Utc>),
    /// The smart window has ended with nothing left to pick — the
    /// schedule is done.
    WindowClosed,
}

/// Whether `now` is inside an open window and outside all quiet hours,
/// evaluated in the schedule's local timezone.
pub fn is_sendable(settings: &CampaignSettings, tz: Tz, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&tz).time();
    if settings.quiet_hours.iter().any(|q| q.contains(local)) {
        return false;
    }
    settings.windows.is_empty() || settings.windows.iter().any(|w| w.contains(local))
}

/// Earliest eligible instant at or after `from`.
///
/// Eligibility only changes at window starts and quiet-hour ends, so it
/// is enough to test `from` plus those boundaries over the next couple
/// of local days. Returns None when the configuration never opens (e.g.
/// every window fully covered by quiet hours).
pub fn next_eligible(settings: &CampaignSettings, tz: Tz, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if is_sendable(settings, tz, from) {
        return Some(from);
    }

    let local_date = from.with_timezone(&tz).date_naive();
    let mut best: Option<DateTime<Utc>> = None;

    for day in 0..3i64 {
        let date = local_date + Duration::days(day);
        let boundaries = settings
            .windows
            .iter()
            .map(|w| w.start)
            .chain(settings.quiet_hours.iter().map(|q| q.end));
        for t in boundaries {
            let Some(candidate) = to_utc(tz, date.and_time(t)) else {
                continue;
            };
            if candidate < from || !is_sendable(settings, tz, candidate) {
                continue;
            }
            if best.map(|b| candidate < b).unwrap_or(true) {
                best = Some(candidate);
            }
        }
    }
    best
}

/// Resolve one schedule: fixed `send_at` beats the smart window; a fixed
/// time landing in quiet hours defers to the next open instant.
pub fn resolve(
    schedule: &Schedule,
    settings: &CampaignSettings,
    now: DateTime<Utc>,
) -> Result<WindowDecision> {
    let tz = schedule.tz()?;

    if let Some(send_at) = schedule.send_at {
        if now < send_at {
            return Ok(WindowDecision::Defer(send_at));
        }
        // Fixed times ignore send windows but still respect quiet hours.
        let local = now.with_timezone(&tz).time();
        if settings.quiet_hours.iter().any(|q| q.contains(local)) {
            return Ok(match next_eligible(settings, tz, now) {
                Some(next) => WindowDecision::Defer(next),
                None => WindowDecision::Defer(now + Duration::hours(1)),
            });
        }
        return Ok(WindowDecision::SendNow);
    }

    if let Some(start) = schedule.smart_window_start {
        if now < start {
            return Ok(WindowDecision::Defer(start));
        }
    }
    if let Some(end) = schedule.smart_window_end {
        if now > end {
            return Ok(WindowDecision::WindowClosed);
        }
        // Inside the range: pick the earliest open instant; if the range
        // ends before one opens, defer to the end so the next poll
        // observes the close.
        return Ok(match next_eligible(settings, tz, now) {
            Some(next) if next <= end => {
                if next <= now {
                    WindowDecision::SendNow
                } else {
                    WindowDecision::Defer(next)
                }
            }
            _ => WindowDecision::Defer(end),
        });
    }

    Ok(match next_eligible(settings, tz, now) {
        Some(next) if next <= now => WindowDecision::SendNow,
        Some(next) => WindowDecision::Defer(next),
        None => WindowDecision::Defer(now + Duration::hours(1)),
    })
}

/// Local naive datetime → UTC, skipping nonexistent DST gaps.
fn to_utc(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    use chrono::offset::LocalResult;
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}
