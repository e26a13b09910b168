//! Evermail engine: campaign scheduling and throttled delivery.
//!
//! - `windows` decides when a schedule may send
//! - `variant` assigns A/B/C variants deterministically
//! - `throttle` rate-limits at global, campaign, and domain scope
//! - `persistence` is the SQLite-backed job store
//! - `dispatch` takes one job through claim, throttle, and send
//! - `engine` is the polling scheduler loop on top of all of it
//! - `events` records provider engagement feedback

pub mod dispatch;
pub mod engine;
pub mod events;
pub mod persistence;
pub mod throttle;
pub mod variant;
pub mod windows;

pub use dispatch::{DispatchOutcome, Dispatcher, RetryPolicy};
pub use engine::{SchedulerEngine, TickReport};
pub use events::{record_event, EventOutcome};
pub use persistence::SqliteJobStore;
pub use throttle::{ThrottleDecision, ThrottleGovernor, ThrottleScope};
pub use windows::WindowDecision;
