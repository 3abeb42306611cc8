//! Staleness gate: when is a record due for another refresh?

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

/// Default freshness window: a week.
pub fn default_threshold() -> TimeDelta {
    TimeDelta::days(7)
}

/// A record is stale if it was never queued, or was queued before `now - threshold`.
pub fn is_stale(last_queued_at: Option<DateTime<Utc>>, threshold: TimeDelta, now: DateTime<Utc>) -> bool {
    match last_queued_at {
        None => true,
        Some(queued) => queued < cutoff(now, threshold),
    }
}

/// The instant before which a token counts as stale.
pub fn cutoff(now: DateTime<Utc>, threshold: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(threshold)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Fencing token for a dispatch happening at `now`.
///
/// Truncated to microseconds, the resolution of a Postgres `timestamptz`,
/// so the stored token compares equal to the one carried in the work item.
pub fn fence_token(now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(6)
}
