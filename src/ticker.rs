use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::{Error, Result};

/// An interval whose first tick fires one full `period` from now rather than
/// immediately. Late ticks are delayed, never bunched up.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Rejects zero-length periods, which `tokio::time::interval` panics on.
pub(crate) fn ensure_nonzero(period: Duration, name: &str) -> Result<Duration> {
    if period.is_zero() {
        return Err(Error::Config(format!("{} must be greater than zero", name)));
    }
    Ok(period)
}
