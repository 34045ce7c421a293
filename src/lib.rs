pub mod api;
pub mod chain;
pub mod commitment;
pub mod config;
pub mod database;
pub mod monitor;
pub mod notifier;

#[cfg(test)]
pub mod testutil;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the epoch, per the system clock.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .expect("System clock is set before 1970?")
}
