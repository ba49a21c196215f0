//! Human-readable durations for the player and the progress view.

use std::time::Duration;

/// `m:ss`, e.g. `3:07`.  Minutes are not wrapped into hours.
pub fn clock(d: Duration) -> String {
    let total = d.as_secs();
    format!("{}:{:02}", total / 60, total % 60)
}

/// `Xm Ys`, e.g. `4m 0s`.
pub fn eta(d: Duration) -> String {
    let total = d.as_secs();
    format!("{}m {}s", total / 60, total % 60)
}
