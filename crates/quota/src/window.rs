//! Fixed-epoch window arithmetic.
//!
//! Epochs are aligned to multiples of the window length since Unix time
//! zero, so every principal's windows roll over at the same instant.

/// Short request-rate window.
pub const MINUTE_SECS: u64 = 60;

/// Long request-rate window.
pub const HOUR_SECS: u64 = 3600;

/// First second of the epoch containing `now`.
pub fn epoch_start(now: u64, length_secs: u64) -> u64 {
    let length = length_secs.max(1);
    now - now % length
}

/// First second of the next epoch. Counters expire here.
pub fn epoch_end(now: u64, length_secs: u64) -> u64 {
    epoch_start(now, length_secs).saturating_add(length_secs.max(1))
}

/// Seconds until the epoch containing `now` rolls over. Always at least 1.
pub fn secs_until_rollover(now: u64, length_secs: u64) -> u64 {
    epoch_end(now, length_secs).saturating_sub(now).max(1)
}
