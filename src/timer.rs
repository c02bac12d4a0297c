//! Named one-shot timers with randomized backoff windows (§4.4).
//!
//! Unlike the teacher's single free-running `Timer::ticks_ms` clock
//! source, this protocol needs nine independently armable/cancellable
//! named timers, so the abstraction here is a request/cancel-by-id
//! registry (`Collaborators::request_timer`/`cancel_timer` in
//! `collab.rs`) rather than a tick source the engine polls itself. This
//! module owns only the timer identifiers and the jitter arithmetic.

/// The nine named timers the dispatcher can have pending at once. Each id
/// has at most one outstanding instance; arming one cancels any existing
/// instance of the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    Activate,
    EndFragments,
    MissingFragmentsRequesting,
    FragmentsDelivering,
    FragmentsRequestService,
    Fallback,
    ChecksumCalculating,
    MulticastMessageSent,
    FirmwareReady,
}

/// Computes a jittered expiry in milliseconds from `(base_seconds,
/// window_seconds)` and a `rand32()` draw, per §4.4:
/// `base*1000 + 100*(rand32() % (window*10))`. A zero window schedules
/// exactly at `base*1000` with no jitter term evaluated (so a
/// `rand32` of 0 is never required to special-case a zero window).
pub fn jittered_expiry_ms(base_seconds: u32, window_seconds: u32, rand32: u32) -> u32 {
    let base_ms = base_seconds.saturating_mul(1000);
    if window_seconds == 0 {
        return base_ms;
    }
    let bucket = rand32 % (window_seconds * 10);
    base_ms + 100 * bucket
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_window_has_no_jitter() {
        assert_eq!(jittered_expiry_ms(30, 0, 12345), 30_000);
    }

    #[test]
    fn jitter_is_bounded_to_window() {
        let base = 30;
        let window = 60;
        for draw in [0u32, 1, 599, 600, 12345] {
            let expiry = jittered_expiry_ms(base, window, draw);
            assert!(expiry >= base * 1000);
            assert!(expiry < base * 1000 + window * 1000);
        }
    }

    #[test]
    fn matches_spec_scenario_2_window() {
        // base 30s window 60s -> range [30s, 90s)
        for draw in 0u32..600 {
            let expiry = jittered_expiry_ms(30, 60, draw);
            assert!((30_000..90_000).contains(&expiry));
        }
    }
}
