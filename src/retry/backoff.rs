// src/retry/backoff.rs

use std::io;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Backoff schedule for temporary accept errors.
///
/// The delay starts at 5ms, doubles on each consecutive temporary error and
/// is capped at 1s. A successful accept (or a non-temporary error) resets
/// the schedule.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    /// Advance the schedule and return the delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.delay {
            None => INITIAL_DELAY,
            Some(d) => (d * 2).min(MAX_DELAY),
        };
        self.delay = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.delay = None;
    }
}

/// Classify an accept error as temporary (retryable in-place) or fatal.
///
/// Transient OS-level conditions are retried; everything else terminates the
/// accept loop and propagates to the caller.
pub fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    // accept(2) resource exhaustion surfaces as raw errnos with no dedicated
    // ErrorKind: ENOMEM, ENFILE, EMFILE, ENOBUFS.
    #[cfg(target_os = "linux")]
    if let Some(code) = err.raw_os_error() {
        return matches!(code, 12 | 23 | 24 | 105);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn backoff_starts_at_initial_delay() {
        let mut backoff = AcceptBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
    }

    #[test]
    fn backoff_caps_at_one_second() {
        let mut backoff = AcceptBackoff::default();
        let mut last = Duration::ZERO;
        for _ in 0..16 {
            last = backoff.next_delay();
        }
        assert_eq!(last, Duration::from_secs(1));
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = AcceptBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    proptest! {
        // k-th consecutive temporary error waits min(5ms * 2^(k-1), 1s).
        #[test]
        fn backoff_schedule_is_doubling_and_capped(n in 1usize..24) {
            let mut backoff = AcceptBackoff::default();
            for k in 1..=n {
                let expected = 5u64.saturating_mul(1u64 << (k - 1)).min(1000);
                prop_assert_eq!(backoff.next_delay(), Duration::from_millis(expected));
            }
        }
    }

    #[test]
    fn resource_exhaustion_is_temporary() {
        #[cfg(target_os = "linux")]
        {
            let emfile = io::Error::from_raw_os_error(24);
            assert!(is_temporary(&emfile));
        }
        let aborted = io::Error::new(io::ErrorKind::ConnectionAborted, "aborted");
        assert!(is_temporary(&aborted));
    }

    #[test]
    fn permission_denied_is_fatal() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!is_temporary(&denied));
    }
}
