use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The predicate held on the given (1-based) attempt.
    Found { attempt: u32 },
    TimedOut,
}

impl PollResult {
    pub fn is_found(&self) -> bool {
        matches!(self, PollResult::Found { .. })
    }
}

/// Evaluate `predicate` up to `attempts` times, sleeping `interval` between
/// evaluations. There is no sleep after the final attempt.
pub fn poll_until(mut predicate: impl FnMut() -> bool, attempts: u32, interval: Duration) -> PollResult {
    for attempt in 1..=attempts {
        if predicate() {
            return PollResult::Found { attempt };
        }
        if attempt < attempts {
            std::thread::sleep(interval);
        }
    }
    PollResult::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_found_on_later_attempt() {
        let mut calls = 0;
        let result = poll_until(
            || {
                calls += 1;
                calls == 3
            },
            5,
            Duration::from_millis(1),
        );
        assert_eq!(result, PollResult::Found { attempt: 3 });
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_timeout_is_bounded() {
        let mut calls = 0;
        let start = Instant::now();
        let result = poll_until(
            || {
                calls += 1;
                false
            },
            4,
            Duration::from_millis(20),
        );
        assert_eq!(result, PollResult::TimedOut);
        assert_eq!(calls, 4);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_zero_attempts() {
        assert_eq!(poll_until(|| true, 0, Duration::from_secs(1)), PollResult::TimedOut);
    }
}
