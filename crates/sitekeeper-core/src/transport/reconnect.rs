//! Slave-side reconnection backoff schedule (spec §4.1).

use std::time::Duration;

/// Yields 1s, 2s, 5s, then 10s for 5 attempts, 30s for 12 attempts, then
/// 1 minute forever. A pure iterator so the policy can be asserted on
/// directly without driving a clock or a real connection.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    attempt: u32,
}

impl ReconnectSchedule {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for ReconnectSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = match self.attempt {
            0 => Duration::from_secs(1),
            1 => Duration::from_secs(2),
            2 => Duration::from_secs(5),
            n if n < 3 + 5 => Duration::from_secs(10),
            n if n < 3 + 5 + 12 => Duration::from_secs(30),
            _ => Duration::from_secs(60),
        };
        self.attempt += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_matches_spec_sequence() {
        let mut schedule = ReconnectSchedule::new();
        let first_three: Vec<_> = (&mut schedule).take(3).collect();
        assert_eq!(
            first_three,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(5)]
        );

        let next_five: Vec<_> = (&mut schedule).take(5).collect();
        assert!(next_five.iter().all(|d| *d == Duration::from_secs(10)));

        let next_twelve: Vec<_> = (&mut schedule).take(12).collect();
        assert!(next_twelve.iter().all(|d| *d == Duration::from_secs(30)));

        let tail: Vec<_> = (&mut schedule).take(20).collect();
        assert!(tail.iter().all(|d| *d == Duration::from_secs(60)));
    }

    #[test]
    fn schedule_never_terminates() {
        let schedule = ReconnectSchedule::new();
        assert!(schedule.take(1000).count() == 1000);
    }
}
