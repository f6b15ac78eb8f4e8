use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Which rolling window refused an admission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Window {
    Minute,
    Hour,
}

/// Admission control over two rolling windows. A refused attempt is not
/// remembered and does not consume budget.
#[derive(Debug)]
pub struct DualWindowLimiter {
    per_minute: u32,
    per_hour: u32,
    admitted: VecDeque<Instant>,
}

impl DualWindowLimiter {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            per_minute,
            per_hour,
            admitted: VecDeque::new(),
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Window> {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= HOUR {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if self.admitted.len() >= self.per_hour as usize {
            return Err(Window::Hour);
        }
        let last_minute = self
            .admitted
            .iter()
            .rev()
            .take_while(|at| now.saturating_duration_since(**at) < MINUTE)
            .count();
        if last_minute >= self.per_minute as usize {
            return Err(Window::Minute);
        }

        self.admitted.push_back(now);
        Ok(())
    }

    /// Admissions currently counted against the hourly window.
    pub fn in_window(&self) -> usize {
        self.admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minute_window_refuses_then_recovers() {
        let start = Instant::now();
        let mut limiter = DualWindowLimiter::new(2, 10);
        assert!(limiter.try_acquire(start).is_ok());
        assert!(limiter.try_acquire(start + Duration::from_secs(1)).is_ok());
        assert_eq!(
            limiter.try_acquire(start + Duration::from_secs(2)),
            Err(Window::Minute)
        );
        assert!(limiter.try_acquire(start + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn hour_window_bounds_any_sixty_minute_span() {
        let start = Instant::now();
        let mut limiter = DualWindowLimiter::new(5, 7);
        let mut admitted = 0;
        for step in 0..960u64 {
            if limiter.try_acquire(start + Duration::from_secs(step * 15)).is_ok() {
                admitted += 1;
            }
            assert!(limiter.in_window() <= 7);
        }
        // Four hours of attempts every 15s: seven per hour at most.
        assert!(admitted <= 7 * 4);
        assert!(admitted >= 7 * 3);
    }
}
