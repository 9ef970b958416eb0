use std::time::{Duration, Instant};

/// Fires at most once per `interval`, tracked against wall-clock `Instant`.
///
/// Used to drive the liveness monitor's tick and the connector's reconnect
/// attempts without spawning a timer per task.
#[derive(Debug, Clone, Copy)]
pub struct Repeater {
    interval: Duration,
    // `None` means "never acted" and is treated as infinitely overdue.
    last_acted: Option<Instant>,
}

impl Repeater {
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    /// Returns `true` at most once per `interval`; resets the clock on fire.
    pub fn fired(&mut self) -> bool {
        let overdue = match self.last_acted {
            None => true,
            Some(t) => t.elapsed() >= self.interval,
        };
        if overdue {
            self.last_acted = Some(Instant::now());
        }
        overdue
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(Instant::now());
    }

    /// Forces the next call to `fired()` to return `true`.
    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fires_after_interval() {
        let mut r = Repeater::every(Duration::from_millis(10));
        assert!(!r.fired());
        sleep(Duration::from_millis(15));
        assert!(r.fired());
        assert!(!r.fired());
    }

    #[test]
    fn force_fire_fires_immediately() {
        let mut r = Repeater::every(Duration::from_secs(60));
        assert!(!r.fired());
        r.force_fire();
        assert!(r.fired());
    }
}
