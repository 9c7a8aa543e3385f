use std::time::{Duration, Instant};

/// Per-session sliding request window.
///
/// The window resets once its start is more than one duration in the past;
/// requests beyond the ceiling inside the current window are rejected.
#[derive(Debug)]
pub struct RateWindow {
    window: Duration,
    ceiling: u32,
    started_at: Instant,
    count: u32,
}

impl RateWindow {
    pub fn new(window: Duration, ceiling: u32) -> Self {
        Self {
            window,
            ceiling,
            started_at: Instant::now(),
            count: 0,
        }
    }

    /// Record one request at `now`. Returns false when the ceiling for the
    /// current window has been reached; a rejected request is not counted.
    pub fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.started_at) > self.window {
            self.started_at = now;
            self.count = 0;
        }
        if self.count >= self.ceiling {
            return false;
        }
        self.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_exactly_ceiling_per_window() {
        let mut window = RateWindow::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        assert!(window.allow(now));
        assert!(window.allow(now));
        assert!(window.allow(now));
        assert!(!window.allow(now));
        assert!(!window.allow(now + Duration::from_secs(59)));
    }

    #[test]
    fn resets_after_window_elapses() {
        let mut window = RateWindow::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        assert!(window.allow(now));
        assert!(window.allow(now));
        assert!(!window.allow(now));
        assert!(window.allow(now + Duration::from_secs(61)));
        assert!(window.allow(now + Duration::from_secs(61)));
        assert!(!window.allow(now + Duration::from_secs(61)));
    }

    #[test]
    fn rejections_do_not_consume_budget() {
        let mut window = RateWindow::new(Duration::from_secs(60), 1);
        let now = Instant::now();
        assert!(window.allow(now));
        for _ in 0..10 {
            assert!(!window.allow(now));
        }
        assert!(window.allow(now + Duration::from_secs(61)));
    }
}
