use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Coalesces progress lines: at most one line per `min_interval`, the newest
/// line wins while waiting, and a line repeated within `dup_window` is dropped.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_interval: Duration,
    dup_window: Duration,
    last_sent: Option<Instant>,
    recent: VecDeque<(Instant, String)>,
    pending: Option<String>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration, dup_window: Duration) -> Self {
        Self {
            min_interval,
            dup_window,
            last_sent: None,
            recent: VecDeque::new(),
            pending: None,
        }
    }

    fn is_duplicate(&mut self, text: &str, now: Instant) -> bool {
        while let Some((at, _)) = self.recent.front() {
            if now.duration_since(*at) >= self.dup_window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.iter().any(|(_, t)| t == text)
    }

    fn too_soon(&self, now: Instant) -> bool {
        self.last_sent
            .is_some_and(|at| now.duration_since(at) < self.min_interval)
    }

    fn mark(&mut self, text: &str, now: Instant) {
        self.last_sent = Some(now);
        self.recent.push_back((now, text.to_string()));
    }

    /// Returns the line when it may go out now; otherwise it is held.
    pub fn offer(&mut self, text: String, now: Instant) -> Option<String> {
        if self.is_duplicate(&text, now) {
            return None;
        }
        if self.too_soon(now) {
            self.pending = Some(text);
            return None;
        }
        self.pending = None;
        self.mark(&text, now);
        Some(text)
    }

    /// Release the held line once the spacing allows it.
    pub fn flush(&mut self, now: Instant) -> Option<String> {
        if self.too_soon(now) {
            return None;
        }
        let text = self.pending.take()?;
        if self.is_duplicate(&text, now) {
            return None;
        }
        self.mark(&text, now);
        Some(text)
    }

    /// Record a line sent outside the throttle; any held line is superseded.
    pub fn force(&mut self, text: &str, now: Instant) {
        self.pending = None;
        self.mark(text, now);
    }
}
