//! Last-value-wins emission gate.

use std::time::Duration;

use tokio::time::Instant;

/// Coalesces a burst of values into one emission per window.
///
/// The first value offered while idle opens a window. Later values replace the
/// pending one. When the window closes the latest value is released and the
/// gate goes idle until the next offer.
#[derive(Debug)]
pub struct Throttle<T> {
    window: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> Throttle<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Offer a value, replacing any pending one.
    pub fn offer(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
    }

    /// When the open window closes, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Release the pending value if its window has closed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Release the pending value now, closing any open window.
    pub fn flush(&mut self) -> Option<T> {
        self.deadline = None;
        self.pending.take()
    }
}
