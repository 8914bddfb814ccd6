//! Presentation timers.
//!
//! The channel never owns an event loop; it arms timers here and the host
//! polls them from its UI loop, calling back into the channel for every due
//! token. Cancellation is by id, so a stale firing can never reach a stream
//! that replaced its timer.

use std::time::{Duration, Instant};

/// What to do when a timer fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerToken {
    /// Render the head of the stream's frame queue.
    StreamRender(u32),
    /// Deferred mark-false after a primary destroy.
    MarkFalse,
    /// Move the head of the accelerated latency queue to the decoder.
    AuxDispatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u64);

struct Entry {
    id: TimerId,
    due: Instant,
    delay: Duration,
    token: TimerToken,
}

#[derive(Default)]
pub struct TimerQueue {
    next: u64,
    entries: Vec<Entry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, delay: Duration, token: TimerToken) -> TimerId {
        self.next += 1;
        let id = TimerId(self.next);
        self.entries.push(Entry {
            id,
            due: Instant::now() + delay,
            delay,
            token,
        });
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every due timer, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, TimerToken)> {
        let mut due: Vec<Entry> = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.due <= now {
                due.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.entries = remaining;
        due.sort_by_key(|e| e.due);
        due.into_iter().map(|e| (e.id, e.token)).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.due).min()
    }

    /// Delay the timer was armed with, if it is still pending.
    pub fn armed_delay(&self, id: TimerId) -> Option<Duration> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.delay)
    }

    pub fn pending(&self) -> impl Iterator<Item = (TimerId, TimerToken, Duration)> + '_ {
        self.entries.iter().map(|e| (e.id, e.token, e.delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_timers_fire_in_order() {
        let mut timers = TimerQueue::new();
        let late = timers.arm(Duration::from_millis(20), TimerToken::MarkFalse);
        let early = timers.arm(Duration::ZERO, TimerToken::StreamRender(3));

        let now = Instant::now() + Duration::from_millis(50);
        let due = timers.take_due(now);
        assert_eq!(due, vec![
            (early, TimerToken::StreamRender(3)),
            (late, TimerToken::MarkFalse),
        ]);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut timers = TimerQueue::new();
        let id = timers.arm(Duration::ZERO, TimerToken::AuxDispatch);
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.take_due(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn pending_reports_armed_delay() {
        let mut timers = TimerQueue::new();
        let id = timers.arm(Duration::from_millis(10), TimerToken::StreamRender(0));
        assert_eq!(timers.armed_delay(id), Some(Duration::from_millis(10)));
        assert!(timers.next_deadline().is_some());
    }
}
