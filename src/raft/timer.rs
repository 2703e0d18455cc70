use std::time::{Duration, Instant};

use rand::Rng;

/// Deadline source with uniform random jitter.
///
/// Election timers use a non-zero splay so peers desynchronize and split
/// votes stay rare; the leader tick runs with zero splay.
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Duration,
    splay: Duration,
    deadline: Instant,
}

impl Timer {
    pub fn new(interval: Duration, splay: Duration) -> Self {
        Self {
            interval,
            splay,
            deadline: next_deadline(interval, splay),
        }
    }

    /// Push the deadline out to now + interval + jitter in `[0, splay)`.
    pub fn reset(&mut self) {
        self.deadline = next_deadline(self.interval, self.splay);
    }

    pub fn timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

fn next_deadline(interval: Duration, splay: Duration) -> Instant {
    let splay_micros = splay.as_micros() as u64;
    let jitter = if splay_micros == 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(rand::thread_rng().gen_range(0..splay_micros))
    };
    Instant::now() + interval + jitter
}
