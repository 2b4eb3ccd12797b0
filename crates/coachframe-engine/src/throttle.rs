use std::thread;
use std::time::{Duration, Instant};

/// Keeps consecutive remote calls at least `delay` apart.
#[derive(Debug, Clone)]
pub struct Throttle {
    delay: Duration,
    last_call: Option<Instant>,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: None,
        }
    }

    /// Blocks until the next call may go out, then marks it as made.
    pub fn wait(&mut self) -> Duration {
        let slept = self.pending();
        if !slept.is_zero() {
            thread::sleep(slept);
        }
        self.last_call = Some(Instant::now());
        slept
    }

    fn pending(&self) -> Duration {
        match self.last_call {
            Some(last) => self.delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}
