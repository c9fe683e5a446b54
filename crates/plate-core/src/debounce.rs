use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed_nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }
}

/// Trailing-edge debounce. Owners call [`Debounce::poll`] from their event
/// loop and run the debounced work when it returns `true`.
pub struct Debounce {
    delay: Duration,
    clock: Arc<dyn Clock>,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            delay,
            clock,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Restarts the window; repeated triggers collapse into one firing.
    pub fn trigger(&mut self) {
        self.deadline = Some(self.clock.now() + self.delay);
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Fires if the window has elapsed.
    pub fn poll(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if self.clock.now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Fires now if anything is pending, skipping the rest of the window.
    pub fn force(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Drops the pending firing. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }
}

impl std::fmt::Debug for Debounce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debounce")
            .field("delay", &self.delay)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debounce(clock: &ManualClock) -> Debounce {
        Debounce::new(Duration::from_millis(100), Arc::new(clock.clone()))
    }

    #[test]
    fn fires_once_after_trailing_edge() {
        let clock = ManualClock::new();
        let mut d = debounce(&clock);
        d.trigger();
        clock.advance(Duration::from_millis(60));
        d.trigger();
        clock.advance(Duration::from_millis(60));
        assert!(!d.poll(), "second trigger restarted the window");
        clock.advance(Duration::from_millis(40));
        assert!(d.poll());
        assert!(!d.poll());
    }

    #[test]
    fn cancel_clears_without_firing() {
        let clock = ManualClock::new();
        let mut d = debounce(&clock);
        d.trigger();
        assert!(d.cancel());
        clock.advance(Duration::from_secs(1));
        assert!(!d.poll());
        assert!(!d.cancel());
    }

    #[test]
    fn force_fires_immediately_only_when_pending() {
        let clock = ManualClock::new();
        let mut d = debounce(&clock);
        assert!(!d.force());
        d.trigger();
        assert!(d.force());
        assert!(!d.is_pending());
    }
}
