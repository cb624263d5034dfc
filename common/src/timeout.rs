use std::time::Duration;

/// A bounded busy-poll budget.
///
/// Hardware waits in the drivers are loops of "check, then delay one interval". Each call to
/// [Timeout::run] spends one iteration; the delay itself is supplied by the caller, because the
/// environment decides whether that means sleeping, yielding or spinning.
#[derive(Clone, Debug)]
pub struct Timeout {
    remaining: u32,
    interval: Duration,
}

impl Timeout {
    #[inline]
    pub const fn new(iterations: u32, interval: Duration) -> Self {
        Self {
            remaining: iterations,
            interval,
        }
    }

    /// `iterations` polls spaced `micros` microseconds apart.
    #[inline]
    pub const fn from_micros(iterations: u32, micros: u64) -> Self {
        Self::new(iterations, Duration::from_micros(micros))
    }

    /// One poll per millisecond for `millis` milliseconds.
    #[inline]
    pub const fn from_millis(millis: u32) -> Self {
        Self::new(millis, Duration::from_millis(1))
    }

    #[inline]
    pub const fn from_secs(secs: u32) -> Self {
        Self::from_millis(secs * 1000)
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn run(&mut self, delay: impl FnOnce(Duration)) -> Result<(), ()> {
        if self.remaining > 0 {
            self.remaining -= 1;
            delay(self.interval);
            Ok(())
        } else {
            Err(())
        }
    }
}
