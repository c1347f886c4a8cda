//! Tick-driven countdown used for every timed behavior in the session core.

/// Counts down simulated seconds. Advanced once per tick by its owner;
/// cancelling a countdown means dropping it.
#[derive(Debug, Clone, PartialEq)]
pub struct Countdown {
    duration: f32,
    remaining: f32,
    fired: bool,
}

impl Countdown {
    pub fn new(seconds: f32) -> Self {
        let seconds = seconds.max(0.0);
        Self {
            duration: seconds,
            remaining: seconds,
            fired: false,
        }
    }

    /// Advances by `dt` seconds. Returns true on the single call that
    /// crosses zero.
    pub fn advance(&mut self, dt: f32) -> bool {
        if self.fired {
            return false;
        }

        self.remaining = (self.remaining - dt.max(0.0)).max(0.0);
        if self.remaining <= 0.0 {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn remaining(&self) -> f32 {
        self.remaining
    }

    pub fn duration(&self) -> f32 {
        self.duration
    }

    pub fn is_expired(&self) -> bool {
        self.fired
    }

    /// Remaining time rounded up to whole seconds, as shown to players
    pub fn whole_seconds(&self) -> u32 {
        self.remaining.ceil() as u32
    }

    pub fn reset(&mut self) {
        self.remaining = self.duration;
        self.fired = false;
    }
}
