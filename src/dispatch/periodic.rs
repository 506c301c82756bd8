/// Runs an action on the first tick and then every `interval` ticks.
///
/// Owned by a single loop driver, so the countdown is a plain integer.
pub struct Periodic {
    interval: usize,
    remaining: usize,
    action: Box<dyn FnMut() + Send>,
}

impl Periodic {
    /// An `interval` of zero is treated as one.
    pub fn new(interval: usize, action: impl FnMut() + Send + 'static) -> Self {
        Self {
            interval: interval.max(1),
            remaining: 1,
            action: Box::new(action),
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Returns true when the action ran.
    pub fn tick(&mut self) -> bool {
        self.remaining -= 1;
        if self.remaining != 0 {
            return false;
        }
        self.remaining = self.interval;
        (self.action)();
        true
    }
}
