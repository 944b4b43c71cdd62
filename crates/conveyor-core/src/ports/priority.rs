//! PriorityPicker port - how a publish chooses its priority.

use rand::Rng;

use crate::domain::Priority;

pub trait PriorityPicker: Send + Sync {
    /// Returns a priority in `[1, max]`. A `max` of 0 is treated as 1.
    fn pick(&self, max: u8) -> Priority;
}

/// Uniform over `[1, max]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformPriority;

impl PriorityPicker for UniformPriority {
    fn pick(&self, max: u8) -> Priority {
        let max = max.max(Priority::MIN);
        Priority::clamped(rand::thread_rng().gen_range(Priority::MIN..=max), max)
    }
}

/// Always the same value, clamped into range. For tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedPriority(pub u8);

impl PriorityPicker for FixedPriority {
    fn pick(&self, max: u8) -> Priority {
        Priority::clamped(self.0, max)
    }
}
