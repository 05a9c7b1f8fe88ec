//! Adaptive per-partition outstanding window.

/// Bound on a partition's in-flight operations, adjusted per observed block.
///
/// Plain additive backpressure: a block that executed fewer of our
/// transactions than the window shrinks it to what was executed, a block
/// that executed a full window grows it by one step, up to the ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionWindow {
    current: usize,
    min: usize,
    max: usize,
    step: usize,
}

impl AdmissionWindow {
    /// Create a window starting at `initial`, kept within `min..=max`.
    pub fn new(initial: usize, min: usize, max: usize, step: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            step,
        }
    }

    /// Current window size.
    pub fn current(&self) -> usize {
        self.current
    }

    /// How many more operations may be sent with `outstanding` in flight.
    pub fn budget(&self, outstanding: usize) -> usize {
        self.current.saturating_sub(outstanding)
    }

    /// Adjust after a block executed `executed` of our transactions while
    /// `outstanding_before` were in flight.
    pub fn observe(&mut self, executed: usize, outstanding_before: usize) {
        if outstanding_before == 0 {
            return;
        }
        if executed >= self.current {
            self.current = (self.current + self.step).min(self.max);
        } else {
            self.current = executed.max(self.min);
        }
    }
}
