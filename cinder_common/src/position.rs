//! Machine position shared between the step thread and reporters.
//!
//! The step generator is the only writer; status reporting and position
//! sync read the counters lock-free. Values are signed step counts from
//! the machine origin.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::axis::N_AXIS;

/// Signed per-axis step counters.
#[derive(Debug, Default)]
pub struct SysPosition {
    steps: [AtomicI32; N_AXIS],
}

impl SysPosition {
    pub const fn new() -> Self {
        Self {
            steps: [AtomicI32::new(0), AtomicI32::new(0), AtomicI32::new(0)],
        }
    }

    /// Read one axis [steps].
    #[inline]
    pub fn get(&self, idx: usize) -> i32 {
        self.steps[idx].load(Ordering::Relaxed)
    }

    /// Snapshot all axes [steps].
    #[inline]
    pub fn snapshot(&self) -> [i32; N_AXIS] {
        [self.get(0), self.get(1), self.get(2)]
    }

    /// Step one axis in the positive or negative direction.
    ///
    /// Step-thread only.
    #[inline]
    pub fn step(&self, idx: usize, negative: bool) {
        let delta = if negative { -1 } else { 1 };
        self.steps[idx].fetch_add(delta, Ordering::Relaxed);
    }

    /// Reset all counters, e.g. after homing.
    pub fn zero(&self) {
        for s in &self.steps {
            s.store(0, Ordering::Relaxed);
        }
    }
}

/// Convert one axis of a step snapshot to millimeters.
#[inline]
pub fn steps_to_mm(steps: i32, steps_per_mm: f32) -> f32 {
    steps as f32 / steps_per_mm
}

/// Convert a step snapshot to a machine position in millimeters.
pub fn steps_to_mpos(steps: &[i32; N_AXIS], steps_per_mm: &[f32; N_AXIS]) -> [f32; N_AXIS] {
    [
        steps_to_mm(steps[0], steps_per_mm[0]),
        steps_to_mm(steps[1], steps_per_mm[1]),
        steps_to_mm(steps[2], steps_per_mm[2]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_and_convert() {
        let pos = SysPosition::new();
        for _ in 0..1067 {
            pos.step(0, false);
        }
        pos.step(1, true);
        assert_eq!(pos.get(0), 1067);
        assert_eq!(pos.get(1), -1);

        let mm = steps_to_mpos(&pos.snapshot(), &[106.666_67, 106.666_67, 22.66]);
        assert!((mm[0] - 10.003).abs() < 0.01);
    }
}
