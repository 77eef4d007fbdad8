//! Machine constants.
//!
//! These are the compile-time characteristics of the machine and the motion
//! core. Tunable values (kinematic limits, junction deviation, arc
//! tolerance) surface again in [`crate::settings`] with these as defaults.

use crate::axis::N_AXIS;

/// Step generator tick frequency [Hz]. One pulse byte is consumed by the
/// SDMA engine per tick.
pub const STEP_FREQUENCY: u32 = 40_000;

/// Number of segment-time slices per second used by the segment preparer.
pub const ACCELERATION_TICKS_PER_SECOND: u32 = 1_000;

/// Millimeters of carriage travel per full motor step.
pub const MM_PER_FULL_STEP: [f32; N_AXIS] = [0.15, 0.15, 0.70612];

/// Driver microstepping configured in the stepper bring-up tables.
pub const MICROSTEPS: [u32; N_AXIS] = [16, 16, 16];

/// Steps per millimeter for each axis.
pub const fn steps_per_mm(idx: usize) -> f32 {
    (1.0 / MM_PER_FULL_STEP[idx]) * MICROSTEPS[idx] as f32
}

/// Maximum rate per axis [mm/min].
pub const MAX_RATE: [f32; N_AXIS] = [5000.0, 5000.0, 50.0];

/// Acceleration per axis [mm/min^2]. 200 mm/s^2 on X/Y and Z.
pub const ACCELERATION: [f32; N_AXIS] =
    [200.0 * 60.0 * 60.0, 200.0 * 60.0 * 60.0, 200.0 * 60.0 * 60.0];

/// Maximum travel per axis [mm]. Y travel is toward negative machine space.
pub const MAX_TRAVEL: [f32; N_AXIS] = [495.3, -279.4, 12.0];

/// Slowest feed the planner will schedule [mm/min].
pub const MINIMUM_FEED_RATE: f32 = 1.0;

/// Lower clamp applied to computed junction speeds [mm/min].
pub const MINIMUM_JUNCTION_SPEED: f32 = 0.0;

/// Default junction deviation [mm].
pub const JUNCTION_DEVIATION: f32 = 0.01;

/// Default arc chordal tolerance [mm].
pub const ARC_TOLERANCE: f32 = 0.002;

/// Exact trig refresh interval for the arc small-angle approximation.
pub const N_ARC_CORRECTION: u16 = 12;

/// Largest line number accepted by the parser. The g-code standard says
/// 99999, but senders routinely exceed it; this is the largest value that
/// survives a single-precision float round-trip.
pub const MAX_LINE_NUMBER: i32 = 10_000_000;

/// Maximum length of a CLI line, inbound or outbound.
pub const CLI_LINE_LENGTH: usize = 512;

/// Depth of the groomed-line queue feeding the parser worker.
pub const GCODE_QUEUE_SIZE: usize = 16;

/// Planner ring capacity in blocks.
pub const BLOCK_BUFFER_SIZE: usize = 512;

/// Segment ring capacity.
pub const SEGMENT_BUFFER_SIZE: usize = 256;

/// CPU reserved for the step generator task.
pub const STEP_GEN_CPU_AFFINITY: usize = 3;

/// SCHED_FIFO priority of the step generator task.
pub const STEP_GEN_PRIORITY: i32 = 50;

/// SCHED_FIFO priority of the input event watchers.
pub const EVENT_WATCH_PRIORITY: i32 = 40;

/// Interval at which dwells re-check the system state [ms].
pub const DWELL_POLL_MS: u64 = 50;

/// Back-off applied to a soft caller when the planner ring is full [ms].
pub const FULL_BUFFER_BACKOFF_MS: u64 = 100;

/// Millimeters per inch, for G20 input conversion.
pub const MM_PER_INCH: f32 = 25.4;

/// Inches per millimeter, for inch-mode status reports.
pub const INCH_PER_MM: f32 = 1.0 / 25.4;

/// Program version reported in the welcome banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_steps_per_mm_matches_mechanics() {
        // 16 microsteps over a 0.15 mm full step.
        let spm = steps_per_mm(0);
        assert!((spm - 106.666_67).abs() < 1e-3, "got {spm}");
    }
}
