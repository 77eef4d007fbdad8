//! Motion control primitives.
//!
//! The gateway between the parser and the planner: straight lines, arcs
//! approximated by chordal segments, and dwells. Everything here runs in
//! soft context on the parser worker and may sleep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use cinder_common::axis::N_AXIS;
use cinder_common::consts::{
    DWELL_POLL_MS, FULL_BUFFER_BACKOFF_MS, N_ARC_CORRECTION,
};
use cinder_common::fsm::{Fsm, SystemState};
use cinder_common::settings::Settings;
use cinder_common::status::Status;

use crate::planner::{Condition, LineData, Planner};
use crate::segment::SegmentPrep;

/// Arc angular travel below this is treated as a full circle request.
const ARC_ANGULAR_TRAVEL_EPSILON: f32 = 5e-7;

/// High-level motion interface owned by the parser worker.
pub struct MotionControl {
    planner: Planner,
    prep: Arc<Mutex<SegmentPrep>>,
    fsm: Arc<Fsm>,
    settings: Arc<Settings>,
}

impl MotionControl {
    pub fn new(
        planner: Planner,
        prep: Arc<Mutex<SegmentPrep>>,
        fsm: Arc<Fsm>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            planner,
            prep,
            fsm,
            settings,
        }
    }

    pub fn planner(&mut self) -> &mut Planner {
        &mut self.planner
    }

    /// Queue a linear motion to an absolute target in millimeters.
    ///
    /// Blocks while the planner ring is full, backing off so the preparer
    /// can drain it. Returns without queueing on fault or alarm.
    pub fn line(&mut self, target: &[f32; N_AXIS], data: &LineData) -> Result<(), Status> {
        if self.settings.soft_limits {
            self.travel_check(target)?;
        }

        loop {
            let state = self.fsm.state();
            if state == SystemState::Fault || state == SystemState::Alarm {
                return Ok(());
            }
            if !self.planner.is_full() {
                break;
            }
            // A full ring means we are well ahead of the machine. Start
            // the cycle if configured, then wait for room.
            if self.settings.cli.auto_cycle && state != SystemState::Run {
                self.fsm.request(SystemState::Run);
            }
            std::thread::sleep(Duration::from_millis(FULL_BUFFER_BACKOFF_MS));
        }

        if !self.planner.buffer_line(target, data) {
            // Zero-length move. Spindle state must still be honored when a
            // coincident target is passed in laser mode; the sync hook is
            // inert until the laser subsystem lands.
            if self.settings.laser_power_correction
                && data.condition.contains(Condition::SPINDLE_CW)
            {
                debug!("zero-length move with spindle sense");
            }
        }
        Ok(())
    }

    /// Check the target against the machine envelope.
    fn travel_check(&self, target: &[f32; N_AXIS]) -> Result<(), Status> {
        for idx in 0..N_AXIS {
            if target[idx].abs() > self.settings.max_travel[idx].abs() {
                return Err(Status::TravelExceeded);
            }
        }
        Ok(())
    }

    /// Queue an arc as a fan of chordal line segments.
    ///
    /// The chord count is chosen so the chordal error stays below the arc
    /// tolerance. Endpoint rotation uses a third-order small-angle
    /// approximation with an exact trig refresh every few steps, so the
    /// per-segment cost stays off the trig unit.
    #[allow(clippy::too_many_arguments)]
    pub fn arc(
        &mut self,
        target: &[f32; N_AXIS],
        data: &mut LineData,
        position: &mut [f32; N_AXIS],
        offset: &[f32; N_AXIS],
        radius: f32,
        axis_0: usize,
        axis_1: usize,
        axis_linear: usize,
        is_clockwise_arc: bool,
    ) -> Result<(), Status> {
        let center_axis0 = position[axis_0] + offset[axis_0];
        let center_axis1 = position[axis_1] + offset[axis_1];
        // Radius vector from center to current location.
        let mut r_axis0 = -offset[axis_0];
        let mut r_axis1 = -offset[axis_1];
        let rt_axis0 = target[axis_0] - center_axis0;
        let rt_axis1 = target[axis_1] - center_axis1;

        // CCW angle between position and target from the circle center.
        let mut angular_travel =
            (r_axis0 * rt_axis1 - r_axis1 * rt_axis0).atan2(r_axis0 * rt_axis0 + r_axis1 * rt_axis1);
        if is_clockwise_arc {
            if angular_travel >= -ARC_ANGULAR_TRAVEL_EPSILON {
                angular_travel -= 2.0 * std::f32::consts::PI;
            }
        } else if angular_travel <= ARC_ANGULAR_TRAVEL_EPSILON {
            angular_travel += 2.0 * std::f32::consts::PI;
        }

        // Chord count for the configured tolerance. Segment endpoints sit
        // on the arc, so the worst-case sagitta equals the tolerance.
        let tol = self.settings.arc_tolerance;
        let segments = ((0.5 * angular_travel * radius).abs()
            / (tol * (2.0 * radius - tol)).sqrt())
        .floor() as u16;

        if segments > 0 {
            // Inverse-time feed was programmed for the whole arc; scale it
            // so the sum over all chords comes out right.
            if data.condition.contains(Condition::INVERSE_TIME) {
                data.feed_rate *= segments as f32;
                data.condition.remove(Condition::INVERSE_TIME);
            }

            let theta_per_segment = angular_travel / segments as f32;
            let linear_per_segment = (target[axis_linear] - position[axis_linear]) / segments as f32;

            // cos_t = 1 - theta^2/2, sin_t = theta - theta^3/6. Third
            // order keeps the drift below tool precision between the
            // periodic exact refreshes.
            let mut cos_t = 2.0 - theta_per_segment * theta_per_segment;
            let sin_t = theta_per_segment * 0.166_666_67 * (cos_t + 4.0);
            cos_t *= 0.5;

            let mut count: u16 = 0;
            for i in 1..segments {
                if count < N_ARC_CORRECTION {
                    // Rotate the radius vector by the per-segment angle.
                    let r_axisi = r_axis0 * sin_t + r_axis1 * cos_t;
                    r_axis0 = r_axis0 * cos_t - r_axis1 * sin_t;
                    r_axis1 = r_axisi;
                    count += 1;
                } else {
                    // Exact refresh from the initial radius vector, so the
                    // approximation error cannot accumulate.
                    let cos_ti = (i as f32 * theta_per_segment).cos();
                    let sin_ti = (i as f32 * theta_per_segment).sin();
                    r_axis0 = -offset[axis_0] * cos_ti + offset[axis_1] * sin_ti;
                    r_axis1 = -offset[axis_0] * sin_ti - offset[axis_1] * cos_ti;
                    count = 0;
                }

                position[axis_0] = center_axis0 + r_axis0;
                position[axis_1] = center_axis1 + r_axis1;
                position[axis_linear] += linear_per_segment;

                self.line(position, data)?;

                // Bail mid-circle on system abort.
                let state = self.fsm.state();
                if state == SystemState::Fault || state == SystemState::Alarm {
                    return Ok(());
                }
            }
        }
        // The last chord always lands exactly on the target.
        self.line(target, data)
    }

    /// Dwell for the given number of seconds, checking for fault/alarm at
    /// a fixed cadence so a dead machine does not sit in a sleep.
    pub fn dwell(&self, seconds: f32) {
        debug!(seconds, "dwell");
        let steps = (seconds * 1000.0 / DWELL_POLL_MS as f32).ceil() as u32;
        for _ in 0..steps {
            let state = self.fsm.state();
            if state == SystemState::Fault || state == SystemState::Alarm {
                return;
            }
            std::thread::sleep(Duration::from_millis(DWELL_POLL_MS));
        }
    }

    /// Block until every buffered motion has been planned out.
    pub fn buffer_synchronize(&self) {
        while !self.planner.is_empty() {
            let state = self.fsm.state();
            if state == SystemState::Fault || state == SystemState::Alarm {
                return;
            }
            std::thread::sleep(Duration::from_millis(DWELL_POLL_MS));
        }
    }

    /// Freeze the executing block and begin a forced deceleration.
    pub fn feed_hold(&self) {
        let mut prep = self.prep.lock().expect("segment preparer poisoned");
        prep.begin_feed_hold();
        self.fsm.request(SystemState::Hold);
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }
}
