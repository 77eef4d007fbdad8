//! End-to-end tests of the motion pipeline: text line in, step pulses
//! and machine position out. The step generator is driven tick by tick
//! on the test thread, so time advances explicitly and nothing races.

use std::sync::{Arc, Mutex};

use cinder_common::consts::STEP_FREQUENCY;
use cinder_common::fsm::Fsm;
use cinder_common::position::SysPosition;
use cinder_common::settings::Settings;

use cinder_motion::control::MotionControl;
use cinder_motion::gcode::GcodeParser;
use cinder_motion::planner::{planner_queue, Planner};
use cinder_motion::segment::{segment_ring, SegmentPrep, StepControl, StepFlags};
use cinder_motion::stepgen::{StepGenerator, Tick, VecSink};

struct Harness {
    parser: GcodeParser,
    prep: Arc<Mutex<SegmentPrep>>,
    control: Arc<StepControl>,
    stepgen: StepGenerator,
    sink: VecSink,
    position: Arc<SysPosition>,
    settings: Arc<Settings>,
}

fn build() -> Harness {
    let mut settings = Settings::default();
    settings.cli.mdi_mode = false;
    settings.cli.auto_cycle = false;
    let settings = Arc::new(settings);

    let position = Arc::new(SysPosition::new());
    let (fsm, _fsm_task) = Fsm::start();
    let (queue, plan_consumer) = planner_queue();
    let (seg_producer, seg_consumer) = segment_ring();
    let control = Arc::new(StepControl::new());

    let prep = Arc::new(Mutex::new(SegmentPrep::new(
        plan_consumer,
        seg_producer,
        control.clone(),
        settings.clone(),
    )));

    let planner = Planner::new(queue, prep.clone(), settings.clone(), position.clone());
    let motion = MotionControl::new(planner, prep.clone(), fsm.clone(), settings.clone());
    let parser = GcodeParser::new(motion, position.clone(), Box::new(|_| {}));
    let stepgen = StepGenerator::new(seg_consumer, prep.clone(), fsm, position.clone());

    Harness {
        parser,
        prep,
        control,
        stepgen,
        sink: VecSink::default(),
        position,
        settings,
    }
}

impl Harness {
    /// Charge the segment ring, then tick until the generator drains.
    /// Returns (step events, total ticks).
    fn run_out(&mut self) -> (u64, u64) {
        self.prep.lock().unwrap().prep_buffer();
        let mut pulses = 0u64;
        let mut ticks = 0u64;
        for _ in 0..500_000_000u64 {
            match self.stepgen.tick(&mut self.sink) {
                Tick::Pulse(_) => {
                    pulses += 1;
                    ticks += 1;
                }
                Tick::Spacer => ticks += 1,
                Tick::Drained => return (pulses, ticks),
            }
        }
        panic!("step generator never drained");
    }
}

#[test]
fn rapid_line_reaches_exact_position() {
    let mut h = build();
    h.parser.execute_line("G0X100Y0F0").unwrap();
    let (pulses, _) = h.run_out();

    assert_eq!(h.position.get(0), 10667);
    assert_eq!(h.position.get(1), 0);
    assert_eq!(h.position.get(2), 0);
    // Every step event surfaced as exactly one pulse byte.
    assert_eq!(pulses, 10667);

    // Reported machine position lands within a hundredth of a millimeter.
    let mm = h.position.get(0) as f32 / h.settings.steps_per_mm[0];
    assert!((mm - 100.0).abs() < 0.01, "reported {mm}");
}

#[test]
fn segment_steps_sum_to_block_event_count() {
    let mut h = build();
    h.parser.execute_line("G1X25Y13F2000").unwrap();
    let (pulses, _) = h.run_out();

    let spm = &h.settings.steps_per_mm;
    let expect = ((25.0 * spm[0]).round() as u64).max((13.0 * spm[1]).round() as u64);
    assert_eq!(pulses, expect);
}

#[test]
fn step_timing_matches_trapezoid_prediction() {
    let mut h = build();
    // Long enough to cruise: trapezoidal profile.
    h.parser.execute_line("G1X200F3000").unwrap();
    let (_, ticks) = h.run_out();

    // Predict execution time from the profile: accelerate to 3000 mm/min,
    // cruise, decelerate. Acceleration is 720000 mm/min^2.
    let v: f64 = 3000.0;
    let a: f64 = 720_000.0;
    let d: f64 = 200.0;
    let d_ramp = v * v / (2.0 * a);
    let t_min = 2.0 * (v / a) + (d - 2.0 * d_ramp) / v;
    let predicted_ticks = t_min * 60.0 * STEP_FREQUENCY as f64;

    // The pulse stream quantizes each step interval up to a whole tick,
    // so execution runs slightly long of the ideal profile; anything
    // beyond that points at a broken ramp computation.
    let err = (ticks as f64 - predicted_ticks) / predicted_ticks;
    assert!(
        (-0.01..0.10).contains(&err),
        "ticks {ticks} vs predicted {predicted_ticks:.0} ({:.2}%)",
        err * 100.0
    );
}

#[test]
fn multi_line_program_executes_in_order() {
    let mut h = build();
    h.parser.execute_line("G0X10").unwrap();
    h.parser.execute_line("G1Y10F1500").unwrap();
    h.parser.execute_line("G1X0Y0F1500").unwrap();
    h.run_out();

    assert_eq!(h.position.get(0), 0);
    assert_eq!(h.position.get(1), 0);
}

#[test]
fn full_circle_returns_to_start() {
    let mut h = build();
    h.parser.execute_line("G0X200Y135").unwrap();
    h.parser.execute_line("G2X200Y135I50J0F3000").unwrap();
    h.run_out();

    let spm = &h.settings.steps_per_mm;
    let x_mm = h.position.get(0) as f32 / spm[0];
    let y_mm = h.position.get(1) as f32 / spm[1];
    assert!((x_mm - 200.0).abs() < 0.02, "x {x_mm}");
    assert!((y_mm - 135.0).abs() < 0.02, "y {y_mm}");
}

#[test]
fn feed_hold_decelerates_and_resumes() {
    let mut h = build();
    // One long block.
    h.parser.execute_line("G1X300F3000").unwrap();
    h.prep.lock().unwrap().prep_buffer();

    // Execute part of the block, then ask for a hold.
    let mut mid_pulses = 0u64;
    for _ in 0..STEP_FREQUENCY {
        if let Tick::Pulse(_) = h.stepgen.tick(&mut h.sink) {
            mid_pulses += 1;
        }
    }
    assert!(mid_pulses > 0);
    h.prep.lock().unwrap().begin_feed_hold();

    // Drain: the remaining segments ramp down to zero speed well before
    // the block's end.
    let (_, _) = h.run_out();
    assert!(h.control.contains(StepFlags::END_MOTION));
    let total = (300.0f32 * h.settings.steps_per_mm[0]).round() as i32;
    let at_hold = h.position.get(0);
    assert!(at_hold > 0 && at_hold < total, "stopped at {at_hold}/{total}");

    // Resume: the remaining distance is still in the block.
    h.prep.lock().unwrap().release_feed_hold();
    h.run_out();
    assert_eq!(h.position.get(0), total);
}

#[test]
fn hold_ends_at_crawl_speed() {
    let mut h = build();
    h.parser.execute_line("G1X300F3000").unwrap();
    {
        let mut prep = h.prep.lock().unwrap();
        prep.prep_buffer();
        prep.begin_feed_hold();
    }
    // Record the tick interval between consecutive steps across the whole
    // ramp-down.
    let mut intervals = Vec::new();
    let mut gap = 0u64;
    loop {
        match h.stepgen.tick(&mut h.sink) {
            Tick::Pulse(_) => {
                intervals.push(gap);
                gap = 0;
            }
            Tick::Spacer => gap += 1,
            Tick::Drained => break,
        }
    }
    assert!(h.control.contains(StepFlags::END_MOTION));
    // The stream must end far slower than its fastest point: the forced
    // deceleration ramped the speed toward zero before stopping.
    let fastest = *intervals.iter().min().unwrap();
    let last = *intervals.last().unwrap();
    assert!(
        last >= 3 * (fastest + 1),
        "last interval {last}, fastest {fastest}"
    );
}
