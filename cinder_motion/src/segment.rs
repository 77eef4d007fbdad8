//! Segment ring and preparer.
//!
//! The preparer draws distance off the planner's current block and slices
//! it into short constant-rate segments, each sized to roughly one
//! segment-time of travel. Segments reference a stepper-block shadow (a
//! copy of the block's Bresenham data) so the planner block can be retired
//! while its last segments are still in flight.
//!
//! Ring ownership: the preparer writes the head side, the step generator
//! writes the tail side, both read both; indices are release/acquire
//! atomics. The preparer itself runs under a mutex because it is kicked
//! from both the step thread (on segment completion) and soft context
//! (cycle start); the step thread only ever try-locks it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use static_assertions::const_assert;

use cinder_common::axis::N_AXIS;
use cinder_common::consts::{ACCELERATION_TICKS_PER_SECOND, SEGMENT_BUFFER_SIZE, STEP_FREQUENCY};
use cinder_common::settings::Settings;

use crate::planner::{BlockSource, Condition, PlanBlock, PlanConsumer};

const_assert!(SEGMENT_BUFFER_SIZE > 2);

/// Target duration of one segment [min].
pub const DT_SEGMENT: f32 = 1.0 / (ACCELERATION_TICKS_PER_SECOND as f32 * 60.0);

/// Over-provision factor on the one-step minimum distance.
const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

/// Number of stepper-block shadow slots. One less than the segment ring:
/// at most that many distinct blocks can have segments in flight.
pub const ST_BLOCK_COUNT: usize = SEGMENT_BUFFER_SIZE - 1;

// ─── Shared data types ──────────────────────────────────────────────

/// Bresenham shadow of a planner block.
///
/// Step counts are doubled and the tracer starts its counters at half the
/// event count, which keeps the axis firing pattern symmetric without a
/// separate rounding term.
#[derive(Debug, Clone, Copy, Default)]
pub struct StBlock {
    pub steps: [u32; N_AXIS],
    pub step_event_count: u32,
    pub direction_bits: u8,
    /// Laser power tracks velocity within this block.
    pub is_pwm_rate_adjusted: bool,
}

/// One constant-rate slice of a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    /// Step events to emit.
    pub n_step: u16,
    /// Ticks between step events.
    pub cycles_per_tick: u32,
    /// Index of the stepper-block shadow this segment executes.
    pub st_block_index: u8,
    /// Laser PWM for this slice. Unpopulated until the laser subsystem
    /// lands; carried for pulse-stream compatibility.
    pub spindle_pwm: u8,
}

bitflags! {
    /// Step-control flags shared between preparer, step thread and the
    /// hold/cycle-start paths.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StepFlags: u8 {
        /// Segment stream ends before the block does; await cycle stop.
        const END_MOTION         = 1 << 0;
        /// Forced deceleration to zero is in progress.
        const EXECUTE_HOLD       = 1 << 1;
        /// Executing the single-shot system motion slot.
        const EXECUTE_SYS_MOTION = 1 << 2;
        /// Laser PWM must be refreshed on the next segment.
        const UPDATE_SPINDLE_PWM = 1 << 3;
    }
}

/// Atomically shared [`StepFlags`].
#[derive(Debug, Default)]
pub struct StepControl(AtomicU8);

impl StepControl {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    #[inline]
    pub fn set(&self, flags: StepFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn clear(&self, flags: StepFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn contains(&self, flags: StepFlags) -> bool {
        StepFlags::from_bits_truncate(self.0.load(Ordering::Acquire)).contains(flags)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

// ─── Segment ring ───────────────────────────────────────────────────

/// Ring of segments plus the stepper-block shadows they index.
pub struct SegmentRing {
    segments: Box<[UnsafeCell<Segment>]>,
    st_blocks: Box<[UnsafeCell<StBlock>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: single producer writes head-side slots, single consumer reads
// tail-side slots; publication goes through the atomic indices.
unsafe impl Sync for SegmentRing {}
unsafe impl Send for SegmentRing {}

impl SegmentRing {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            segments: (0..SEGMENT_BUFFER_SIZE)
                .map(|_| UnsafeCell::new(Segment::default()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            st_blocks: (0..ST_BLOCK_COUNT)
                .map(|_| UnsafeCell::new(StBlock::default()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        })
    }
}

#[inline]
fn next_index(idx: usize) -> usize {
    (idx + 1) % SEGMENT_BUFFER_SIZE
}

/// Create the segment ring and its producer/consumer handles.
pub fn segment_ring() -> (SegmentProducer, SegmentConsumer) {
    let ring = SegmentRing::new();
    (
        SegmentProducer { ring: ring.clone() },
        SegmentConsumer { ring },
    )
}

/// Producer handle, owned by the preparer.
pub struct SegmentProducer {
    ring: Arc<SegmentRing>,
}

impl SegmentProducer {
    #[inline]
    pub fn is_full(&self) -> bool {
        next_index(self.ring.head.load(Ordering::Relaxed)) == self.ring.tail.load(Ordering::Acquire)
    }

    /// Publish a finished segment.
    pub fn publish(&self, segment: Segment) {
        let head = self.ring.head.load(Ordering::Relaxed);
        // SAFETY: head slot is not visible to the consumer until the
        // index store below.
        unsafe { *self.ring.segments[head].get() = segment };
        self.ring.head.store(next_index(head), Ordering::Release);
    }

    /// Overwrite a stepper-block shadow slot.
    pub fn write_st_block(&self, idx: usize, block: StBlock) {
        // SAFETY: the preparer only reuses a slot after every segment
        // referencing it has been retired (ring capacity guarantees it).
        unsafe { *self.ring.st_blocks[idx].get() = block };
    }

    /// Drop all queued segments. Step generator must be parked.
    pub fn reset(&self) {
        self.ring.tail.store(0, Ordering::Release);
        self.ring.head.store(0, Ordering::Release);
    }
}

/// Consumer handle, owned by the step generator.
pub struct SegmentConsumer {
    ring: Arc<SegmentRing>,
}

impl SegmentConsumer {
    #[inline]
    pub fn has_ready(&self) -> bool {
        self.ring.tail.load(Ordering::Relaxed) != self.ring.head.load(Ordering::Acquire)
    }

    /// Copy of the segment at the tail. Caller checks `has_ready` first.
    pub fn tail_segment(&self) -> Segment {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        // SAFETY: tail slot belongs to the consumer until advanced.
        unsafe { *self.ring.segments[tail].get() }
    }

    /// Copy of a stepper-block shadow.
    pub fn st_block(&self, idx: usize) -> StBlock {
        // SAFETY: shadows referenced by live segments are stable.
        unsafe { *self.ring.st_blocks[idx].get() }
    }

    /// Retire the tail segment.
    pub fn advance_tail(&self) {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        self.ring.tail.store(next_index(tail), Ordering::Release);
    }
}

// ─── Preparer ───────────────────────────────────────────────────────

/// Velocity ramp the preparer is currently walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ramp {
    Accel,
    Cruise,
    Decel,
    /// Entry speed exceeds nominal; unwind before the normal profile.
    DecelOverride,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct PrepFlags: u8 {
        /// Profile must be recomputed for the retained block.
        const RECALCULATE    = 1 << 0;
        /// Next block loads as a deceleration override.
        const DECEL_OVERRIDE = 1 << 3;
    }
}

struct CurrentBlock {
    source: BlockSource,
    block: PlanBlock,
}

/// The "where am I" cursor that survives across segment generations.
pub struct SegmentPrep {
    plan: PlanConsumer,
    ring: SegmentProducer,
    control: Arc<StepControl>,

    current: Option<CurrentBlock>,
    st_block_index: u8,
    recalc: PrepFlags,

    /// Sub-step time carried into the next segment [min].
    dt_remainder: f32,
    steps_remaining: f32,
    step_per_mm: f32,
    req_mm_increment: f32,

    ramp: Ramp,
    /// Distance from block end where the velocity profile completes [mm].
    mm_complete: f32,
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    /// Acceleration ramp end, measured from end of block [mm].
    accelerate_until: f32,
    /// Deceleration ramp start, measured from end of block [mm].
    decelerate_after: f32,

    /// Inverse programmed rate, for rate-adjusted laser power.
    inv_rate: f32,
    current_spindle_pwm: u8,

    laser_power_correction: bool,
}

impl SegmentPrep {
    pub fn new(
        plan: PlanConsumer,
        ring: SegmentProducer,
        control: Arc<StepControl>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            plan,
            ring,
            control,
            current: None,
            st_block_index: 0,
            recalc: PrepFlags::empty(),
            dt_remainder: 0.0,
            steps_remaining: 0.0,
            step_per_mm: 0.0,
            req_mm_increment: 0.0,
            ramp: Ramp::Accel,
            mm_complete: 0.0,
            current_speed: 0.0,
            maximum_speed: 0.0,
            exit_speed: 0.0,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            inv_rate: 0.0,
            current_spindle_pwm: 0,
            laser_power_correction: settings.laser_power_correction,
        }
    }

    /// Start a forced deceleration: every segment prepared from here on
    /// ramps toward zero until the hold is released.
    pub fn begin_feed_hold(&mut self) {
        self.control.set(StepFlags::EXECUTE_HOLD);
        self.update_exec_block_parameters();
    }

    /// Release a feed hold so the retained block resumes from rest.
    pub fn release_feed_hold(&mut self) {
        self.control
            .clear(StepFlags::EXECUTE_HOLD | StepFlags::END_MOTION);
        self.update_exec_block_parameters();
    }

    /// Called when the plan under the executing block changed: freeze the
    /// live speed as the block's entry speed and reload on the next fill.
    pub fn update_exec_block_parameters(&mut self) {
        if let Some(current) = self.current.take() {
            self.recalc.insert(PrepFlags::RECALCULATE);
            self.plan
                .set_exec_entry_speed_sqr(current.source, self.current_speed * self.current_speed);
        }
    }

    /// Forget all cursor state. Step generator must be parked.
    pub fn reset(&mut self) {
        self.current = None;
        self.st_block_index = 0;
        self.recalc = PrepFlags::empty();
        self.dt_remainder = 0.0;
        self.steps_remaining = 0.0;
        self.step_per_mm = 0.0;
        self.req_mm_increment = 0.0;
        self.ramp = Ramp::Accel;
        self.mm_complete = 0.0;
        self.current_speed = 0.0;
        self.maximum_speed = 0.0;
        self.exit_speed = 0.0;
        self.accelerate_until = 0.0;
        self.decelerate_after = 0.0;
        self.inv_rate = 0.0;
        self.current_spindle_pwm = 0;
        self.ring.reset();
        self.control.reset();
    }

    /// Top up the segment ring from the planner until it is full or the
    /// planner runs dry.
    pub fn prep_buffer(&mut self) {
        while !self.ring.is_full() {
            // Load a block, or recompute the profile of the retained one.
            if self.current.is_none() && !self.load_next_block() {
                return;
            }

            if !self.synthesize_segment() {
                return;
            }
        }
    }

    /// Returns false when the planner has nothing to execute.
    fn load_next_block(&mut self) -> bool {
        let sys_motion = self.control.contains(StepFlags::EXECUTE_SYS_MOTION);
        let loaded = if sys_motion {
            Some(CurrentBlock {
                source: BlockSource::System,
                block: self.plan.system_snapshot(),
            })
        } else {
            self.plan.tail_snapshot().map(|block| CurrentBlock {
                source: BlockSource::Queue,
                block,
            })
        };
        let Some(mut current) = loaded else {
            return false;
        };

        if self.recalc.contains(PrepFlags::RECALCULATE) {
            // Same block, new plan: keep the Bresenham shadow and cursor.
            self.recalc = PrepFlags::empty();
        } else {
            // Fresh block: copy its Bresenham data into the next shadow
            // slot so the block can retire ahead of its last segments.
            self.st_block_index = next_st_block_index(self.st_block_index);
            let mut shadow = StBlock {
                direction_bits: current.block.direction_bits,
                step_event_count: current.block.step_event_count << 1,
                ..StBlock::default()
            };
            for idx in 0..N_AXIS {
                shadow.steps[idx] = current.block.steps[idx] << 1;
            }

            self.steps_remaining = current.block.step_event_count as f32;
            self.step_per_mm = self.steps_remaining / current.block.millimeters;
            self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
            self.dt_remainder = 0.0;

            if self.control.contains(StepFlags::EXECUTE_HOLD)
                || self.recalc.contains(PrepFlags::DECEL_OVERRIDE)
            {
                // Block loaded mid-hold: enforce continued deceleration.
                self.current_speed = self.exit_speed;
                current.block.entry_speed_sqr = self.exit_speed * self.exit_speed;
                self.plan
                    .set_exec_entry_speed_sqr(current.source, current.block.entry_speed_sqr);
                self.recalc.remove(PrepFlags::DECEL_OVERRIDE);
            } else {
                self.current_speed = current.block.entry_speed_sqr.sqrt();
            }

            shadow.is_pwm_rate_adjusted = false;
            if self.laser_power_correction
                && current.block.condition.contains(Condition::SPINDLE_CCW)
            {
                self.inv_rate = 1.0 / current.block.programmed_rate;
                shadow.is_pwm_rate_adjusted = true;
            }
            self.ring.write_st_block(self.st_block_index as usize, shadow);
        }

        self.compute_profile(&current);
        self.control.set(StepFlags::UPDATE_SPINDLE_PWM);
        self.current = Some(current);
        true
    }

    /// Build the velocity profile for the (re)loaded block.
    fn compute_profile(&mut self, current: &CurrentBlock) {
        let block = &current.block;
        self.mm_complete = 0.0;
        let inv_2_accel = 0.5 / block.acceleration;

        if self.control.contains(StepFlags::EXECUTE_HOLD) {
            // Forced deceleration to zero velocity.
            self.ramp = Ramp::Decel;
            let decel_dist = block.millimeters - inv_2_accel * block.entry_speed_sqr;
            if decel_dist < 0.0 {
                // The hold does not finish inside this block.
                self.exit_speed =
                    (block.entry_speed_sqr - 2.0 * block.acceleration * block.millimeters).sqrt();
            } else {
                self.mm_complete = decel_dist;
                self.exit_speed = 0.0;
            }
            return;
        }

        // Normal operation: trapezoid / triangle / wedge profiles.
        self.ramp = Ramp::Accel;
        self.accelerate_until = block.millimeters;

        let exit_speed_sqr = if current.source == BlockSource::System {
            self.exit_speed = 0.0;
            0.0
        } else {
            let v = self.plan.exec_exit_speed_sqr();
            self.exit_speed = v.sqrt();
            v
        };

        let nominal_speed = crate::planner::profile_nominal_speed(block);
        let nominal_speed_sqr = nominal_speed * nominal_speed;
        let intersect_distance =
            0.5 * (block.millimeters + inv_2_accel * (block.entry_speed_sqr - exit_speed_sqr));

        if block.entry_speed_sqr > nominal_speed_sqr {
            // Entry above nominal only happens after an override reduction.
            self.accelerate_until =
                block.millimeters - inv_2_accel * (block.entry_speed_sqr - nominal_speed_sqr);
            if self.accelerate_until <= 0.0 {
                // Deceleration spans the whole block.
                self.ramp = Ramp::Decel;
                self.exit_speed =
                    (block.entry_speed_sqr - 2.0 * block.acceleration * block.millimeters).sqrt();
                self.recalc.insert(PrepFlags::DECEL_OVERRIDE);
            } else {
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                self.maximum_speed = nominal_speed;
                self.ramp = Ramp::DecelOverride;
            }
        } else if intersect_distance > 0.0 {
            if intersect_distance < block.millimeters {
                // Trapezoid or triangle.
                self.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                if self.decelerate_after < intersect_distance {
                    // Trapezoid.
                    self.maximum_speed = nominal_speed;
                    if block.entry_speed_sqr == nominal_speed_sqr {
                        self.ramp = Ramp::Cruise;
                    } else {
                        self.accelerate_until -=
                            inv_2_accel * (nominal_speed_sqr - block.entry_speed_sqr);
                    }
                } else {
                    // Triangle.
                    self.accelerate_until = intersect_distance;
                    self.decelerate_after = intersect_distance;
                    self.maximum_speed =
                        (2.0 * block.acceleration * intersect_distance + exit_speed_sqr).sqrt();
                }
            } else {
                // Deceleration only.
                self.ramp = Ramp::Decel;
            }
        } else {
            // Acceleration only.
            self.accelerate_until = 0.0;
            self.maximum_speed = self.exit_speed;
        }
    }

    /// Produce one segment. Returns false when the preparer must stop
    /// (planner dry, end of hold, or end of system motion).
    fn synthesize_segment(&mut self) -> bool {
        let (source, block) = {
            let current = self.current.as_ref().expect("block loaded");
            (current.source, current.block)
        };

        let mut segment = Segment {
            st_block_index: self.st_block_index,
            ..Segment::default()
        };

        // Walk the ramps until one segment-time of travel is accumulated.
        // A segment may terminate early only at the end of the velocity
        // profile.
        let mut dt_max = DT_SEGMENT;
        let mut dt = 0.0f32;
        let mut time_var = dt_max;
        let mut mm_var: f32;
        let mut speed_var: f32;
        let mut mm_remaining = block.millimeters;
        let minimum_mm = (mm_remaining - self.req_mm_increment).max(0.0);

        loop {
            match self.ramp {
                Ramp::DecelOverride => {
                    speed_var = block.acceleration * time_var;
                    if self.current_speed - self.maximum_speed <= speed_var {
                        // Ramp flattens onto the cruise of the new plan.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (block.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        self.ramp = Ramp::Cruise;
                        self.current_speed = self.maximum_speed;
                    } else {
                        mm_remaining -= time_var * (self.current_speed - 0.5 * speed_var);
                        self.current_speed -= speed_var;
                    }
                }
                Ramp::Accel => {
                    speed_var = block.acceleration * time_var;
                    mm_remaining -= time_var * (self.current_speed + 0.5 * speed_var);
                    if mm_remaining < self.accelerate_until {
                        // End of the acceleration ramp; 0.0 at end of block.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (block.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        self.ramp = if mm_remaining == self.decelerate_after {
                            Ramp::Decel
                        } else {
                            Ramp::Cruise
                        };
                        self.current_speed = self.maximum_speed;
                    } else {
                        self.current_speed += speed_var;
                    }
                }
                Ramp::Cruise => {
                    // Low cruise speeds are floored elsewhere; mm_var keeps
                    // the last distance for incomplete-segment timing.
                    mm_var = mm_remaining - self.maximum_speed * time_var;
                    if mm_var < self.decelerate_after {
                        time_var = (mm_remaining - self.decelerate_after) / self.maximum_speed;
                        mm_remaining = self.decelerate_after;
                        self.ramp = Ramp::Decel;
                    } else {
                        mm_remaining = mm_var;
                    }
                }
                Ramp::Decel => {
                    speed_var = block.acceleration * time_var;
                    let mut in_ramp = false;
                    if self.current_speed > speed_var {
                        mm_var =
                            mm_remaining - time_var * (self.current_speed - 0.5 * speed_var);
                        if mm_var > self.mm_complete {
                            mm_remaining = mm_var;
                            self.current_speed -= speed_var;
                            in_ramp = true;
                        }
                    }
                    if !in_ramp {
                        // End of block or end of forced deceleration.
                        time_var = 2.0 * (mm_remaining - self.mm_complete)
                            / (self.current_speed + self.exit_speed);
                        mm_remaining = self.mm_complete;
                        self.current_speed = self.exit_speed;
                    }
                }
            }

            dt += time_var;
            if dt < dt_max {
                // Incomplete segment at a ramp junction.
                time_var = dt_max - dt;
            } else if mm_remaining > minimum_mm {
                // Very slow motion: stretch the segment until it carries
                // at least one whole step.
                dt_max += DT_SEGMENT;
                time_var = dt_max - dt;
            } else {
                break;
            }
            if mm_remaining <= self.mm_complete {
                break;
            }
        }

        // Laser power for this slice. Kept at zero until the laser
        // subsystem is reintroduced; the update flag is consumed so the
        // cadence matches the pulse stream.
        if self.control.contains(StepFlags::UPDATE_SPINDLE_PWM) {
            self.control.clear(StepFlags::UPDATE_SPINDLE_PWM);
        }
        segment.spindle_pwm = self.current_spindle_pwm;

        // Convert the distance consumed into whole steps. Steps are
        // derived from the absolute remaining distance rather than summed
        // per segment, so float round-off cannot accumulate.
        let step_dist_remaining = self.step_per_mm * mm_remaining;
        let n_steps_remaining = step_dist_remaining.ceil();
        let last_n_steps_remaining = self.steps_remaining.ceil();
        segment.n_step = (last_n_steps_remaining - n_steps_remaining) as u16;

        if segment.n_step == 0 && self.control.contains(StepFlags::EXECUTE_HOLD) {
            // Less than one step left to reach zero speed; close enough.
            // The segment is not generated but the cursor is retained.
            self.control.set(StepFlags::END_MOTION);
            return false;
        }

        // Carry the partial-step time into the next segment so long-range
        // step timing stays exact despite per-segment rounding.
        dt += self.dt_remainder;
        let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);

        segment.cycles_per_tick = (STEP_FREQUENCY as f32 * 60.0 * inv_rate).ceil() as u32;

        self.ring.publish(segment);

        if let Some(current) = self.current.as_mut() {
            current.block.millimeters = mm_remaining;
        }
        self.plan.set_exec_millimeters(source, mm_remaining);
        self.steps_remaining = n_steps_remaining;
        self.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;

        if mm_remaining == self.mm_complete {
            if mm_remaining > 0.0 {
                // End of forced deceleration mid-block: leave the rest of
                // the block queued for resumption.
                self.control.set(StepFlags::END_MOTION);
                return false;
            }
            // End of block.
            if self.control.contains(StepFlags::EXECUTE_SYS_MOTION) {
                self.control.set(StepFlags::END_MOTION);
                return false;
            }
            self.current = None;
            self.plan.discard_tail();
        }
        true
    }
}

#[inline]
fn next_st_block_index(idx: u8) -> u8 {
    let next = idx.wrapping_add(1);
    if next as usize == ST_BLOCK_COUNT {
        0
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_fills_and_drains() {
        let (producer, consumer) = segment_ring();
        assert!(!consumer.has_ready());

        producer.publish(Segment {
            n_step: 7,
            cycles_per_tick: 100,
            st_block_index: 1,
            spindle_pwm: 0,
        });
        assert!(consumer.has_ready());
        let seg = consumer.tail_segment();
        assert_eq!(seg.n_step, 7);
        consumer.advance_tail();
        assert!(!consumer.has_ready());
    }

    #[test]
    fn ring_reports_full() {
        let (producer, _consumer) = segment_ring();
        for _ in 0..SEGMENT_BUFFER_SIZE - 1 {
            assert!(!producer.is_full());
            producer.publish(Segment::default());
        }
        assert!(producer.is_full());
    }

    #[test]
    fn st_block_index_wraps_before_ring_size() {
        let mut idx = 0u8;
        for _ in 0..ST_BLOCK_COUNT {
            idx = next_st_block_index(idx);
            assert!((idx as usize) < ST_BLOCK_COUNT);
        }
        assert_eq!(idx, 0);
    }

    #[test]
    fn step_control_flags() {
        let control = StepControl::new();
        control.set(StepFlags::EXECUTE_HOLD);
        assert!(control.contains(StepFlags::EXECUTE_HOLD));
        assert!(!control.contains(StepFlags::END_MOTION));
        control.clear(StepFlags::EXECUTE_HOLD);
        assert!(!control.contains(StepFlags::EXECUTE_HOLD));
    }
}
