//! Motion planner.
//!
//! Buffers linear motions as blocks in a ring and keeps an
//! acceleration-limited velocity plan across the whole buffer. Every
//! insertion runs a reverse pass (propagate reachable entry speeds back
//! from the newest block) and a forward pass (cap entry speeds by what the
//! previous block can actually accelerate to). A `planned` index marks the
//! point behind which the plan is already optimal and never needs to be
//! revisited.
//!
//! Ownership of the ring is split: the parser worker is the single
//! producer (insertion and replanning), the segment preparer is the single
//! consumer (reading the tail block, consuming its distance, retiring it).
//! Indices are published with release/acquire ordering. The block under
//! execution is never replanned directly; when the reverse pass reaches
//! it, the preparer is told to freeze its current speed as the new entry
//! speed and recompute its profile.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use static_assertions::const_assert;
use tracing::debug;

use cinder_common::axis::{Axis, N_AXIS};
use cinder_common::consts::{BLOCK_BUFFER_SIZE, MINIMUM_FEED_RATE, MINIMUM_JUNCTION_SPEED};
use cinder_common::position::SysPosition;
use cinder_common::settings::Settings;

use crate::segment::SegmentPrep;

const_assert!(BLOCK_BUFFER_SIZE > 2);

/// Stand-in for an unbounded junction speed on a straight junction.
const SOME_LARGE_VALUE: f32 = 1.0e38;

bitflags! {
    /// Run conditions of a block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Condition: u8 {
        /// Rapid (seek) motion; programmed rate is ignored.
        const RAPID_MOTION  = 1 << 0;
        /// Single-shot motion that bypasses the queue (homing/park).
        const SYSTEM_MOTION = 1 << 1;
        /// Feed rate value is inverse time for this block.
        const INVERSE_TIME  = 1 << 3;
        const SPINDLE_CW    = 1 << 4;
        const SPINDLE_CCW   = 1 << 5;
        const COOLANT_FLOOD = 1 << 6;
        const COOLANT_MIST  = 1 << 7;
    }
}

/// One planned linear motion.
///
/// The Bresenham fields (`steps`, `step_event_count`, `direction_bits`)
/// are fixed once the block is queued. `millimeters` is consumed in place
/// by the segment preparer; `entry_speed_sqr` changes as the look-ahead
/// replans the buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanBlock {
    /// Unsigned step count along each axis.
    pub steps: [u32; N_AXIS],
    /// Largest per-axis step count; step events needed to finish the block.
    pub step_event_count: u32,
    /// Direction bit set in pulse-byte layout.
    pub direction_bits: u8,
    /// Run condition flags.
    pub condition: Condition,

    /// Planned entry speed at the junction into this block [(mm/min)^2].
    pub entry_speed_sqr: f32,
    /// Upper bound for the entry speed: junction limit capped by the
    /// nominal speeds on both sides [(mm/min)^2].
    pub max_entry_speed_sqr: f32,
    /// Axis-limited line acceleration [mm/min^2].
    pub acceleration: f32,
    /// Remaining distance of this block [mm]. Consumed by the preparer.
    pub millimeters: f32,

    /// Junction speed limit from the direction change alone [(mm/min)^2].
    pub max_junction_speed_sqr: f32,
    /// Axis-limited maximum rate along this direction [mm/min].
    pub rapid_rate: f32,
    /// Rate programmed on the source line [mm/min].
    pub programmed_rate: f32,

    /// Spindle speed entering the block.
    pub spindle_speed: f32,
}

/// Feed/spindle/condition descriptor for a new motion.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineData {
    pub feed_rate: f32,
    pub spindle_speed: f32,
    pub condition: Condition,
}

/// Nominal speed of a block: programmed (or rapid) rate capped by the
/// axis-limited rate, floored at the minimum schedulable feed.
pub fn profile_nominal_speed(block: &PlanBlock) -> f32 {
    let nominal = if block.condition.contains(Condition::RAPID_MOTION) {
        block.rapid_rate
    } else {
        block.programmed_rate
    };
    nominal.min(block.rapid_rate).max(MINIMUM_FEED_RATE)
}

#[inline]
fn next_index(idx: usize) -> usize {
    (idx + 1) % BLOCK_BUFFER_SIZE
}

#[inline]
fn prev_index(idx: usize) -> usize {
    (idx + BLOCK_BUFFER_SIZE - 1) % BLOCK_BUFFER_SIZE
}

/// Length of a delta vector; normalizes it in place.
fn to_unit_vector(vector: &mut [f32; N_AXIS]) -> f32 {
    let mut magnitude_sqr = 0.0;
    for v in vector.iter() {
        if *v != 0.0 {
            magnitude_sqr += v * v;
        }
    }
    let magnitude = magnitude_sqr.sqrt();
    let inv = 1.0 / magnitude;
    for v in vector.iter_mut() {
        *v *= inv;
    }
    magnitude
}

/// Smallest per-axis limit projected onto a unit direction vector.
fn limit_by_axis_maximum(max_value: &[f32; N_AXIS], unit_vec: &[f32; N_AXIS]) -> f32 {
    let mut limit = SOME_LARGE_VALUE;
    for idx in 0..N_AXIS {
        if unit_vec[idx] != 0.0 {
            limit = limit.min((max_value[idx] / unit_vec[idx]).abs());
        }
    }
    limit
}

// ─── Shared ring ────────────────────────────────────────────────────

/// The block ring shared between producer and consumer handles.
///
/// `head` is the next write slot (producer-owned), `tail` the oldest live
/// block (consumer-owned), `planned` the optimal-plan watermark. Block
/// storage is interior-mutable; the ownership protocol is enforced by the
/// two handle types below, which exist exactly once each.
pub struct PlannerQueue {
    blocks: Box<[UnsafeCell<PlanBlock>]>,
    system_block: UnsafeCell<PlanBlock>,
    head: AtomicUsize,
    tail: AtomicUsize,
    planned: AtomicUsize,
}

// SAFETY: concurrent access is partitioned by the producer/consumer
// protocol documented on the handle methods; indices are atomics.
unsafe impl Sync for PlannerQueue {}
unsafe impl Send for PlannerQueue {}

impl PlannerQueue {
    fn new() -> Arc<Self> {
        let blocks = (0..BLOCK_BUFFER_SIZE)
            .map(|_| UnsafeCell::new(PlanBlock::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            blocks,
            system_block: UnsafeCell::new(PlanBlock::default()),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            planned: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    #[inline]
    fn is_full(&self) -> bool {
        next_index(self.head()) == self.tail()
    }

    /// Raw access to a block slot.
    ///
    /// # Safety
    /// The caller must hold the mutation rights for this slot under the
    /// producer/consumer protocol.
    #[allow(clippy::mut_from_ref)]
    unsafe fn block_mut(&self, idx: usize) -> &mut PlanBlock {
        &mut *self.blocks[idx].get()
    }
}

/// Create the planner ring and its two handles.
pub fn planner_queue() -> (Arc<PlannerQueue>, PlanConsumer) {
    let queue = PlannerQueue::new();
    let consumer = PlanConsumer {
        queue: queue.clone(),
    };
    (queue, consumer)
}

/// Identifies which block the preparer is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// The block at the ring tail.
    Queue,
    /// The single-shot system motion slot.
    System,
}

/// Consumer-side handle held by the segment preparer.
pub struct PlanConsumer {
    queue: Arc<PlannerQueue>,
}

impl PlanConsumer {
    /// Extra observer handle for crate-internal tests.
    #[cfg(test)]
    pub(crate) fn test_handle(queue: Arc<PlannerQueue>) -> Self {
        Self { queue }
    }

    /// Copy of the tail block, if any.
    pub fn tail_snapshot(&self) -> Option<PlanBlock> {
        let q = &self.queue;
        if q.is_empty() {
            return None;
        }
        // SAFETY: the tail block belongs to the consumer until discarded.
        Some(unsafe { *q.block_mut(q.tail()) })
    }

    /// Copy of the system motion slot.
    pub fn system_snapshot(&self) -> PlanBlock {
        // SAFETY: producer writes the slot only while no system motion is
        // executing.
        unsafe { *self.queue.system_block.get() }
    }

    /// Store the distance still to execute on the current block.
    pub fn set_exec_millimeters(&self, source: BlockSource, mm: f32) {
        // SAFETY: see `tail_snapshot`/`system_snapshot`.
        unsafe {
            match source {
                BlockSource::Queue => self.queue.block_mut(self.queue.tail()).millimeters = mm,
                BlockSource::System => (*self.queue.system_block.get()).millimeters = mm,
            }
        }
    }

    /// Freeze a new entry speed on the current block.
    pub fn set_exec_entry_speed_sqr(&self, source: BlockSource, v_sqr: f32) {
        // SAFETY: see `tail_snapshot`/`system_snapshot`.
        unsafe {
            match source {
                BlockSource::Queue => {
                    self.queue.block_mut(self.queue.tail()).entry_speed_sqr = v_sqr
                }
                BlockSource::System => (*self.queue.system_block.get()).entry_speed_sqr = v_sqr,
            }
        }
    }

    /// Exit speed of the executing block: the entry speed of the block
    /// behind it, or zero when it is the last one.
    pub fn exec_exit_speed_sqr(&self) -> f32 {
        let q = &self.queue;
        let idx = next_index(q.tail());
        if idx == q.head() {
            0.0
        } else {
            // SAFETY: aligned f32 read; the producer only raises or lowers
            // this value between segment generations.
            unsafe { q.block_mut(idx).entry_speed_sqr }
        }
    }

    /// Retire the tail block after the preparer has drained it.
    pub fn discard_tail(&self) {
        let q = &self.queue;
        let tail = q.tail();
        if q.head() != tail {
            let next = next_index(tail);
            // The plan watermark never trails the live tail.
            if q.planned.load(Ordering::Relaxed) == tail {
                q.planned.store(next, Ordering::Relaxed);
            }
            q.tail.store(next, Ordering::Release);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ─── Producer side ──────────────────────────────────────────────────

/// Producer-side planner state, owned by the parser worker.
pub struct Planner {
    queue: Arc<PlannerQueue>,
    /// Preparer handle for freezing the executing block on replan.
    prep: Arc<Mutex<SegmentPrep>>,
    settings: Arc<Settings>,
    sys_position: Arc<SysPosition>,
    /// Planner position in steps; trails the parser, leads the machine.
    position: [i32; N_AXIS],
    previous_unit_vec: [f32; N_AXIS],
    previous_nominal_speed: f32,
}

impl Planner {
    pub fn new(
        queue: Arc<PlannerQueue>,
        prep: Arc<Mutex<SegmentPrep>>,
        settings: Arc<Settings>,
        sys_position: Arc<SysPosition>,
    ) -> Self {
        Self {
            queue,
            prep,
            settings,
            sys_position,
            position: [0; N_AXIS],
            previous_unit_vec: [0.0; N_AXIS],
            previous_nominal_speed: 0.0,
        }
    }

    /// True when no insertion slot is free.
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// True when no block is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Reset the planner position from the machine position.
    pub fn sync_position(&mut self) {
        self.position = self.sys_position.snapshot();
    }

    /// Plan a new linear motion to an absolute target in millimeters.
    ///
    /// Returns `false` for a zero-length move, which queues nothing.
    pub fn buffer_line(&mut self, target: &[f32; N_AXIS], data: &LineData) -> bool {
        let spm = &self.settings.steps_per_mm;
        let mut block = PlanBlock {
            condition: data.condition,
            spindle_speed: data.spindle_speed,
            ..PlanBlock::default()
        };

        let position_steps = if data.condition.contains(Condition::SYSTEM_MOTION) {
            self.sys_position.snapshot()
        } else {
            self.position
        };

        let mut target_steps = [0i32; N_AXIS];
        let mut unit_vec = [0f32; N_AXIS];
        for idx in 0..N_AXIS {
            target_steps[idx] = (target[idx] * spm[idx]).round() as i32;
            let delta = target_steps[idx] - position_steps[idx];
            block.steps[idx] = delta.unsigned_abs();
            block.step_event_count = block.step_event_count.max(block.steps[idx]);
            unit_vec[idx] = delta as f32 / spm[idx];
            if delta < 0 {
                block.direction_bits |= Axis::ALL[idx].dir_bit();
            }
        }

        if block.step_event_count == 0 {
            return false;
        }

        block.millimeters = to_unit_vector(&mut unit_vec);
        block.acceleration = limit_by_axis_maximum(&self.settings.acceleration, &unit_vec);
        block.rapid_rate = limit_by_axis_maximum(&self.settings.max_rate, &unit_vec);

        if data.condition.contains(Condition::RAPID_MOTION) {
            block.programmed_rate = block.rapid_rate;
        } else {
            block.programmed_rate = data.feed_rate;
            if data.condition.contains(Condition::INVERSE_TIME) {
                block.programmed_rate *= block.millimeters;
            }
        }

        if data.condition.contains(Condition::SYSTEM_MOTION) {
            // Single-shot motion: starts and ends at rest, bypasses the
            // queue and the look-ahead entirely.
            block.entry_speed_sqr = 0.0;
            block.max_entry_speed_sqr = 0.0;
            block.max_junction_speed_sqr = 0.0;
            // SAFETY: no system motion is executing while one is planned.
            unsafe { *self.queue.system_block.get() = block };
            return true;
        }

        let nominal_speed = profile_nominal_speed(&block);

        if self.queue.is_empty() {
            // First block after an empty buffer starts from rest.
            block.max_junction_speed_sqr = 0.0;
        } else {
            // Corner speed from the angle between the previous and the new
            // direction: v^2 <= a * d * sin(theta/2) / (1 - sin(theta/2)).
            let mut junction_cos_theta = 0.0;
            for idx in 0..N_AXIS {
                junction_cos_theta -= self.previous_unit_vec[idx] * unit_vec[idx];
            }
            block.max_junction_speed_sqr = if junction_cos_theta > 0.999999 {
                // Full reversal.
                MINIMUM_JUNCTION_SPEED * MINIMUM_JUNCTION_SPEED
            } else if junction_cos_theta < -0.999999 {
                // Straight through.
                SOME_LARGE_VALUE
            } else {
                let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
                (MINIMUM_JUNCTION_SPEED * MINIMUM_JUNCTION_SPEED).max(
                    block.acceleration * self.settings.junction_deviation * sin_theta_d2
                        / (1.0 - sin_theta_d2),
                )
            };
        }

        block.max_entry_speed_sqr = block.max_junction_speed_sqr.min(
            (nominal_speed * nominal_speed)
                .min(self.previous_nominal_speed * self.previous_nominal_speed),
        );
        block.entry_speed_sqr = 0.0;

        let head = self.queue.head.load(Ordering::Relaxed);
        // SAFETY: the head slot is free; the store below publishes it.
        unsafe { *self.queue.block_mut(head) = block };
        self.queue.head.store(next_index(head), Ordering::Release);

        self.position = target_steps;
        self.previous_unit_vec = unit_vec;
        self.previous_nominal_speed = nominal_speed;

        self.recalculate();
        debug!(
            steps = ?block.steps,
            mm = block.millimeters,
            rate = block.programmed_rate,
            "block queued"
        );
        true
    }

    /// Reverse-then-forward look-ahead pass over the unplanned portion of
    /// the buffer.
    fn recalculate(&mut self) {
        let q = &self.queue;
        let head = q.head.load(Ordering::Relaxed);
        let planned = q.planned.load(Ordering::Relaxed);

        // Index of the newest block.
        let mut block_index = prev_index(head);
        if block_index == planned {
            // A single unplanned block cannot be improved.
            return;
        }

        // Reverse pass. The newest block always plans to stop at its end.
        // SAFETY (throughout): blocks in (planned, head) are producer
        // territory; the executing block is only touched through the
        // preparer freeze below.
        let mut current = block_index;
        unsafe {
            let b = q.block_mut(current);
            b.entry_speed_sqr = b
                .max_entry_speed_sqr
                .min(2.0 * b.acceleration * b.millimeters);
        }

        block_index = prev_index(block_index);
        if block_index == planned {
            // Two unplanned blocks. If the older one is executing, its
            // parameters moved under the preparer's feet: freeze them.
            if block_index == q.tail() {
                self.freeze_executing_block();
            }
        } else {
            while block_index != planned {
                let next = current;
                current = block_index;
                block_index = prev_index(block_index);

                if block_index == q.tail() {
                    self.freeze_executing_block();
                }

                unsafe {
                    let next_entry = q.block_mut(next).entry_speed_sqr;
                    let b = q.block_mut(current);
                    if b.entry_speed_sqr != b.max_entry_speed_sqr {
                        let reachable = next_entry + 2.0 * b.acceleration * b.millimeters;
                        b.entry_speed_sqr = b.max_entry_speed_sqr.min(reachable);
                    }
                }
            }
        }

        // Forward pass from the optimal watermark.
        let mut current = q.planned.load(Ordering::Relaxed);
        let mut block_index = next_index(current);
        while block_index != head {
            unsafe {
                let (cur_entry, cur_reach) = {
                    let cur = q.block_mut(current);
                    (
                        cur.entry_speed_sqr,
                        cur.entry_speed_sqr + 2.0 * cur.acceleration * cur.millimeters,
                    )
                };
                let next = q.block_mut(block_index);
                // An acceleration-limited junction is optimal; everything
                // before it never needs replanning again.
                if cur_entry < next.entry_speed_sqr && cur_reach < next.entry_speed_sqr {
                    next.entry_speed_sqr = cur_reach;
                    q.planned.store(block_index, Ordering::Relaxed);
                }
                if next.entry_speed_sqr == next.max_entry_speed_sqr {
                    q.planned.store(block_index, Ordering::Relaxed);
                }
            }
            current = block_index;
            block_index = next_index(block_index);
        }
    }

    /// Tell the preparer its block's plan changed: freeze the live speed
    /// as the new entry speed and force a profile recompute.
    fn freeze_executing_block(&self) {
        self.prep
            .lock()
            .expect("segment preparer poisoned")
            .update_exec_block_parameters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{segment_ring, StepControl};

    fn test_setup() -> (Planner, PlanConsumer) {
        let settings = Arc::new(Settings::default());
        let sys_position = Arc::new(SysPosition::new());
        let (queue, consumer) = planner_queue();
        let (seg_producer, _seg_consumer) = segment_ring();
        let control = Arc::new(StepControl::new());
        let prep_consumer = PlanConsumer {
            queue: queue.clone(),
        };
        let prep = Arc::new(Mutex::new(SegmentPrep::new(
            prep_consumer,
            seg_producer,
            control,
            settings.clone(),
        )));
        (
            Planner::new(queue, prep, settings, sys_position),
            consumer,
        )
    }

    fn feed(rate: f32) -> LineData {
        LineData {
            feed_rate: rate,
            ..LineData::default()
        }
    }

    #[test]
    fn step_counts_follow_target() {
        let (mut planner, consumer) = test_setup();
        assert!(planner.buffer_line(&[100.0, 0.0, 0.0], &feed(1000.0)));
        let block = consumer.tail_snapshot().unwrap();
        assert_eq!(block.steps, [10667, 0, 0]);
        assert_eq!(block.step_event_count, 10667);
        assert_eq!(block.direction_bits, 0);
        assert!((block.millimeters - 100.0).abs() < 1e-3);
    }

    #[test]
    fn zero_length_move_is_rejected() {
        let (mut planner, consumer) = test_setup();
        assert!(!planner.buffer_line(&[0.0, 0.0, 0.0], &feed(1000.0)));
        assert!(consumer.tail_snapshot().is_none());
    }

    #[test]
    fn negative_move_sets_direction_bits() {
        let (mut planner, consumer) = test_setup();
        assert!(planner.buffer_line(&[-10.0, -5.0, 0.0], &feed(600.0)));
        let block = consumer.tail_snapshot().unwrap();
        assert_eq!(
            block.direction_bits,
            Axis::X.dir_bit() | Axis::Y.dir_bit()
        );
    }

    #[test]
    fn signed_step_deltas_sum_to_target() {
        let (mut planner, _) = test_setup();
        let targets: [[f32; 3]; 4] = [
            [10.0, 0.0, 0.0],
            [10.0, 20.0, 0.0],
            [-5.0, 20.0, 1.0],
            [0.0, 0.0, 0.0],
        ];
        for t in &targets {
            planner.buffer_line(t, &feed(1200.0));
        }
        // The planner position must land exactly on the final target.
        let spm = Settings::default().steps_per_mm;
        for idx in 0..N_AXIS {
            let expect = (targets[3][idx] * spm[idx]).round() as i32;
            assert_eq!(planner.position[idx], expect);
        }
    }

    #[test]
    fn entry_speed_never_exceeds_junction_or_nominal() {
        let (mut planner, consumer) = test_setup();
        // A zig-zag path with sharp corners.
        let targets: [[f32; 3]; 5] = [
            [20.0, 0.0, 0.0],
            [20.0, 20.0, 0.0],
            [0.0, 20.0, 0.0],
            [0.0, 0.0, 0.0],
            [20.0, 0.0, 0.0],
        ];
        for t in &targets {
            planner.buffer_line(t, &feed(3000.0));
        }
        // Walk the ring and check the junction invariants.
        let mut entries = Vec::new();
        loop {
            let Some(block) = consumer.tail_snapshot() else { break };
            assert!(block.entry_speed_sqr <= block.max_junction_speed_sqr + 1.0);
            let nominal = profile_nominal_speed(&block);
            assert!(block.entry_speed_sqr <= nominal * nominal + 1.0);
            entries.push((block.entry_speed_sqr, block.acceleration, block.millimeters));
            consumer.discard_tail();
        }
        assert_eq!(entries.len(), 5);
        // Each entry is reachable from the previous block.
        for w in entries.windows(2) {
            let (prev_entry, prev_acc, prev_mm) = w[0];
            let (entry, _, _) = w[1];
            assert!(entry <= prev_entry + 2.0 * prev_acc * prev_mm + 1.0);
        }
    }

    #[test]
    fn straight_path_reaches_nominal_speed() {
        let (mut planner, consumer) = test_setup();
        // Many collinear short moves: the middle ones should plan entry at
        // full nominal speed.
        for i in 1..=20 {
            planner.buffer_line(&[i as f32 * 5.0, 0.0, 0.0], &feed(1500.0));
        }
        consumer.discard_tail();
        for _ in 0..10 {
            let block = consumer.tail_snapshot().unwrap();
            let nominal = profile_nominal_speed(&block);
            assert!(
                block.entry_speed_sqr > 0.9 * nominal * nominal,
                "entry {} nominal^2 {}",
                block.entry_speed_sqr,
                nominal * nominal
            );
            consumer.discard_tail();
        }
    }

    #[test]
    fn system_motion_bypasses_queue() {
        let (mut planner, consumer) = test_setup();
        let data = LineData {
            feed_rate: 500.0,
            condition: Condition::SYSTEM_MOTION,
            ..LineData::default()
        };
        assert!(planner.buffer_line(&[5.0, 0.0, 0.0], &data));
        assert!(consumer.is_empty());
        let block = consumer.system_snapshot();
        assert_eq!(block.step_event_count, 533);
        assert_eq!(block.entry_speed_sqr, 0.0);
    }

    #[test]
    fn inverse_time_scales_programmed_rate() {
        let (mut planner, consumer) = test_setup();
        let data = LineData {
            feed_rate: 2.0, // complete the move in 1/2 minute
            condition: Condition::INVERSE_TIME,
            ..LineData::default()
        };
        planner.buffer_line(&[30.0, 0.0, 0.0], &data);
        let block = consumer.tail_snapshot().unwrap();
        // 30 mm in half a minute is 60 mm/min.
        assert!((block.programmed_rate - 60.0).abs() < 0.1);
    }
}
