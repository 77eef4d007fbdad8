//! Step pulse generator.
//!
//! The highest-priority task in the system. Each tick either emits a step
//! byte (axis step bits OR direction bits) or a zero spacer byte, paced by
//! the current segment's `cycles_per_tick`. Axis selection is a Bresenham
//! line tracer over the stepper-block shadow; the machine position is
//! updated here and nowhere else.
//!
//! The fast path allocates nothing: segments and shadows are copied into
//! pre-allocated locals, and the pulse sink writes into a buffered device.
//! When the segment ring drains, the task requests the idle state and
//! parks until an explicit wake-up.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use cinder_common::axis::{Axis, N_AXIS};
use cinder_common::consts::STEP_FREQUENCY;
use cinder_common::fsm::{Fsm, StateMap, SubFsm, SystemState};
use cinder_common::position::SysPosition;

use crate::segment::{Segment, SegmentConsumer, SegmentPrep, StBlock};

/// Local states of the motion subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MotionState {
    Init = 0,
    Idle = 1,
    Run = 2,
    Hold = 3,
    Alarm = 4,
    Fault = 5,
}

/// Acceptance map tying motion states to system states.
pub fn motion_state_map() -> Vec<(SystemState, u8)> {
    vec![
        (SystemState::Init, MotionState::Init as u8),
        (SystemState::Sleep, MotionState::Idle as u8),
        (SystemState::Idle, MotionState::Idle as u8),
        (SystemState::Homing, MotionState::Run as u8),
        (SystemState::Run, MotionState::Run as u8),
        (SystemState::Hold, MotionState::Hold as u8),
        (SystemState::Alarm, MotionState::Alarm as u8),
        (SystemState::Fault, MotionState::Fault as u8),
    ]
}

/// Register the motion subsystem with an optional notification handler.
pub fn register_motion(fsm: &Fsm, handler: Option<Box<dyn cinder_common::fsm::StateHandler>>) {
    fsm.register(
        SubFsm::Motion,
        StateMap {
            maps: motion_state_map(),
            handler,
        },
    );
    let _ = fsm.update(SubFsm::Motion, MotionState::Idle as u8);
}

/// Destination for pulse bytes.
///
/// The hardware implementation streams into the control board's pulse
/// FIFO; tests collect bytes in memory.
pub trait PulseSink: Send {
    /// Open the device. Called on every wake-up.
    fn open(&mut self) -> io::Result<()>;
    /// Close the device. Called when the generator goes idle.
    fn close(&mut self);
    /// Append one pulse byte.
    fn write(&mut self, byte: u8) -> io::Result<()>;
    /// Push buffered bytes toward the device.
    fn flush(&mut self);
    /// Start the board's SDMA engine consuming the FIFO.
    fn start_stream(&mut self) -> io::Result<()>;
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct VecSink {
    pub bytes: Vec<u8>,
    pub stream_started: bool,
}

impl PulseSink for VecSink {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }
    fn close(&mut self) {}
    fn write(&mut self, byte: u8) -> io::Result<()> {
        self.bytes.push(byte);
        Ok(())
    }
    fn flush(&mut self) {}
    fn start_stream(&mut self) -> io::Result<()> {
        self.stream_started = true;
        Ok(())
    }
}

/// Outcome of one generator tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A step byte was emitted.
    Pulse(u8),
    /// A spacer byte was emitted.
    Spacer,
    /// The segment ring is empty; the task should park.
    Drained,
}

/// Step generator state. Owned by the step task; tests drive `tick`
/// directly.
pub struct StepGenerator {
    ring: SegmentConsumer,
    prep: Arc<Mutex<SegmentPrep>>,
    fsm: Arc<Fsm>,
    position: Arc<SysPosition>,

    counter: [u32; N_AXIS],
    exec_block: StBlock,
    exec_block_index: u8,
    exec_segment: Option<Segment>,
    step_count: u16,
    step_cycle_count: u32,
    cycle_count: u32,
    stream_started: bool,
}

impl StepGenerator {
    pub fn new(
        ring: SegmentConsumer,
        prep: Arc<Mutex<SegmentPrep>>,
        fsm: Arc<Fsm>,
        position: Arc<SysPosition>,
    ) -> Self {
        Self {
            ring,
            prep,
            fsm,
            position,
            counter: [0; N_AXIS],
            exec_block: StBlock::default(),
            exec_block_index: 0,
            exec_segment: None,
            step_count: 0,
            step_cycle_count: 0,
            cycle_count: 0,
            stream_started: false,
        }
    }

    /// Execute one tick against the sink.
    pub fn tick(&mut self, sink: &mut dyn PulseSink) -> Tick {
        self.cycle_count = self.cycle_count.wrapping_add(1);

        if self.exec_segment.is_none() {
            sink.flush();

            // A segment boundary is the only place the stream may stop:
            // an alarm or fault halts feeding here, leaving queued
            // segments in place.
            let state = self.fsm.state();
            if state == SystemState::Alarm || state == SystemState::Fault {
                debug!(state = state.label(), "pulse stream halted");
                self.cycle_count = 0;
                self.step_cycle_count = 0;
                self.stream_started = false;
                return Tick::Drained;
            }

            if !self.ring.has_ready() {
                return self.drained(sink);
            }

            // Keep the FIFO primed: the SDMA engine is only started once
            // at least a tick-second of data is buffered, unless the
            // system is already running.
            if state != SystemState::Run
                && state != SystemState::Homing
                && !self.stream_started
                && self.cycle_count > STEP_FREQUENCY
            {
                self.stream_started = true;
                debug!("starting pulse stream after prime window");
                if let Err(e) = sink.start_stream() {
                    error!(error = %e, "pulse stream start failed");
                }
            }

            let segment = self.ring.tail_segment();
            self.step_count = segment.n_step;
            if self.exec_block_index != segment.st_block_index {
                // New motion block: reload the shadow and reset the
                // Bresenham counters to half the event count.
                self.exec_block_index = segment.st_block_index;
                self.exec_block = self.ring.st_block(segment.st_block_index as usize);
                let half = self.exec_block.step_event_count >> 1;
                self.counter = [half; N_AXIS];
            }
            self.exec_segment = Some(segment);
            self.step_cycle_count = 0;

            if self.step_count == 0 {
                // Degenerate slow segment; retire it without a pulse.
                self.complete_segment();
                return Tick::Spacer;
            }
        }

        let segment = *self.exec_segment.as_ref().expect("segment loaded");

        self.step_cycle_count += 1;
        if self.step_cycle_count < segment.cycles_per_tick {
            let _ = sink.write(0x00);
            return Tick::Spacer;
        }
        self.step_cycle_count = 0;

        // Bresenham: each axis accumulates its step count and fires when
        // it crosses the block's event count.
        let mut step_outbits = 0u8;
        for idx in 0..N_AXIS {
            self.counter[idx] += self.exec_block.steps[idx];
            if self.counter[idx] > self.exec_block.step_event_count {
                let axis = Axis::ALL[idx];
                step_outbits |= axis.step_bit();
                self.counter[idx] -= self.exec_block.step_event_count;
                self.position
                    .step(idx, self.exec_block.direction_bits & axis.dir_bit() != 0);
            }
        }

        let byte = step_outbits | self.exec_block.direction_bits;
        let _ = sink.write(byte);

        self.step_count -= 1;
        if self.step_count == 0 {
            self.complete_segment();
        }
        Tick::Pulse(byte)
    }

    fn complete_segment(&mut self) {
        self.exec_segment = None;
        self.ring.advance_tail();
        // Kick the preparer to keep the ring topped up. Never block here:
        // if the preparer is busy, the next completion retries.
        if let Ok(mut prep) = self.prep.try_lock() {
            prep.prep_buffer();
        }
    }

    fn drained(&mut self, sink: &mut dyn PulseSink) -> Tick {
        debug!(cycles = self.cycle_count, "segment ring drained");
        self.cycle_count = 0;
        self.step_cycle_count = 0;
        if self.fsm.requested() == Some(SystemState::Run) && !self.stream_started {
            // Less than a tick-second of data was ever buffered; start the
            // stream now so the queued motion still plays out.
            if let Err(e) = sink.start_stream() {
                error!(error = %e, "pulse stream start failed");
            }
        } else {
            let _ = self.fsm.update(SubFsm::Motion, MotionState::Idle as u8);
            self.fsm.request(SystemState::Idle);
        }
        self.stream_started = false;
        Tick::Drained
    }

    /// Run loop for the real-time task. Parks until woken, then streams
    /// pulses until the ring drains or shutdown is flagged.
    pub fn run(mut self, mut sink: Box<dyn PulseSink>, shutdown: Arc<AtomicBool>) {
        info!("step generator task ready");
        loop {
            std::thread::park();
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = sink.open() {
                error!(error = %e, "pulse device open failed");
                let _ = self.fsm.update(SubFsm::Motion, MotionState::Fault as u8);
                continue;
            }
            loop {
                if shutdown.load(Ordering::Acquire) {
                    sink.close();
                    info!("step generator shut down");
                    return;
                }
                if self.tick(sink.as_mut()) == Tick::Drained {
                    break;
                }
            }
            sink.close();
        }
        info!("step generator shut down");
    }
}
