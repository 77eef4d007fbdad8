//! Startup wiring for the motion subsystem.
//!
//! Builds the rings, preparer, planner, parser and step generator as
//! explicitly-owned objects, registers the motion state machine, and
//! spawns the two long-lived tasks: the soft parser worker and the
//! real-time step generator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

use cinder_common::consts::{
    GCODE_QUEUE_SIZE, STEP_GEN_CPU_AFFINITY, STEP_GEN_PRIORITY,
};
use cinder_common::fsm::{Fsm, StateHandler, SubFsm, SystemState};
use cinder_common::position::SysPosition;
use cinder_common::sched::{SchedError, Scheduler, TaskHandle, TaskSpec};
use cinder_common::settings::Settings;
use cinder_common::status::Status;

use crate::control::MotionControl;
use crate::gcode::{parser_worker, GcodeParser};
use crate::planner::{planner_queue, Planner};
use crate::segment::{segment_ring, SegmentPrep, StepControl};
use crate::stepgen::{register_motion, MotionState, PulseSink, StepGenerator};

/// Handle to the running motion subsystem.
pub struct MotionPipeline {
    fsm: Arc<Fsm>,
    position: Arc<SysPosition>,
    prep: Arc<Mutex<SegmentPrep>>,
    control: Arc<StepControl>,
    line_tx: SyncSender<String>,
    stepgen_task: TaskHandle,
    _parser_task: TaskHandle,
    shutdown: Arc<AtomicBool>,
}

/// Wakes the step generator when a run is requested. Registered as the
/// motion subsystem's notification handler.
struct RunRequestWaker {
    pipeline: Mutex<Weak<MotionPipeline>>,
}

impl StateHandler for RunRequestWaker {
    fn on_state_change(&self, fsm: &Fsm) {
        if fsm.requested() == Some(SystemState::Run) {
            if let Some(pipeline) = self.pipeline.lock().expect("waker poisoned").upgrade() {
                pipeline.wake_stepgen();
            }
        }
    }
}

impl MotionPipeline {
    /// Build and start the motion subsystem.
    pub fn start(
        settings: Arc<Settings>,
        fsm: Arc<Fsm>,
        scheduler: &dyn Scheduler,
        sink: Box<dyn PulseSink>,
        report: Box<dyn Fn(Result<(), Status>) + Send>,
        feedback: Box<dyn Fn(&str) + Send>,
    ) -> Result<Arc<Self>, SchedError> {
        let position = Arc::new(SysPosition::new());
        let control = Arc::new(StepControl::new());

        let (queue, plan_consumer) = planner_queue();
        let (seg_producer, seg_consumer) = segment_ring();

        let prep = Arc::new(Mutex::new(SegmentPrep::new(
            plan_consumer,
            seg_producer,
            control.clone(),
            settings.clone(),
        )));

        let mut planner = Planner::new(
            queue,
            prep.clone(),
            settings.clone(),
            position.clone(),
        );
        planner.sync_position();

        let motion = MotionControl::new(planner, prep.clone(), fsm.clone(), settings.clone());
        let mut parser = GcodeParser::new(motion, position.clone(), feedback);
        parser.sync_position();

        let shutdown = Arc::new(AtomicBool::new(false));

        // Step generator: highest user priority, pinned to the reserved
        // CPU, parked until the first wake-up.
        let stepgen = StepGenerator::new(
            seg_consumer,
            prep.clone(),
            fsm.clone(),
            position.clone(),
        );
        let stepgen_shutdown = shutdown.clone();
        let stepgen_task = scheduler.spawn(
            TaskSpec::rt("stepgen", STEP_GEN_PRIORITY).pinned(STEP_GEN_CPU_AFFINITY),
            Box::new(move || stepgen.run(sink, stepgen_shutdown)),
        )?;

        // Parser worker: ordinary priority, fed from the line queue.
        let (line_tx, line_rx) = mpsc::sync_channel(GCODE_QUEUE_SIZE);
        let parser_task = scheduler.spawn(
            TaskSpec::soft("gcode"),
            Box::new(move || parser_worker(line_rx, parser, report)),
        )?;

        let pipeline = Arc::new(Self {
            fsm: fsm.clone(),
            position,
            prep,
            control,
            line_tx,
            stepgen_task,
            _parser_task: parser_task,
            shutdown,
        });

        // Motion subsystem state machine, with a handler that wakes the
        // step generator whenever a run is requested.
        let waker = RunRequestWaker {
            pipeline: Mutex::new(Arc::downgrade(&pipeline)),
        };
        register_motion(&fsm, Some(Box::new(waker)));

        info!("motion pipeline started");
        Ok(pipeline)
    }

    /// Queue one groomed line for the parser worker.
    pub fn queue_line(&self, line: String) -> Result<(), Status> {
        match self.line_tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("g-code queue full, line dropped");
                Err(Status::Overflow)
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("parser worker gone");
                Err(Status::Overflow)
            }
        }
    }

    /// Begin executing queued motion, or resume from a feed hold.
    pub fn cycle_start(&self) {
        if self.fsm.state() == SystemState::Hold {
            let mut prep = self.prep.lock().expect("segment preparer poisoned");
            prep.release_feed_hold();
        }
        let _ = self.fsm.update(SubFsm::Motion, MotionState::Run as u8);
        self.fsm.request(SystemState::Run);
        self.wake_stepgen();
    }

    /// Decelerate to a stop at the next segment boundary, resumable.
    pub fn feed_hold(&self) {
        let mut prep = self.prep.lock().expect("segment preparer poisoned");
        prep.begin_feed_hold();
        drop(prep);
        let _ = self.fsm.update(SubFsm::Motion, MotionState::Hold as u8);
        self.fsm.request(SystemState::Hold);
    }

    /// Charge the segment ring and resume the step generator.
    pub fn wake_stepgen(&self) {
        {
            let mut prep = self.prep.lock().expect("segment preparer poisoned");
            prep.prep_buffer();
        }
        let _ = self.fsm.update(SubFsm::Motion, MotionState::Run as u8);
        self.stepgen_task.unpark();
    }

    /// Machine position in steps.
    pub fn position(&self) -> &Arc<SysPosition> {
        &self.position
    }

    /// Step-control flag access for supervisory paths.
    pub fn step_control(&self) -> &Arc<StepControl> {
        &self.control
    }

    /// Flag both tasks down. The step generator exits at its next wake;
    /// the parser worker exits when the last line sender drops.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.stepgen_task.unpark();
    }
}
