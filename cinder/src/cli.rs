//! Command line interface.
//!
//! One entry point, [`CliContext::process_line`], fed by whichever
//! transport is active. A line is either one of the user commands below
//! or g-code headed for the parser queue. Commands are whole lines with
//! a trailing newline; they are not picked out of the stream.

use std::sync::Arc;

use tracing::{info, warn};

use cinder_common::fsm::{Fsm, StateMap, SubFsm, SystemState};
use cinder_common::status::Status;
use cinder_motion::gcode::groom_line;
use cinder_motion::pipeline::MotionPipeline;

use crate::messages::Messages;

/// Local states of the CLI subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CliState {
    Init = 0,
    Operational = 1,
}

fn cli_state_map() -> Vec<(SystemState, u8)> {
    vec![
        (SystemState::Init, CliState::Init as u8),
        (SystemState::Sleep, CliState::Operational as u8),
        (SystemState::Idle, CliState::Operational as u8),
        (SystemState::Homing, CliState::Operational as u8),
        (SystemState::Run, CliState::Operational as u8),
        (SystemState::Hold, CliState::Operational as u8),
    ]
}

/// Register the CLI subsystem as operational.
pub fn register_cli(fsm: &Fsm) {
    fsm.register(
        SubFsm::Cli,
        StateMap {
            maps: cli_state_map(),
            handler: None,
        },
    );
    let _ = fsm.update(SubFsm::Cli, CliState::Operational as u8);
}

/// The test cycle: trace the bed perimeter, then cut a full circle.
const TEST_PROGRAM: &[&str] = &[
    "G0 X495.300 Y000.000",
    "G0 X495.300 Y279.400",
    "G0 X000.000 Y279.400",
    "G0 X200.000 Y135.000",
    "G2 X200.000 Y135.000 I050.000 J000.000 F3000",
    "G0 X000.000 Y279.400",
    "G0 X495.300 Y279.400",
    "G0 X000.000 Y000.000",
];

/// Everything line processing needs.
pub struct CliContext {
    pub fsm: Arc<Fsm>,
    pub pipeline: Arc<MotionPipeline>,
    pub messages: Arc<Messages>,
}

impl CliContext {
    /// Handle one raw input line from the transport.
    pub fn process_line(&self, raw: &str) {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            self.messages.ok();
            return;
        }

        match line {
            "~" => self.cycle_start(),
            "?" => self.status_report(),
            "$" => self.messages.help(),
            "$T" => self.test_cycle(),
            // Accepted by the protocol, not yet wired to the state
            // machine they would drive.
            "$C" | "!" | "X" | "$H" | "$SLP" => {
                self.messages.error(Status::UnsupportedCommand);
            }
            _ => self.gcode(line),
        }
    }

    /// `~`: start or resume the cycle. Anything but idle or hold has no
    /// cycle to start.
    fn cycle_start(&self) {
        match self.fsm.state() {
            SystemState::Idle | SystemState::Hold => {
                info!("cycle start");
                self.pipeline.cycle_start();
            }
            _ => self.messages.error(Status::UnsupportedCommand),
        }
    }

    /// `?`: one-line machine position report.
    fn status_report(&self) {
        self.messages
            .status_report(self.fsm.state(), &self.pipeline.position().snapshot());
    }

    /// `$T`: queue the built-in test program.
    fn test_cycle(&self) {
        if self.fsm.state() != SystemState::Idle || self.fsm.requested().is_some() {
            self.messages.error(Status::IdleError);
            return;
        }
        self.messages.feedback("Queuing Test Code");
        for &line in TEST_PROGRAM {
            self.messages.plain(line);
            match groom_line(line) {
                Ok(groomed) => {
                    if let Err(status) = self.pipeline.queue_line(groomed) {
                        warn!(line, "test line not queued");
                        self.messages.error(status);
                        return;
                    }
                }
                Err(status) => {
                    self.messages.error(status);
                    return;
                }
            }
        }
        self.messages.feedback("Test Queued. '~' to cycle.");
    }

    /// Anything else is g-code: groom it and hand it to the parser
    /// worker, which reports the per-line status asynchronously.
    fn gcode(&self, line: &str) {
        match groom_line(line) {
            Ok(groomed) => {
                if let Err(status) = self.pipeline.queue_line(groomed) {
                    self.messages.error(status);
                }
            }
            Err(status) => self.messages.error(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::test_support::CaptureWriter;
    use cinder_common::sched::TestScheduler;
    use cinder_common::settings::Settings;
    use cinder_motion::stepgen::VecSink;

    struct Fixture {
        ctx: CliContext,
        writer: Arc<CaptureWriter>,
        _sched: TestScheduler,
    }

    fn fixture() -> Fixture {
        let mut settings = Settings::default();
        settings.cli.mdi_mode = false;
        settings.cli.auto_cycle = false;
        let settings = Arc::new(settings);

        let (fsm, _task) = Fsm::start();
        let sched = TestScheduler::new();
        let writer = Arc::new(CaptureWriter::default());
        let messages = Messages::new(writer.clone(), false, settings.steps_per_mm);

        let report_messages = messages.clone();
        let feedback_messages = messages.clone();
        let pipeline = MotionPipeline::start(
            settings,
            fsm.clone(),
            &sched,
            Box::new(VecSink::default()),
            Box::new(move |result| report_messages.status(result)),
            Box::new(move |text| feedback_messages.feedback(text)),
        )
        .unwrap();

        Fixture {
            ctx: CliContext {
                fsm,
                pipeline,
                messages,
            },
            writer,
            _sched: sched,
        }
    }

    impl Fixture {
        fn lines(&self) -> Vec<String> {
            self.writer.lines.lock().unwrap().clone()
        }
    }

    #[test]
    fn empty_line_acknowledges() {
        let f = fixture();
        f.ctx.process_line("\r\n");
        assert_eq!(f.lines(), vec!["ok"]);
    }

    #[test]
    fn help_lists_commands() {
        let f = fixture();
        f.ctx.process_line("$\n");
        let lines = f.lines();
        assert!(lines[0].starts_with("[HLP:"));
        assert_eq!(lines[1], "ok");
    }

    #[test]
    fn stubbed_commands_answer_unsupported() {
        let f = fixture();
        for cmd in ["!", "X", "$H", "$SLP", "$C"] {
            f.ctx.process_line(cmd);
        }
        assert_eq!(f.lines(), vec!["error:20"; 5]);
    }

    #[test]
    fn cycle_start_outside_idle_or_hold_is_unsupported() {
        let f = fixture();
        // The aggregator is still in Init: nothing to start.
        f.ctx.process_line("~\n");
        assert_eq!(f.lines(), vec!["error:20"]);
    }

    #[test]
    fn status_report_reflects_state_label() {
        let f = fixture();
        f.ctx.process_line("?\n");
        let lines = f.lines();
        assert!(lines[0].starts_with("<Init,MPos:0.000,0.000,0.000>"), "{}", lines[0]);
        assert_eq!(lines[1], "ok");
    }

    #[test]
    fn test_cycle_requires_idle() {
        let f = fixture();
        f.ctx.process_line("$T\n");
        assert_eq!(f.lines(), vec!["error:8"]);
    }

    #[test]
    fn gcode_lines_are_queued_for_the_parser() {
        let f = fixture();
        f.ctx.process_line("G0 X10\n");
        // No synchronous output: the parser worker reports when it runs.
        assert!(f.lines().is_empty());
    }
}
