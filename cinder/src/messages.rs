//! User-facing message formatting.
//!
//! Every response the machine sends travels through here so the wire
//! format lives in exactly one place: `ok`, `error:<n>`, `ALARM:<n>`,
//! bracketed feedback and help, the welcome banner, and the status
//! report.

use std::sync::Arc;

use cinder_common::axis::N_AXIS;
use cinder_common::consts::{INCH_PER_MM, VERSION};
use cinder_common::fsm::SystemState;
use cinder_common::status::Status;

/// Outbound half of a CLI transport.
pub trait LineWriter: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Help text listing every accepted command.
const HELP_TEXT: &str = "[HLP:$$ $# $G $I $N $SLP $C $X $H ~ ! ? X]";

/// Message formatter bound to a transport.
pub struct Messages {
    writer: Arc<dyn LineWriter>,
    report_inches: bool,
    steps_per_mm: [f32; N_AXIS],
}

impl Messages {
    pub fn new(
        writer: Arc<dyn LineWriter>,
        report_inches: bool,
        steps_per_mm: [f32; N_AXIS],
    ) -> Arc<Self> {
        Arc::new(Self {
            writer,
            report_inches,
            steps_per_mm,
        })
    }

    /// `ok`, or `error:<n>` for a diagnostic.
    pub fn status(&self, result: Result<(), Status>) {
        match result {
            Ok(()) => self.writer.write_line("ok"),
            Err(status) => self.writer.write_line(&format!("error:{}", status.code())),
        }
    }

    pub fn ok(&self) {
        self.status(Ok(()));
    }

    pub fn error(&self, status: Status) {
        self.status(Err(status));
    }

    pub fn alarm(&self, code: u8) {
        self.writer.write_line(&format!("ALARM:{code}"));
    }

    /// `[MSG:…]` feedback line.
    pub fn feedback(&self, text: &str) {
        self.writer.write_line(&format!("[MSG:{text}]"));
    }

    /// Help listing, acknowledged.
    pub fn help(&self) {
        self.writer.write_line(HELP_TEXT);
        self.ok();
    }

    /// Plain text passthrough.
    pub fn plain(&self, text: &str) {
        self.writer.write_line(text);
    }

    /// Welcome banner printed once at startup.
    pub fn banner(&self) {
        self.writer
            .write_line(&format!("Cinder CNC v{VERSION} ['$' for help]"));
    }

    /// `<State,MPos:x,y,z>` status report, acknowledged. Coordinates are
    /// absolute machine position in the configured report units.
    pub fn status_report(&self, state: SystemState, position_steps: &[i32; N_AXIS]) {
        let mut mpos = [0f32; N_AXIS];
        for idx in 0..N_AXIS {
            mpos[idx] = position_steps[idx] as f32 / self.steps_per_mm[idx];
            if self.report_inches {
                mpos[idx] *= INCH_PER_MM;
            }
        }
        self.writer.write_line(&format!(
            "<{},MPos:{:.3},{:.3},{:.3}>",
            state.label(),
            mpos[0],
            mpos[1],
            mpos[2]
        ));
        self.ok();
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::CaptureWriter;
    use super::*;

    fn capture() -> (Arc<CaptureWriter>, Arc<Messages>) {
        let writer = Arc::new(CaptureWriter::default());
        let spm = [106.666_67, 106.666_67, 22.660_172];
        let messages = Messages::new(writer.clone(), false, spm);
        (writer, messages)
    }

    #[test]
    fn ok_and_error_lines() {
        let (writer, messages) = capture();
        messages.ok();
        messages.error(Status::UnsupportedCommand);
        messages.alarm(1);
        let lines = writer.lines.lock().unwrap();
        assert_eq!(*lines, vec!["ok", "error:20", "ALARM:1"]);
    }

    #[test]
    fn status_report_format() {
        let (writer, messages) = capture();
        messages.status_report(SystemState::Idle, &[10667, 0, 0]);
        let lines = writer.lines.lock().unwrap();
        assert_eq!(lines[0], "<Idle,MPos:100.003,0.000,0.000>");
        assert_eq!(lines[1], "ok");
    }

    #[test]
    fn alarm_state_reports_its_own_label() {
        let (writer, messages) = capture();
        messages.status_report(SystemState::Alarm, &[0, 0, 0]);
        let lines = writer.lines.lock().unwrap();
        assert!(lines[0].starts_with("<Alarm,"));
    }

    #[test]
    fn inch_reports_scale_position() {
        let writer = Arc::new(CaptureWriter::default());
        let messages = Messages::new(writer.clone(), true, [106.666_67, 106.666_67, 22.66]);
        messages.status_report(SystemState::Idle, &[10667, 0, 0]);
        let lines = writer.lines.lock().unwrap();
        assert_eq!(lines[0], "<Idle,MPos:3.937,0.000,0.000>");
    }

    #[test]
    fn feedback_and_banner() {
        let (writer, messages) = capture();
        messages.feedback("Pgm End");
        messages.banner();
        let lines = writer.lines.lock().unwrap();
        assert_eq!(lines[0], "[MSG:Pgm End]");
        assert!(lines[1].starts_with("Cinder CNC v"));
    }
}
