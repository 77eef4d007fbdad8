//! Control-board interface.
//!
//! The board exposes its controls as sysfs attribute files and a pulse
//! FIFO character device. Pulse bytes stream into the FIFO; the SDMA
//! engine drains it at the configured step frequency once `run` is
//! written. A `state` attribute reports `disabled|idle|running` and is
//! watched with POLLPRI so board-side state changes feed the system
//! state machine.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use cinder_common::consts::STEP_FREQUENCY;
use cinder_common::fsm::{Fsm, StateHandler, StateMap, SubFsm, SystemState};
use cinder_motion::stepgen::PulseSink;

use crate::HalError;

/// Local states of the control-board subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BoardState {
    Init = 0,
    Idle = 1,
    Run = 2,
    Disabled = 3,
    Fault = 4,
}

/// Button LED color, written as three PWM attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

pub const LED_RED: LedColor = LedColor {
    red: 100,
    green: 0,
    blue: 0,
};
pub const LED_GREEN: LedColor = LedColor {
    red: 0,
    green: 100,
    blue: 0,
};
pub const LED_WHITE: LedColor = LedColor {
    red: 60,
    green: 80,
    blue: 100,
};
pub const LED_OFF: LedColor = LedColor {
    red: 0,
    green: 0,
    blue: 0,
};

/// Paths into the board's attribute tree.
#[derive(Debug, Clone)]
pub struct Board {
    /// Attribute root, `/sys/cinder` on hardware.
    sys_root: PathBuf,
    /// Pulse FIFO device, `/dev/cinder` on hardware.
    pulse_path: PathBuf,
}

impl Board {
    pub fn new(sys_root: impl Into<PathBuf>, pulse_path: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
            pulse_path: pulse_path.into(),
        }
    }

    /// Paths used on the real hardware.
    pub fn system_default() -> Self {
        Self::new("/sys/cinder", "/dev/cinder")
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.sys_root.join(name)
    }

    /// Read a trimmed string from an attribute.
    pub fn read_attr_str(&self, name: &str) -> Result<String, HalError> {
        let path = self.attr(name);
        let mut text = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut text))
            .map_err(|source| HalError::Attr {
                path: path.display().to_string(),
                source,
            })?;
        Ok(text.trim_end().to_string())
    }

    /// Read an attribute as an unsigned integer (decimal or 0x-hex).
    pub fn read_attr_u32(&self, name: &str) -> Result<u32, HalError> {
        let text = self.read_attr_str(name)?;
        let parsed = if let Some(hex) = text.strip_prefix("0x") {
            u32::from_str_radix(hex, 16)
        } else {
            text.parse()
        };
        parsed.map_err(|_| HalError::Attr {
            path: self.attr(name).display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, text),
        })
    }

    /// Write a string to an attribute.
    pub fn write_attr_str(&self, name: &str, value: &str) -> Result<(), HalError> {
        let path = self.attr(name);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .and_then(|mut f| f.write_all(value.as_bytes()))
            .map_err(|source| HalError::Attr {
                path: path.display().to_string(),
                source,
            })
    }

    /// Write a register word as a hex string.
    pub fn write_attr_u64(&self, name: &str, value: u64) -> Result<(), HalError> {
        self.write_attr_str(name, &format!("{:#x}", value as u32))
    }

    /// Enable the board and program the step frequency.
    pub fn bring_up(&self) -> Result<(), HalError> {
        self.write_attr_str("cnc/enable", "1")?;
        self.write_attr_str("cnc/step_freq", &STEP_FREQUENCY.to_string())?;
        info!(step_frequency = STEP_FREQUENCY, "control board enabled");
        Ok(())
    }

    /// Disable the board outputs.
    pub fn shut_down(&self) {
        if let Err(e) = self.write_attr_str("cnc/disable", "1") {
            warn!(error = %e, "board disable failed");
        }
        self.button_led(LED_OFF);
    }

    /// Halt the SDMA engine at its current position.
    pub fn stop(&self) -> Result<(), HalError> {
        self.write_attr_str("cnc/stop", "1\n")
    }

    /// Set the button LED color.
    pub fn button_led(&self, color: LedColor) {
        for (attr, value) in [
            ("leds/btn_red_led_pwm", color.red),
            ("leds/btn_green_led_pwm", color.green),
            ("leds/btn_blue_led_pwm", color.blue),
        ] {
            if let Err(e) = self.write_attr_str(attr, &format!("{value}\n")) {
                warn!(attr, error = %e, "led write failed");
            }
        }
    }

    /// Set the lid LED brightness in percent.
    pub fn lid_led(&self, brightness: u8) {
        if let Err(e) = self.write_attr_str("leds/lid_led_pwm", &format!("{brightness}\n")) {
            warn!(error = %e, "lid led write failed");
        }
    }

    /// Open a pulse sink streaming into this board's FIFO.
    pub fn pulse_sink(&self) -> BoardPulseSink {
        BoardPulseSink {
            board: self.clone(),
            writer: None,
        }
    }
}

/// Map a `state` attribute reading to a board state.
///
/// A disabled board is only legitimate when sleep was requested;
/// anything else means the hardware dropped out underneath us.
pub fn parse_board_state(text: &str, sleep_requested: bool) -> BoardState {
    match text {
        "disabled" => {
            if sleep_requested {
                BoardState::Disabled
            } else {
                error!("unexpected disabled board state");
                BoardState::Fault
            }
        }
        "idle" => BoardState::Idle,
        "running" => BoardState::Run,
        _ => BoardState::Fault,
    }
}

/// Acceptance map for the board subsystem.
fn board_state_map() -> Vec<(SystemState, u8)> {
    vec![
        (SystemState::Init, BoardState::Init as u8),
        (SystemState::Sleep, BoardState::Disabled as u8),
        (SystemState::Idle, BoardState::Idle as u8),
        (SystemState::Homing, BoardState::Run as u8),
        (SystemState::Homing, BoardState::Idle as u8),
        (SystemState::Run, BoardState::Run as u8),
        (SystemState::Hold, BoardState::Idle as u8),
        (SystemState::Fault, BoardState::Fault as u8),
    ]
}

/// Lights the button green whenever a run is requested.
struct RunLedHandler {
    board: Board,
}

impl StateHandler for RunLedHandler {
    fn on_state_change(&self, fsm: &Fsm) {
        if fsm.requested() == Some(SystemState::Run) && fsm.state() != SystemState::Run {
            self.board.button_led(LED_GREEN);
        }
    }
}

/// Register the board subsystem and report its initial state.
pub fn register_board(fsm: &Fsm, board: &Board) {
    fsm.register(
        SubFsm::Board,
        StateMap {
            maps: board_state_map(),
            handler: Some(Box::new(RunLedHandler {
                board: board.clone(),
            })),
        },
    );
}

/// Poll the board `state` attribute and feed changes into the system
/// state machine. Runs until shutdown or a read error, which is fatal
/// for the subsystem.
pub fn state_poll_loop(board: Board, fsm: Arc<Fsm>, shutdown: Arc<AtomicBool>) {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::AsFd;

    let path = board.attr("cnc/state");
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "state attribute open failed");
            let _ = fsm.update(SubFsm::Board, BoardState::Fault as u8);
            return;
        }
    };

    let mut current = BoardState::Init;
    let _ = fsm.update(SubFsm::Board, current as u8);

    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLPRI)];
        match poll(&mut fds, PollTimeout::from(500u16)) {
            Ok(0) => continue, // timeout, re-check shutdown
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "state poll failed");
                let _ = fsm.update(SubFsm::Board, BoardState::Fault as u8);
                return;
            }
        }

        let mut text = String::new();
        if file.seek(SeekFrom::Start(0)).is_err() || file.read_to_string(&mut text).is_err() {
            let _ = fsm.update(SubFsm::Board, BoardState::Fault as u8);
            return;
        }
        let sleep_requested = fsm.requested() == Some(SystemState::Sleep);
        let read_state = parse_board_state(text.trim_end(), sleep_requested);

        if read_state != current {
            debug!(?read_state, "board state changed");
            if current == BoardState::Run && read_state == BoardState::Idle {
                // The SDMA engine finished its buffer; the cycle is over.
                fsm.request(SystemState::Idle);
            }
            current = read_state;
            let _ = fsm.update(SubFsm::Board, current as u8);
            board.button_led(if current == BoardState::Run {
                LED_WHITE
            } else {
                LED_OFF
            });
        }
    }
}

// ─── Pulse sink ─────────────────────────────────────────────────────

/// Streams pulse bytes into the board FIFO.
pub struct BoardPulseSink {
    board: Board,
    writer: Option<BufWriter<File>>,
}

impl PulseSink for BoardPulseSink {
    fn open(&mut self) -> std::io::Result<()> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&self.board.pulse_path)?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.writer = None;
    }

    fn write(&mut self, byte: u8) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.write_all(&[byte]),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "pulse device not open",
            )),
        }
    }

    fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }

    fn start_stream(&mut self) -> std::io::Result<()> {
        self.flush();
        self.board
            .write_attr_str("cnc/run", "1\n")
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

/// Test whether the pulse path exists; used to pick simulation mode.
pub fn pulse_device_present(board: &Board) -> bool {
    Path::new(&board.pulse_path).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_board() -> (tempfile::TempDir, Board) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sys/cnc")).unwrap();
        std::fs::create_dir_all(dir.path().join("sys/leds")).unwrap();
        let board = Board::new(dir.path().join("sys"), dir.path().join("pulse"));
        (dir, board)
    }

    #[test]
    fn attr_roundtrip() {
        let (_dir, board) = temp_board();
        board.write_attr_str("cnc/enable", "1").unwrap();
        assert_eq!(board.read_attr_str("cnc/enable").unwrap(), "1");

        board.write_attr_u64("cnc/chopconf", 0x100C5).unwrap();
        assert_eq!(board.read_attr_u32("cnc/chopconf").unwrap(), 0x100C5);
    }

    #[test]
    fn bring_up_writes_enable_and_frequency() {
        let (_dir, board) = temp_board();
        board.bring_up().unwrap();
        assert_eq!(board.read_attr_str("cnc/enable").unwrap(), "1");
        assert_eq!(
            board.read_attr_u32("cnc/step_freq").unwrap(),
            STEP_FREQUENCY
        );
    }

    #[test]
    fn state_parse_table() {
        assert_eq!(parse_board_state("idle", false), BoardState::Idle);
        assert_eq!(parse_board_state("running", false), BoardState::Run);
        assert_eq!(parse_board_state("disabled", true), BoardState::Disabled);
        // Disabled without a sleep request is a hardware dropout.
        assert_eq!(parse_board_state("disabled", false), BoardState::Fault);
        assert_eq!(parse_board_state("garbage", false), BoardState::Fault);
    }

    #[test]
    fn pulse_sink_streams_and_starts() {
        let (dir, board) = temp_board();
        let mut sink = board.pulse_sink();
        sink.open().unwrap();
        sink.write(0x05).unwrap();
        sink.write(0x00).unwrap();
        sink.start_stream().unwrap();
        sink.close();

        let bytes = std::fs::read(dir.path().join("pulse")).unwrap();
        assert_eq!(bytes, vec![0x05, 0x00]);
        assert_eq!(board.read_attr_str("cnc/run").unwrap(), "1");
    }
}
