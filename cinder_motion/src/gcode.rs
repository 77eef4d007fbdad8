//! G-code parser and modal-state interpreter.
//!
//! One groomed line in, one validated action out. A line is tokenized
//! into (letter, value) words, checked against the modal-group rules,
//! converted to millimeters, and dispatched to motion control. The
//! persistent modal state is only updated after the whole line has been
//! accepted; any diagnostic leaves it untouched.
//!
//! The ordering of the semantic pass follows the conventional
//! order-of-execution for RS274-style interpreters: feed-rate mode, feed
//! rate, spindle, dwell, plane, units, distance mode, motion, program
//! flow.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, info};

use cinder_common::axis::N_AXIS;
use cinder_common::consts::{CLI_LINE_LENGTH, MAX_LINE_NUMBER, MM_PER_INCH};
use cinder_common::fsm::SystemState;
use cinder_common::position::{steps_to_mpos, SysPosition};
use cinder_common::settings::Settings;
use cinder_common::status::Status;

use crate::control::MotionControl;
use crate::planner::{Condition, LineData};

/// Digits of precision recovered by the fast float reader.
const MAX_INT_DIGITS: u8 = 8;

// ─── Modal state ────────────────────────────────────────────────────

/// Motion modal group (G1 group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MotionMode {
    /// G0 rapid positioning.
    #[default]
    Seek = 0,
    /// G1 linear feed.
    Linear = 1,
    /// G2 clockwise arc.
    CwArc = 2,
    /// G3 counter-clockwise arc.
    CcwArc = 3,
    /// G80 motion canceled.
    None = 80,
    /// G38.2 through G38.5 probe cycles. Accepted, not yet acted on.
    ProbeToward = 140,
    ProbeTowardNoError = 141,
    ProbeAway = 142,
    ProbeAwayNoError = 143,
}

impl MotionMode {
    fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Seek),
            1 => Some(Self::Linear),
            2 => Some(Self::CwArc),
            3 => Some(Self::CcwArc),
            80 => Some(Self::None),
            140 => Some(Self::ProbeToward),
            141 => Some(Self::ProbeTowardNoError),
            142 => Some(Self::ProbeAway),
            143 => Some(Self::ProbeAwayNoError),
            _ => None,
        }
    }

    #[inline]
    fn is_arc(self) -> bool {
        matches!(self, Self::CwArc | Self::CcwArc)
    }

    #[inline]
    fn is_laser_motion(self) -> bool {
        matches!(self, Self::Linear | Self::CwArc | Self::CcwArc)
    }
}

/// Feed-rate modal group (G5 group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FeedRateMode {
    /// G94 units per minute.
    #[default]
    UnitsPerMin = 0,
    /// G93 inverse time.
    InverseTime = 1,
}

/// Units modal group (G6 group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UnitsMode {
    #[default]
    Mm = 0,
    Inches = 1,
}

/// Distance modal group (G3 group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DistanceMode {
    #[default]
    Absolute = 0,
    Incremental = 1,
}

/// Plane select modal group (G2 group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PlaneSelect {
    #[default]
    Xy = 0,
    Zx = 1,
    Yz = 2,
}

impl PlaneSelect {
    /// Plane axes as (axis_0, axis_1, linear axis) indices.
    fn axes(self) -> (usize, usize, usize) {
        match self {
            Self::Xy => (0, 1, 2),
            Self::Zx => (2, 0, 1),
            Self::Yz => (1, 2, 0),
        }
    }
}

/// Program-flow modal group (M4 group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ProgramFlow {
    #[default]
    Running = 0,
    /// M2 program end.
    Completed = 2,
    /// M0 program pause.
    Paused = 3,
    /// M30 program end and reset.
    CompletedReset = 30,
}

/// Non-modal commands (G0 group). Stored raw because the decimal variants
/// are folded in arithmetically.
pub mod non_modal {
    pub const NONE: u8 = 0;
    pub const DWELL: u8 = 4;
    pub const SET_COORDINATE_DATA: u8 = 10;
    pub const GO_HOME_0: u8 = 28;
    pub const SET_HOME_0: u8 = 38;
    pub const GO_HOME_1: u8 = 30;
    pub const SET_HOME_1: u8 = 40;
    pub const ABSOLUTE_OVERRIDE: u8 = 53;
    pub const SET_COORDINATE_OFFSET: u8 = 92;
    pub const RESET_COORDINATE_OFFSET: u8 = 102;
}

/// Modal settings that persist between lines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Modal {
    pub motion: MotionMode,
    pub feed_rate: FeedRateMode,
    pub units: UnitsMode,
    pub distance: DistanceMode,
    pub plane: PlaneSelect,
    pub coord_select: u8,
    pub program_flow: ProgramFlow,
    /// Laser sense as planner condition bits (M4 sets the CCW bit).
    pub spindle: Condition,
    /// Coolant sense as planner condition bits.
    pub coolant: Condition,
}

/// Persistent interpreter state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParserState {
    pub modal: Modal,
    /// Current spindle speed [RPM].
    pub spindle_speed: f32,
    /// Current feed rate [mm/min].
    pub feed_rate: f32,
    /// Last line number seen.
    pub line_number: i32,
    /// Where the interpreter believes the tool is [mm].
    pub position: [f32; N_AXIS],
}

/// Values collected from one line.
#[derive(Debug, Clone, Copy, Default)]
struct BlockValues {
    f: f32,
    ijk: [f32; N_AXIS],
    l: u8,
    n: i32,
    p: f32,
    r: f32,
    s: f32,
    xyz: [f32; N_AXIS],
}

/// Scratch block populated per line and discarded on accept or reject.
#[derive(Debug, Clone, Copy, Default)]
struct ParserBlock {
    non_modal: u8,
    modal: Modal,
    values: BlockValues,
}

bitflags! {
    /// Modal groups seen on the current line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct CommandWords: u16 {
        const G0  = 1 << 0;
        const G1  = 1 << 1;
        const G2  = 1 << 2;
        const G3  = 1 << 3;
        const G4  = 1 << 4;
        const G5  = 1 << 5;
        const G6  = 1 << 6;
        const G7  = 1 << 7;
        const G12 = 1 << 8;
        const G13 = 1 << 9;
        const M4  = 1 << 10;
        const M7  = 1 << 11;
        const M8  = 1 << 12;
    }
}

bitflags! {
    /// Value words seen on the current line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct ValueWords: u16 {
        const F = 1 << 0;
        const I = 1 << 1;
        const J = 1 << 2;
        const K = 1 << 3;
        const L = 1 << 4;
        const N = 1 << 5;
        const P = 1 << 6;
        const R = 1 << 7;
        const S = 1 << 8;
        const T = 1 << 9;
        const X = 1 << 10;
        const Y = 1 << 11;
        const Z = 1 << 12;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct GcFlags: u8 {
        const ARC_IS_CLOCKWISE = 1 << 2;
        const LASER_FORCE_SYNC = 1 << 5;
        const LASER_DISABLE    = 1 << 6;
        const LASER_ISMOTION   = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisCommand {
    None,
    NonModal,
    Motion,
}

// ─── Grooming ───────────────────────────────────────────────────────

/// Pre-process a raw input line: strip whitespace and control bytes,
/// remove `( … )` and `;` comments, silently drop block-delete slashes,
/// upper-case everything.
pub fn groom_line(line: &str) -> Result<String, Status> {
    let mut out = String::with_capacity(line.len().min(CLI_LINE_LENGTH));
    let mut in_paren = false;
    let mut in_semicolon = false;
    for ch in line.chars() {
        if in_paren {
            if ch == ')' {
                in_paren = false;
            }
            continue;
        }
        if in_semicolon {
            continue;
        }
        if ch as u32 <= 0x20 {
            continue;
        }
        match ch {
            '/' => {} // block delete: ignored
            '(' => in_paren = true,
            ';' => in_semicolon = true,
            'a'..='z' => out.push(ch.to_ascii_uppercase()),
            _ => out.push(ch),
        }
        if out.len() >= CLI_LINE_LENGTH {
            return Err(Status::LineLengthExceeded);
        }
    }
    Ok(out)
}

// ─── Number reading ─────────────────────────────────────────────────

/// Fast float reader: sign, digits, at most one decimal point, no
/// scientific notation ('E' may be a word letter on some controls).
fn read_float(bytes: &[u8], pos: &mut usize) -> Option<f32> {
    let mut i = *pos;
    let mut c = bytes.get(i).copied().unwrap_or(0);

    let mut negative = false;
    if c == b'-' {
        negative = true;
        i += 1;
        c = bytes.get(i).copied().unwrap_or(0);
    } else if c == b'+' {
        i += 1;
        c = bytes.get(i).copied().unwrap_or(0);
    }

    let mut intval: u32 = 0;
    let mut exp: i32 = 0;
    let mut ndigit: u8 = 0;
    let mut isdecimal = false;
    loop {
        if c.is_ascii_digit() {
            ndigit += 1;
            if ndigit <= MAX_INT_DIGITS {
                if isdecimal {
                    exp -= 1;
                }
                intval = intval * 10 + (c - b'0') as u32;
            } else if !isdecimal {
                // Drop overflow digits but keep the magnitude.
                exp += 1;
            }
        } else if c == b'.' && !isdecimal {
            isdecimal = true;
        } else {
            break;
        }
        i += 1;
        c = bytes.get(i).copied().unwrap_or(0);
    }

    if ndigit == 0 {
        return None;
    }

    let mut fval = intval as f32;
    if fval != 0.0 {
        while exp <= -2 {
            fval *= 0.01;
            exp += 2;
        }
        if exp < 0 {
            fval *= 0.1;
        } else {
            while exp > 0 {
                fval *= 10.0;
                exp -= 1;
            }
        }
    }

    *pos = i;
    Some(if negative { -fval } else { fval })
}

// ─── Parser ─────────────────────────────────────────────────────────

/// The g-code interpreter: persistent modal state plus the motion
/// control it dispatches into.
pub struct GcodeParser {
    pub state: ParserState,
    settings: Arc<Settings>,
    motion: MotionControl,
    sys_position: Arc<SysPosition>,
    feedback: Box<dyn Fn(&str) + Send>,
}

impl GcodeParser {
    pub fn new(
        motion: MotionControl,
        sys_position: Arc<SysPosition>,
        feedback: Box<dyn Fn(&str) + Send>,
    ) -> Self {
        let settings = motion.settings().clone();
        Self {
            state: ParserState::default(),
            settings,
            motion,
            sys_position,
            feedback,
        }
    }

    /// Reset the interpreter position from the machine position.
    pub fn sync_position(&mut self) {
        self.state.position =
            steps_to_mpos(&self.sys_position.snapshot(), &self.settings.steps_per_mm);
    }

    pub fn motion(&mut self) -> &mut MotionControl {
        &mut self.motion
    }

    /// Execute one groomed, zero-comment, upper-case line.
    ///
    /// On success the modal state reflects the line and any motion has
    /// been dispatched. On error the state is unchanged and nothing was
    /// queued.
    pub fn execute_line(&mut self, line: &str) -> Result<(), Status> {
        let bytes = line.as_bytes();

        let mut block = ParserBlock {
            modal: self.state.modal,
            ..ParserBlock::default()
        };
        let mut axis_command = AxisCommand::None;
        let mut axis_words: u8 = 0;
        let mut ijk_words: u8 = 0;
        let mut command_words = CommandWords::empty();
        let mut value_words = ValueWords::empty();
        let mut parser_flags = GcFlags::empty();

        // ── Word import ──
        let mut pos = 0usize;
        while pos < bytes.len() {
            let letter = bytes[pos];
            if !letter.is_ascii_uppercase() {
                return Err(Status::ExpectedCommandLetter);
            }
            pos += 1;
            let value = read_float(bytes, &mut pos).ok_or(Status::BadNumberFormat)?;

            // Split into integer part and a x100 mantissa so G38.2-style
            // decimal commands can be discriminated exactly.
            let int_value = value.trunc() as u16;
            let mut mantissa = (100.0 * (value - int_value as f32)).round() as u16;

            match letter {
                b'G' => {
                    if value < 0.0 {
                        return Err(Status::UnsupportedCommand);
                    }
                    let word_bit = match int_value {
                        4 | 10 | 28 | 30 | 53 | 92 => {
                            if matches!(int_value, 10 | 28 | 30 | 92) && mantissa == 0 {
                                if axis_command != AxisCommand::None {
                                    return Err(Status::AxisCommandConflict);
                                }
                                axis_command = AxisCommand::NonModal;
                            }
                            block.non_modal = int_value as u8;
                            if matches!(int_value, 28 | 30 | 92) {
                                if !(mantissa == 0 || mantissa == 10) {
                                    return Err(Status::UnsupportedCommand);
                                }
                                block.non_modal = (int_value + mantissa) as u8;
                                mantissa = 0;
                            }
                            CommandWords::G0
                        }
                        0 | 1 | 2 | 3 | 38 | 80 => {
                            // Two motion modes on one line is a group
                            // violation, not an axis conflict.
                            if command_words.contains(CommandWords::G1) {
                                return Err(Status::ModalGroupViolation);
                            }
                            if int_value != 80 {
                                if axis_command != AxisCommand::None {
                                    return Err(Status::AxisCommandConflict);
                                }
                                axis_command = AxisCommand::Motion;
                            }
                            let mut motion_value = int_value;
                            if int_value == 38 {
                                if !matches!(mantissa, 20 | 30 | 40 | 50) {
                                    return Err(Status::UnsupportedCommand);
                                }
                                motion_value = 38 + mantissa / 10 + 100;
                                mantissa = 0;
                            }
                            block.modal.motion = MotionMode::from_value(motion_value as u8)
                                .ok_or(Status::UnsupportedCommand)?;
                            CommandWords::G1
                        }
                        17 | 18 | 19 => {
                            block.modal.plane = match int_value {
                                17 => PlaneSelect::Xy,
                                18 => PlaneSelect::Zx,
                                _ => PlaneSelect::Yz,
                            };
                            CommandWords::G2
                        }
                        90 | 91 => {
                            if mantissa == 0 {
                                block.modal.distance = if int_value == 90 {
                                    DistanceMode::Absolute
                                } else {
                                    DistanceMode::Incremental
                                };
                                CommandWords::G3
                            } else {
                                if mantissa != 10 || int_value == 90 {
                                    return Err(Status::UnsupportedCommand);
                                }
                                // G91.1: arc IJK incremental mode, which is
                                // already the only supported mode.
                                mantissa = 0;
                                CommandWords::G4
                            }
                        }
                        93 | 94 => {
                            block.modal.feed_rate = if int_value == 93 {
                                FeedRateMode::InverseTime
                            } else {
                                FeedRateMode::UnitsPerMin
                            };
                            CommandWords::G5
                        }
                        20 | 21 => {
                            block.modal.units = if int_value == 20 {
                                UnitsMode::Inches
                            } else {
                                UnitsMode::Mm
                            };
                            CommandWords::G6
                        }
                        // Cutter compensation stays disabled; G40 is
                        // accepted so program headers do not error out.
                        40 => CommandWords::G7,
                        43 | 49 | 54..=59 => {
                            if (54..=59).contains(&int_value) {
                                block.modal.coord_select = (int_value - 54) as u8;
                            }
                            CommandWords::G12
                        }
                        61 => {
                            if mantissa != 0 {
                                return Err(Status::UnsupportedCommand);
                            }
                            CommandWords::G13
                        }
                        _ => return Err(Status::UnsupportedCommand),
                    };
                    if mantissa > 0 {
                        return Err(Status::CommandValueNotInteger);
                    }
                    if command_words.contains(word_bit) {
                        return Err(Status::ModalGroupViolation);
                    }
                    command_words.insert(word_bit);
                }

                b'M' => {
                    if value < 0.0 {
                        return Err(Status::UnsupportedCommand);
                    }
                    if mantissa > 0 {
                        return Err(Status::CommandValueNotInteger);
                    }
                    let word_bit = match int_value {
                        0 | 1 | 2 | 30 => {
                            match int_value {
                                0 => block.modal.program_flow = ProgramFlow::Paused,
                                1 => {} // Optional stop not supported.
                                2 => block.modal.program_flow = ProgramFlow::Completed,
                                _ => block.modal.program_flow = ProgramFlow::CompletedReset,
                            }
                            CommandWords::M4
                        }
                        3 | 4 | 5 => {
                            match int_value {
                                // M4: laser enable, variable power.
                                4 => block.modal.spindle = Condition::SPINDLE_CCW,
                                5 => block.modal.spindle = Condition::empty(),
                                _ => {}
                            }
                            CommandWords::M7
                        }
                        8 | 9 => {
                            match int_value {
                                8 => block.modal.coolant |= Condition::COOLANT_FLOOD,
                                // M9 disables both flood and mist.
                                _ => block.modal.coolant = Condition::empty(),
                            }
                            CommandWords::M8
                        }
                        _ => return Err(Status::UnsupportedCommand),
                    };
                    if command_words.contains(word_bit) {
                        return Err(Status::ModalGroupViolation);
                    }
                    command_words.insert(word_bit);
                }

                _ => {
                    // Value words: store now, validate in context later.
                    let word_bit = match letter {
                        b'F' => {
                            block.values.f = value;
                            ValueWords::F
                        }
                        b'I' => {
                            block.values.ijk[0] = value;
                            ijk_words |= 1 << 0;
                            ValueWords::I
                        }
                        b'J' => {
                            block.values.ijk[1] = value;
                            ijk_words |= 1 << 1;
                            ValueWords::J
                        }
                        b'K' => {
                            block.values.ijk[2] = value;
                            ijk_words |= 1 << 2;
                            ValueWords::K
                        }
                        b'L' => {
                            block.values.l = int_value as u8;
                            ValueWords::L
                        }
                        b'N' => {
                            block.values.n = value.trunc() as i32;
                            ValueWords::N
                        }
                        b'P' => {
                            block.values.p = value;
                            ValueWords::P
                        }
                        b'R' => {
                            block.values.r = value;
                            ValueWords::R
                        }
                        b'S' => {
                            block.values.s = value;
                            ValueWords::S
                        }
                        b'X' => {
                            block.values.xyz[0] = value;
                            axis_words |= 1 << 0;
                            ValueWords::X
                        }
                        b'Y' => {
                            block.values.xyz[1] = value;
                            axis_words |= 1 << 1;
                            ValueWords::Y
                        }
                        b'Z' => {
                            block.values.xyz[2] = value;
                            axis_words |= 1 << 2;
                            ValueWords::Z
                        }
                        _ => return Err(Status::UnsupportedCommand),
                    };
                    if value_words.contains(word_bit) {
                        return Err(Status::WordRepeated);
                    }
                    if word_bit.intersects(
                        ValueWords::F
                            | ValueWords::N
                            | ValueWords::P
                            | ValueWords::T
                            | ValueWords::S,
                    ) && value < 0.0
                    {
                        return Err(Status::NegativeValue);
                    }
                    value_words.insert(word_bit);
                }
            }
        }
        // Parsing complete.

        // ── Error checking and pre-conversion ──

        // Axis words without an explicit axis command imply the current
        // motion mode.
        if axis_words != 0 && axis_command == AxisCommand::None {
            axis_command = AxisCommand::Motion;
        }

        if value_words.contains(ValueWords::N) && block.values.n > MAX_LINE_NUMBER {
            return Err(Status::InvalidLineNumber);
        }

        // Feed-rate mode. Inverse time never carries a rate over; units
        // per minute pushes the previous state value when F is absent.
        if block.modal.feed_rate == FeedRateMode::InverseTime {
            if axis_command == AxisCommand::Motion
                && !matches!(block.modal.motion, MotionMode::None | MotionMode::Seek)
                && !value_words.contains(ValueWords::F)
            {
                return Err(Status::UndefinedFeedRate);
            }
        } else if self.state.modal.feed_rate == FeedRateMode::UnitsPerMin {
            if value_words.contains(ValueWords::F) {
                if block.modal.units == UnitsMode::Inches {
                    block.values.f *= MM_PER_INCH;
                }
            } else {
                block.values.f = self.state.feed_rate;
            }
        }
        // Else: switching G93 -> G94 leaves the rate undefined until set.

        if !value_words.contains(ValueWords::S) {
            block.values.s = self.state.spindle_speed;
        }

        if block.non_modal == non_modal::DWELL {
            if !value_words.contains(ValueWords::P) {
                return Err(Status::ValueWordMissing);
            }
            value_words.remove(ValueWords::P);
        }

        let (axis_0, axis_1, axis_linear) = block.modal.plane.axes();

        // Convert axis inputs to millimeters.
        if block.modal.units == UnitsMode::Inches {
            for idx in 0..N_AXIS {
                if axis_words & (1 << idx) != 0 {
                    block.values.xyz[idx] *= MM_PER_INCH;
                }
            }
        }

        // Motion mode checks, with arc geometry pre-computation.
        if block.modal.motion == MotionMode::None {
            if axis_words != 0 {
                return Err(Status::AxisWordsExist);
            }
        } else if axis_command == AxisCommand::Motion {
            if block.modal.motion == MotionMode::Seek {
                if axis_words == 0 {
                    axis_command = AxisCommand::None;
                }
            } else {
                // Every other motion needs a positive feed rate, fresh in
                // inverse-time mode.
                if block.values.f == 0.0 {
                    return Err(Status::UndefinedFeedRate);
                }

                match block.modal.motion {
                    MotionMode::Linear => {
                        if axis_words == 0 {
                            axis_command = AxisCommand::None;
                        }
                    }
                    MotionMode::CwArc | MotionMode::CcwArc => {
                        if block.modal.motion == MotionMode::CwArc {
                            parser_flags.insert(GcFlags::ARC_IS_CLOCKWISE);
                        }
                        if axis_words == 0 {
                            return Err(Status::NoAxisWords);
                        }
                        if axis_words & ((1 << axis_0) | (1 << axis_1)) == 0 {
                            return Err(Status::NoAxisWordsInPlane);
                        }

                        let mut x = block.values.xyz[axis_0] - self.state.position[axis_0];
                        let mut y = block.values.xyz[axis_1] - self.state.position[axis_1];

                        if value_words.contains(ValueWords::R) {
                            // Radius form: solve for the center on the
                            // perpendicular bisector of the chord.
                            value_words.remove(ValueWords::R);
                            if self.state.position == block.values.xyz {
                                return Err(Status::InvalidTarget);
                            }
                            if block.modal.units == UnitsMode::Inches {
                                block.values.r *= MM_PER_INCH;
                            }

                            // 4h^2 = 4r^2 - d^2; negative means the chord is
                            // longer than the diameter.
                            let mut h_x2_div_d =
                                4.0 * block.values.r * block.values.r - x * x - y * y;
                            if h_x2_div_d < 0.0 {
                                return Err(Status::ArcRadiusError);
                            }
                            h_x2_div_d = -h_x2_div_d.sqrt() / x.hypot(y);
                            if block.modal.motion == MotionMode::CcwArc {
                                h_x2_div_d = -h_x2_div_d;
                            }
                            // A negative R asks for the >180 degree arc: put
                            // the center on the other side of the chord.
                            if block.values.r < 0.0 {
                                h_x2_div_d = -h_x2_div_d;
                                block.values.r = -block.values.r;
                            }
                            block.values.ijk[axis_0] = 0.5 * (x - y * h_x2_div_d);
                            block.values.ijk[axis_1] = 0.5 * (y + x * h_x2_div_d);
                        } else {
                            // Center offset form.
                            if ijk_words & ((1 << axis_0) | (1 << axis_1)) == 0 {
                                return Err(Status::NoOffsetsInPlane);
                            }
                            value_words.remove(ValueWords::I | ValueWords::J | ValueWords::K);

                            if block.modal.units == UnitsMode::Inches {
                                for idx in 0..N_AXIS {
                                    if ijk_words & (1 << idx) != 0 {
                                        block.values.ijk[idx] *= MM_PER_INCH;
                                    }
                                }
                            }

                            x -= block.values.ijk[axis_0];
                            y -= block.values.ijk[axis_1];
                            let target_r = x.hypot(y);

                            block.values.r =
                                block.values.ijk[axis_0].hypot(block.values.ijk[axis_1]);

                            // The radii to both endpoints must agree.
                            let delta_r = (target_r - block.values.r).abs();
                            if delta_r > 0.005 {
                                if delta_r > 0.5 {
                                    return Err(Status::InvalidTarget);
                                }
                                if delta_r > 0.001 * block.values.r {
                                    return Err(Status::InvalidTarget);
                                }
                            }
                        }
                    }
                    _ => {} // Probe cycles share only the feed-rate check.
                }
            }
        }

        // Unused-word sweep: single-meaning words are consumed wholesale,
        // axis words whenever an axis command claimed them.
        value_words.remove(
            ValueWords::N | ValueWords::F | ValueWords::S | ValueWords::T,
        );
        if axis_command != AxisCommand::None {
            value_words.remove(ValueWords::X | ValueWords::Y | ValueWords::Z);
        }
        if !value_words.is_empty() {
            return Err(Status::UnusedWords);
        }

        // ── Execute ──
        // All checks passed; update state and act in execution order.

        let mut pl_data = LineData::default();

        if self.settings.laser_power_correction {
            if !block.modal.motion.is_laser_motion() {
                parser_flags.insert(GcFlags::LASER_DISABLE);
            }
            if axis_words != 0 && axis_command == AxisCommand::Motion {
                parser_flags.insert(GcFlags::LASER_ISMOTION);
            } else if self.state.modal.spindle.contains(Condition::SPINDLE_CW) {
                // Constant-power laser needs a sync when toggling between
                // laser motion modes with no motion on the line.
                if self.state.modal.motion.is_laser_motion() {
                    if parser_flags.contains(GcFlags::LASER_DISABLE) {
                        parser_flags.insert(GcFlags::LASER_FORCE_SYNC);
                    }
                } else if !parser_flags.contains(GcFlags::LASER_DISABLE) {
                    parser_flags.insert(GcFlags::LASER_FORCE_SYNC);
                }
            }
        }

        self.state.line_number = block.values.n;

        self.state.modal.feed_rate = block.modal.feed_rate;
        if self.state.modal.feed_rate == FeedRateMode::InverseTime {
            pl_data.condition |= Condition::INVERSE_TIME;
        }

        self.state.feed_rate = block.values.f;
        pl_data.feed_rate = self.state.feed_rate;

        if self.state.spindle_speed != block.values.s
            || parser_flags.contains(GcFlags::LASER_FORCE_SYNC)
        {
            // Laser speed sync hook goes here once the laser subsystem is
            // reintroduced.
            self.state.spindle_speed = block.values.s;
        }
        // Restricted laser motions pass zero spindle speed.
        if !parser_flags.contains(GcFlags::LASER_DISABLE) {
            pl_data.spindle_speed = self.state.spindle_speed;
        }

        if self.state.modal.spindle != block.modal.spindle {
            self.state.modal.spindle = block.modal.spindle;
        }
        pl_data.condition |= self.state.modal.spindle;

        self.state.modal.coolant = block.modal.coolant;
        pl_data.condition |= self.state.modal.coolant;

        if block.non_modal == non_modal::DWELL {
            self.motion.dwell(block.values.p);
        }

        self.state.modal.plane = block.modal.plane;
        self.state.modal.units = block.modal.units;
        self.state.modal.distance = block.modal.distance;

        // Motion execution. Non-modal commands that consumed the axis
        // words (G10/G28/G30/G92) lock motion out for this line.
        self.state.modal.motion = block.modal.motion;
        if self.state.modal.motion != MotionMode::None && axis_command == AxisCommand::Motion {
            match self.state.modal.motion {
                MotionMode::Linear => {
                    self.motion.line(&block.values.xyz, &pl_data)?;
                }
                MotionMode::Seek => {
                    pl_data.condition |= Condition::RAPID_MOTION;
                    self.motion.line(&block.values.xyz, &pl_data)?;
                }
                MotionMode::CwArc | MotionMode::CcwArc => {
                    let mut scratch = self.state.position;
                    self.motion.arc(
                        &block.values.xyz,
                        &mut pl_data,
                        &mut scratch,
                        &block.values.ijk,
                        block.values.r,
                        axis_0,
                        axis_1,
                        axis_linear,
                        parser_flags.contains(GcFlags::ARC_IS_CLOCKWISE),
                    )?;
                }
                _ => {}
            }
            // As far as the parser is concerned the tool is now at the
            // target; the motion system may still be working toward it.
            self.state.position = block.values.xyz;
        }

        // Program flow. M0 pauses until cycle start; M2/M30 reset a
        // defined subset of modal groups.
        self.state.modal.program_flow = block.modal.program_flow;
        if self.state.modal.program_flow != ProgramFlow::Running {
            self.motion.buffer_synchronize();
            if self.state.modal.program_flow != ProgramFlow::Paused {
                self.state.modal.motion = MotionMode::Linear;
                self.state.modal.plane = PlaneSelect::Xy;
                self.state.modal.distance = DistanceMode::Absolute;
                self.state.modal.feed_rate = FeedRateMode::UnitsPerMin;
                self.state.modal.coord_select = 0;
                self.state.modal.spindle = Condition::empty();
                self.state.modal.coolant = Condition::empty();
                (self.feedback)("Pgm End");
            }
            self.state.modal.program_flow = ProgramFlow::Running;
        }

        // Manual data input: every accepted line asks for a cycle.
        if self.settings.cli.mdi_mode {
            debug!("mdi line accepted, requesting run");
            self.motion.fsm().request(SystemState::Run);
        }

        Ok(())
    }
}

/// Parser worker loop: drain the groomed-line queue, report one status
/// per line.
pub fn parser_worker(
    rx: Receiver<String>,
    mut parser: GcodeParser,
    report: Box<dyn Fn(Result<(), Status>) + Send>,
) {
    for line in rx {
        report(parser.execute_line(&line));
    }
    info!("parser worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{planner_queue, PlanConsumer, Planner};
    use crate::segment::{segment_ring, SegmentPrep, StepControl};
    use cinder_common::fsm::Fsm;
    use std::sync::Mutex;

    fn test_parser() -> (GcodeParser, PlanConsumer) {
        // MDI off so tests do not touch the FSM; auto-cycle off likewise.
        let mut settings = Settings::default();
        settings.cli.mdi_mode = false;
        settings.cli.auto_cycle = false;
        let settings = Arc::new(settings);

        let position = Arc::new(SysPosition::new());
        let (fsm, _handle) = Fsm::start();
        let (queue, consumer) = planner_queue();
        let (producer, _seg_consumer) = segment_ring();
        let control = Arc::new(StepControl::new());
        let prep = Arc::new(Mutex::new(SegmentPrep::new(
            consumer,
            producer,
            control,
            settings.clone(),
        )));
        let probe = PlanConsumer::test_handle(queue.clone());
        let planner = Planner::new(queue, prep.clone(), settings.clone(), position.clone());
        let motion = MotionControl::new(planner, prep, fsm, settings);
        (
            GcodeParser::new(motion, position, Box::new(|_| {})),
            probe,
        )
    }

    #[test]
    fn groom_strips_comments_and_whitespace() {
        assert_eq!(groom_line("g0 x10 (move) y2 ; tail").unwrap(), "G0X10Y2");
        assert_eq!(groom_line("/ g1 x1").unwrap(), "G1X1");
        assert_eq!(groom_line("  \t\r\n").unwrap(), "");
    }

    #[test]
    fn read_float_handles_signs_and_decimals() {
        let cases: [(&str, f32); 6] = [
            ("100", 100.0),
            ("-12.5", -12.5),
            ("+3.1415", 3.1415),
            (".25", 0.25),
            ("38.2", 38.2),
            ("0", 0.0),
        ];
        for (text, expect) in cases {
            let mut pos = 0;
            let got = read_float(text.as_bytes(), &mut pos).unwrap();
            assert!((got - expect).abs() < 1e-4, "{text}: {got}");
            assert_eq!(pos, text.len());
        }
        let mut pos = 0;
        assert!(read_float(b"X10", &mut pos).is_none());
        let mut pos = 0;
        assert!(read_float(b"-", &mut pos).is_none());
    }

    #[test]
    fn rapid_move_is_queued_rapid() {
        let (mut parser, probe) = test_parser();
        parser.execute_line("G0X100Y0F0").unwrap();
        let block = probe.tail_snapshot().unwrap();
        assert!(block.condition.contains(Condition::RAPID_MOTION));
        assert_eq!(block.steps, [10667, 0, 0]);
        assert_eq!(block.step_event_count, 10667);
        assert_eq!(block.direction_bits, 0);
        assert_eq!(parser.state.position, [100.0, 0.0, 0.0]);
    }

    #[test]
    fn modal_group_violation_leaves_state_untouched() {
        let (mut parser, probe) = test_parser();
        let before = parser.state.clone();
        assert_eq!(
            parser.execute_line("G0G1X1"),
            Err(Status::ModalGroupViolation)
        );
        assert_eq!(parser.state, before);
        assert!(probe.tail_snapshot().is_none());
    }

    #[test]
    fn feed_move_requires_feed_rate() {
        let (mut parser, _) = test_parser();
        assert_eq!(
            parser.execute_line("G1X10"),
            Err(Status::UndefinedFeedRate)
        );
    }

    #[test]
    fn feed_rate_is_modal_in_units_per_min() {
        let (mut parser, probe) = test_parser();
        parser.execute_line("G1X5F600").unwrap();
        probe.discard_tail();
        parser.execute_line("G1X10").unwrap();
        let block = probe.tail_snapshot().unwrap();
        assert!((block.programmed_rate - 600.0).abs() < 1e-3);
    }

    #[test]
    fn inverse_time_requires_fresh_feed_word() {
        let (mut parser, _) = test_parser();
        parser.execute_line("G1X5F600").unwrap();
        parser.execute_line("G93").unwrap();
        assert_eq!(
            parser.execute_line("G1X10"),
            Err(Status::UndefinedFeedRate)
        );
    }

    #[test]
    fn negative_feed_is_rejected() {
        let (mut parser, _) = test_parser();
        assert_eq!(parser.execute_line("G1X1F-5"), Err(Status::NegativeValue));
    }

    #[test]
    fn repeated_word_is_rejected() {
        let (mut parser, _) = test_parser();
        assert_eq!(
            parser.execute_line("G0X1X2"),
            Err(Status::WordRepeated)
        );
    }

    #[test]
    fn unknown_letter_is_rejected() {
        let (mut parser, _) = test_parser();
        assert_eq!(
            parser.execute_line("Q5"),
            Err(Status::UnsupportedCommand)
        );
    }

    #[test]
    fn lowercase_input_is_a_grooming_bug_not_a_parser_case() {
        let (mut parser, _) = test_parser();
        assert_eq!(
            parser.execute_line("g0x1"),
            Err(Status::ExpectedCommandLetter)
        );
    }

    #[test]
    fn unused_words_are_rejected() {
        let (mut parser, _) = test_parser();
        // P without a dwell to consume it.
        assert_eq!(parser.execute_line("G0X1P2"), Err(Status::UnusedWords));
    }

    #[test]
    fn axis_words_with_g80_are_rejected() {
        let (mut parser, _) = test_parser();
        assert_eq!(
            parser.execute_line("G80X1"),
            Err(Status::AxisWordsExist)
        );
    }

    #[test]
    fn line_number_over_limit_is_rejected() {
        let (mut parser, _) = test_parser();
        assert_eq!(
            parser.execute_line("N99999999G0X1"),
            Err(Status::InvalidLineNumber)
        );
    }

    #[test]
    fn inch_units_convert_axis_words() {
        let (mut parser, probe) = test_parser();
        parser.execute_line("G20G0X1").unwrap();
        let block = probe.tail_snapshot().unwrap();
        // 1 inch of X at 106.667 steps/mm.
        let expect = (25.4 * Settings::default().steps_per_mm[0]).round() as u32;
        assert_eq!(block.steps[0], expect);
        assert_eq!(parser.state.position[0], 25.4);
    }

    #[test]
    fn arc_radius_shorter_than_chord_is_rejected() {
        let (mut parser, _) = test_parser();
        // 20 mm chord with a 5 mm radius cannot close.
        assert_eq!(
            parser.execute_line("G2X20Y0R5F600"),
            Err(Status::ArcRadiusError)
        );
    }

    #[test]
    fn arc_without_plane_words_is_rejected() {
        let (mut parser, _) = test_parser();
        assert_eq!(
            parser.execute_line("G2Z3F100"),
            Err(Status::NoAxisWordsInPlane)
        );
        assert_eq!(parser.execute_line("G2F100"), Err(Status::NoAxisWords));
    }

    #[test]
    fn offset_arc_with_disagreeing_radii_is_rejected() {
        let (mut parser, _) = test_parser();
        // Center at I10, target 30 mm out: radii differ by 10 mm.
        assert_eq!(
            parser.execute_line("G2X30Y0I10F600"),
            Err(Status::InvalidTarget)
        );
    }

    #[test]
    fn full_circle_arc_is_accepted() {
        let (mut parser, probe) = test_parser();
        parser.execute_line("G0X200Y135").unwrap();
        probe.discard_tail();
        parser.execute_line("G2X200Y135I50J0F3000").unwrap();
        let mut chords = 0;
        while probe.tail_snapshot().is_some() {
            probe.discard_tail();
            chords += 1;
        }
        assert!(chords >= 200, "only {chords} chords");
    }

    #[test]
    fn dwell_requires_p_word() {
        let (mut parser, _) = test_parser();
        assert_eq!(parser.execute_line("G4"), Err(Status::ValueWordMissing));
        parser.execute_line("G4P0").unwrap();
    }

    #[test]
    fn program_end_resets_modal_subset() {
        let (mut parser, _) = test_parser();
        parser.execute_line("G18G91G93M4S100").unwrap();
        parser.execute_line("M2").unwrap();
        assert_eq!(parser.state.modal.plane, PlaneSelect::Xy);
        assert_eq!(parser.state.modal.distance, DistanceMode::Absolute);
        assert_eq!(parser.state.modal.feed_rate, FeedRateMode::UnitsPerMin);
        assert_eq!(parser.state.modal.motion, MotionMode::Linear);
        assert_eq!(parser.state.modal.spindle, Condition::empty());
        assert_eq!(parser.state.modal.program_flow, ProgramFlow::Running);
    }

    #[test]
    fn repeating_a_line_is_idempotent_on_modal_state() {
        let (mut parser, probe) = test_parser();
        parser.execute_line("G1G18G91F700X5Y5").unwrap();
        let once = parser.state.clone();
        parser.execute_line("G1G18G91F700X5Y5").unwrap();
        assert_eq!(parser.state, once);
        // The second, coincident move queued nothing.
        probe.discard_tail();
        assert!(probe.tail_snapshot().is_none());
    }

    #[test]
    fn laser_enable_flows_into_block_condition() {
        let (mut parser, probe) = test_parser();
        parser.execute_line("M4S255").unwrap();
        parser.execute_line("G1X10F1000").unwrap();
        let block = probe.tail_snapshot().unwrap();
        assert!(block.condition.contains(Condition::SPINDLE_CCW));
        assert_eq!(block.spindle_speed, 255.0);
    }
}
