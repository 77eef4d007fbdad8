//! Stepper driver bring-up.
//!
//! The three Trinamic drivers (x, y1, y2) are exposed as per-axis sysfs
//! directories of register attributes, each read or written as a
//! hex-stringified word. Bring-up waits for the drivers to report their
//! enable input low, pushes the configuration tables, and reads back
//! every read-write register to verify it stuck. A driver that never
//! becomes ready or fails verification is a fault.

use std::time::Duration;

use tracing::{debug, info};

use crate::board::Board;
use crate::HalError;

/// Sentinel for registers left at their reset value. One bit wider than
/// any real register word so it can never collide.
const ATTR_NOT_SET: u64 = 0x1_FFFF_FFFF;

/// Rounds of the driver-ready poll.
const READY_POLL_ROUNDS: u32 = 10;

/// Interval between ready polls.
const READY_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Register access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// One register attribute: sysfs name and access mode.
struct RegAttr {
    name: &'static str,
    mode: Mode,
}

const fn reg(name: &'static str, mode: Mode) -> RegAttr {
    RegAttr { name, mode }
}

/// Registers programmed at bring-up, in write order.
const DRV_REGISTERS: &[RegAttr] = &[
    reg("chopconf", Mode::ReadWrite),
    reg("coolconf", Mode::WriteOnly),
    reg("dcctrl", Mode::WriteOnly),
    reg("encm_ctrl", Mode::WriteOnly),
    reg("gconf", Mode::ReadWrite),
    reg("ihold_irun", Mode::WriteOnly),
    reg("mslut0", Mode::WriteOnly),
    reg("mslut1", Mode::WriteOnly),
    reg("mslut2", Mode::WriteOnly),
    reg("mslut3", Mode::WriteOnly),
    reg("mslut4", Mode::WriteOnly),
    reg("mslut5", Mode::WriteOnly),
    reg("mslut6", Mode::WriteOnly),
    reg("mslut7", Mode::WriteOnly),
    reg("mslutsel", Mode::WriteOnly),
    reg("mslutstart", Mode::WriteOnly),
    reg("pwmconf", Mode::WriteOnly),
    reg("tcoolthrs", Mode::WriteOnly),
    reg("thigh", Mode::WriteOnly),
    reg("tpowerdown", Mode::WriteOnly),
    reg("tpwmthrs", Mode::WriteOnly),
    reg("vdcmin", Mode::WriteOnly),
    reg("xdirect", Mode::ReadWrite),
];

/// Status/input registers, read-only.
const REG_IOIN: &str = "ioin";

/// Per-axis sysfs directory names.
const AXIS_DIRS: [&str; 3] = ["x-axis", "y1-axis", "y2-axis"];

// ─── Register field encoding ────────────────────────────────────────

/// Field builders for the driver register words.
pub mod fields {
    const fn bits(lsb: u32, value: u64, width: u32) -> u64 {
        (value & ((1 << width) - 1)) << lsb
    }

    pub const MSTEPS_16: u64 = 4;
    pub const FPWM_2_1024: u64 = 0;

    pub const fn chopconf_toff(v: u64) -> u64 {
        bits(0, v, 4)
    }
    pub const fn chopconf_hstrt(v: u64) -> u64 {
        bits(4, v, 3)
    }
    pub const fn chopconf_hend(v: u64) -> u64 {
        bits(7, v, 4)
    }
    pub const fn chopconf_tbl(v: u64) -> u64 {
        bits(15, v, 2)
    }
    pub const fn chopconf_mres(v: u64) -> u64 {
        bits(24, v, 4)
    }
    pub const CHOPCONF_INTPOL: u64 = 1 << 28;

    pub const GCONF_EN_PWM_MODE: u64 = 1 << 2;

    pub const fn ihold_irun_ihold(v: u64) -> u64 {
        bits(0, v, 5)
    }
    pub const fn ihold_irun_irun(v: u64) -> u64 {
        bits(8, v, 5)
    }
    pub const fn ihold_irun_iholddelay(v: u64) -> u64 {
        bits(16, v, 4)
    }

    pub const fn pwmconf_pwm_ampl(v: u64) -> u64 {
        bits(0, v, 8)
    }
    pub const fn pwmconf_pwm_grad(v: u64) -> u64 {
        bits(8, v, 8)
    }
    pub const fn pwmconf_pwm_freq(v: u64) -> u64 {
        bits(16, v, 2)
    }
    pub const PWMCONF_PWM_AUTOSCALE: u64 = 1 << 18;

    pub const fn tpowerdown(v: u64) -> u64 {
        bits(0, v, 8)
    }
    pub const fn tpwmthrs(v: u64) -> u64 {
        bits(0, v, 20)
    }

    /// Driver enable input, active low, in IOIN.
    pub const IOIN_DRV_ENN_CFG6: u64 = 1 << 4;
}

use fields::*;

/// Configuration table shared by all three axes: stealth-chop with 16
/// microsteps, moderate run current, silent PWM frequency.
fn axis_settings() -> [(usize, u64); DRV_REGISTERS.len()] {
    let mut table = [(0usize, ATTR_NOT_SET); DRV_REGISTERS.len()];
    let mut set = |name: &str, value: u64| {
        let idx = DRV_REGISTERS
            .iter()
            .position(|r| r.name == name)
            .expect("register name");
        table[idx] = (idx, value);
    };

    set(
        "chopconf",
        chopconf_toff(3)
            | chopconf_hstrt(4)
            | chopconf_hend(1)
            | chopconf_tbl(2)
            | CHOPCONF_INTPOL
            | chopconf_mres(MSTEPS_16),
    );
    set("gconf", GCONF_EN_PWM_MODE);
    set(
        "ihold_irun",
        ihold_irun_ihold(5) | ihold_irun_irun(5) | ihold_irun_iholddelay(6),
    );
    set(
        "pwmconf",
        pwmconf_pwm_ampl(200)
            | pwmconf_pwm_grad(1)
            | pwmconf_pwm_freq(FPWM_2_1024)
            | PWMCONF_PWM_AUTOSCALE,
    );
    set("tpowerdown", tpowerdown(10));
    set("tpwmthrs", tpwmthrs(500));

    for (idx, entry) in table.iter_mut().enumerate() {
        entry.0 = idx;
    }
    table
}

fn axis_reg(axis: &str, name: &str) -> String {
    format!("{axis}/{name}")
}

/// Wait for every driver to report its enable input low.
fn wait_drivers_ready(board: &Board) -> Result<(), HalError> {
    let mut ready = [false; AXIS_DIRS.len()];
    for _ in 0..READY_POLL_ROUNDS {
        for (idx, axis) in AXIS_DIRS.iter().enumerate() {
            if !ready[idx] {
                let ioin = board.read_attr_u32(&axis_reg(axis, REG_IOIN))? as u64;
                if ioin & IOIN_DRV_ENN_CFG6 == 0 {
                    ready[idx] = true;
                }
            }
        }
        if ready.iter().all(|r| *r) {
            return Ok(());
        }
        std::thread::sleep(READY_POLL_INTERVAL);
    }
    let axis = AXIS_DIRS[ready.iter().position(|r| !*r).unwrap_or(0)];
    Err(HalError::DriverNotReady { axis })
}

/// Program and verify all three drivers.
pub fn step_drv_init(board: &Board) -> Result<(), HalError> {
    wait_drivers_ready(board)?;

    let settings = axis_settings();
    for axis in AXIS_DIRS {
        for (idx, value) in settings {
            let register = &DRV_REGISTERS[idx];
            if register.mode == Mode::ReadOnly || value == ATTR_NOT_SET {
                continue;
            }
            let path = axis_reg(axis, register.name);
            board.write_attr_u64(&path, value)?;

            if register.mode == Mode::ReadWrite {
                let read = board.read_attr_u32(&path)? as u64;
                if read != value {
                    return Err(HalError::DriverVerify {
                        axis,
                        register: register.name,
                        wrote: value,
                        read,
                    });
                }
            }
            debug!(axis, register = register.name, value, "register programmed");
        }
    }
    info!("stepper drivers configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_board() -> (tempfile::TempDir, Board) {
        let dir = tempfile::tempdir().unwrap();
        for axis in AXIS_DIRS {
            std::fs::create_dir_all(dir.path().join("sys").join(axis)).unwrap();
        }
        let board = Board::new(dir.path().join("sys"), dir.path().join("pulse"));
        (dir, board)
    }

    fn mark_ready(board: &Board) {
        for axis in AXIS_DIRS {
            // Enable input low: driver powered and ready.
            board.write_attr_str(&axis_reg(axis, REG_IOIN), "0x0").unwrap();
        }
    }

    #[test]
    fn bring_up_programs_and_verifies() {
        let (_dir, board) = temp_board();
        mark_ready(&board);
        step_drv_init(&board).unwrap();

        // Spot-check a verified register on each axis.
        let expect = chopconf_toff(3)
            | chopconf_hstrt(4)
            | chopconf_hend(1)
            | chopconf_tbl(2)
            | CHOPCONF_INTPOL
            | chopconf_mres(MSTEPS_16);
        for axis in AXIS_DIRS {
            let read = board.read_attr_u32(&axis_reg(axis, "chopconf")).unwrap() as u64;
            assert_eq!(read, expect);
        }
    }

    #[test]
    fn bring_up_times_out_when_never_ready() {
        let (_dir, board) = temp_board();
        for axis in AXIS_DIRS {
            // Enable input stuck high.
            board
                .write_attr_str(&axis_reg(axis, REG_IOIN), "0x10")
                .unwrap();
        }
        assert!(matches!(
            step_drv_init(&board),
            Err(HalError::DriverNotReady { .. })
        ));
    }

    #[test]
    fn unset_registers_are_skipped() {
        let (dir, board) = temp_board();
        mark_ready(&board);
        step_drv_init(&board).unwrap();
        // mslut0 stays at its reset value: no file was written.
        assert!(!dir.path().join("sys/x-axis/mslut0").exists());
    }

    #[test]
    fn field_encodings_match_register_layout() {
        assert_eq!(chopconf_toff(3), 0x3);
        assert_eq!(chopconf_mres(MSTEPS_16), 0x4 << 24);
        assert_eq!(
            ihold_irun_ihold(5) | ihold_irun_irun(5) | ihold_irun_iholddelay(6),
            0x6_0505
        );
        assert_eq!(tpwmthrs(500), 500);
    }
}
