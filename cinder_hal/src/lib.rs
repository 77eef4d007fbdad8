//! Hardware surface of the Cinder CNC controller.
//!
//! Everything that touches the kernel lives here: the control board's
//! sysfs attribute files and pulse FIFO, the stepper driver register
//! bring-up, and the evdev watchers for switches and limits. Each
//! hardware unit reports into the system state machine as its own
//! subsystem.
//!
//! - [`board`] - control-board attributes, pulse FIFO, state poll, LEDs
//! - [`step_drv`] - stepper driver register tables and verified bring-up
//! - [`input`] - evdev event decoding shared by the watchers
//! - [`switches`] - lid/interlock/button watcher
//! - [`limits`] - axis limit switch watcher

use thiserror::Error;

pub mod board;
pub mod input;
pub mod limits;
pub mod step_drv;
pub mod switches;

/// Hardware-layer error.
#[derive(Debug, Error)]
pub enum HalError {
    #[error("attribute {path}: {source}")]
    Attr {
        path: String,
        source: std::io::Error,
    },
    #[error("event device {path}: {source}")]
    EventDevice {
        path: String,
        source: std::io::Error,
    },
    #[error("stepper driver {axis}: not ready")]
    DriverNotReady { axis: &'static str },
    #[error("stepper driver {axis}: register {register} verify failed (wrote {wrote:#x}, read {read:#x})")]
    DriverVerify {
        axis: &'static str,
        register: &'static str,
        wrote: u64,
        read: u64,
    },
    #[error("task spawn: {0}")]
    Sched(#[from] cinder_common::sched::SchedError),
}
