//! Axis limit switch watcher.
//!
//! Six limit switches (X+/X-, Y1+/Y1-, Y2+/Y2-) arrive on the second
//! event device. Any limit opening while the machine is live is an
//! alarm; the device disappearing is a fault. The homing cycle is the
//! only context in which an open limit is expected, which the acceptance
//! map expresses by also allowing the homing state while idle.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use cinder_common::fsm::{Fsm, StateHandler, StateMap, SubFsm, SystemState};

use crate::input::{apply_events, EventDevice, InputStatus};
use crate::HalError;

/// Default limit event device.
pub const LIMIT_DEVICE: &str = "/dev/input/event1";

const LIMIT_X_POS_BIT: u16 = 1;
const LIMIT_X_NEG_BIT: u16 = 2;
const LIMIT_Y1_POS_BIT: u16 = 3;
const LIMIT_Y1_NEG_BIT: u16 = 4;
const LIMIT_Y2_POS_BIT: u16 = 5;
const LIMIT_Y2_NEG_BIT: u16 = 6;

pub const N_LIMIT_SW: usize = 6;

/// Local states of the limits subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LimitState {
    Init = 0,
    Safe = 1,
    Homing = 2,
    Alarm = 3,
    Fault = 4,
}

fn limit_state_map() -> Vec<(SystemState, u8)> {
    vec![
        (SystemState::Init, LimitState::Init as u8),
        (SystemState::Sleep, LimitState::Safe as u8),
        (SystemState::Idle, LimitState::Safe as u8),
        (SystemState::Idle, LimitState::Homing as u8),
        (SystemState::Homing, LimitState::Homing as u8),
        (SystemState::Run, LimitState::Safe as u8),
        (SystemState::Hold, LimitState::Safe as u8),
        (SystemState::Fault, LimitState::Fault as u8),
        (SystemState::Alarm, LimitState::Alarm as u8),
    ]
}

fn default_inputs() -> [InputStatus; N_LIMIT_SW] {
    [
        InputStatus::new(LIMIT_X_POS_BIT, false),
        InputStatus::new(LIMIT_X_NEG_BIT, false),
        InputStatus::new(LIMIT_Y1_POS_BIT, false),
        InputStatus::new(LIMIT_Y1_NEG_BIT, false),
        InputStatus::new(LIMIT_Y2_POS_BIT, false),
        InputStatus::new(LIMIT_Y2_NEG_BIT, false),
    ]
}

/// Shared limit watcher state.
pub struct Limits {
    inputs: Mutex<[InputStatus; N_LIMIT_SW]>,
    state: Mutex<LimitState>,
    fsm: Arc<Fsm>,
    device: PathBuf,
}

impl Limits {
    pub fn new(fsm: Arc<Fsm>, device: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            inputs: Mutex::new(default_inputs()),
            state: Mutex::new(LimitState::Init),
            fsm,
            device: device.into(),
        })
    }

    /// All limit switches made.
    pub fn ok(&self) -> bool {
        let inputs = self.inputs.lock().expect("limit vector poisoned");
        inputs.iter().all(|input| input.state)
    }

    /// Register with the aggregator and report the initial state.
    pub fn init(self: &Arc<Self>, hardware_present: bool) -> Result<(), HalError> {
        if !hardware_present {
            let mut inputs = self.inputs.lock().expect("limit vector poisoned");
            for input in inputs.iter_mut() {
                input.state = true;
            }
        }

        let initial = if self.ok() {
            LimitState::Safe
        } else {
            LimitState::Alarm
        };
        *self.state.lock().expect("limit state poisoned") = initial;

        let watcher = self.clone();
        self.fsm.register(
            SubFsm::Limits,
            StateMap {
                maps: limit_state_map(),
                handler: Some(Box::new(LimitsHandler { watcher })),
            },
        );
        self.fsm.update(SubFsm::Limits, initial as u8).ok();
        Ok(())
    }

    /// Event loop body. Blocks on the device; exits on device loss.
    pub fn event_loop(self: Arc<Self>, shutdown: Arc<AtomicBool>) {
        let open_result = {
            let mut inputs = self.inputs.lock().expect("limit vector poisoned");
            EventDevice::open(&self.device, inputs.as_mut_slice())
        };
        let mut device = match open_result {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "limit device open failed");
                let _ = self.fsm.update(SubFsm::Limits, LimitState::Fault as u8);
                return;
            }
        };

        let mut events = Vec::with_capacity(64);
        loop {
            if shutdown.load(std::sync::atomic::Ordering::Acquire) {
                return;
            }
            if let Err(e) = device.read_events(&mut events) {
                error!(error = %e, "limit device lost");
                let _ = self.fsm.update(SubFsm::Limits, LimitState::Fault as u8);
                return;
            }
            self.process_events(&events);
        }
    }

    /// Fold a batch of events into the vector and derive the local state.
    pub fn process_events(&self, events: &[crate::input::InputEvent]) {
        let prev_ok = self.ok();

        {
            let mut inputs = self.inputs.lock().expect("limit vector poisoned");
            apply_events(events, inputs.as_mut_slice());
        }

        let mut state = self.state.lock().expect("limit state poisoned");
        let prev_state = *state;
        if prev_ok && !self.ok() {
            debug!("limit opened");
            *state = LimitState::Alarm;
        }
        if prev_state != *state {
            let _ = self.fsm.update(SubFsm::Limits, *state as u8);
        }
    }
}

/// Re-derives the local state on system state changes.
struct LimitsHandler {
    watcher: Arc<Limits>,
}

impl StateHandler for LimitsHandler {
    fn on_state_change(&self, _fsm: &Fsm) {
        let watcher = &self.watcher;
        let mut state = watcher.state.lock().expect("limit state poisoned");
        let prev = *state;
        *state = if watcher.ok() {
            LimitState::Safe
        } else {
            LimitState::Alarm
        };
        if prev != *state {
            let _ = watcher.fsm.update(SubFsm::Limits, *state as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputEvent, EV_SW};

    fn limit_event(code: u16, value: i32) -> InputEvent {
        InputEvent {
            kind: EV_SW,
            code,
            value,
        }
    }

    fn closed_events() -> Vec<InputEvent> {
        (1..=6).map(|code| limit_event(code, 1)).collect()
    }

    fn test_limits() -> (Arc<Limits>, Arc<Fsm>) {
        let (fsm, _task) = Fsm::start();
        let limits = Limits::new(fsm.clone(), "/nonexistent");
        limits.init(true).unwrap();
        (limits, fsm)
    }

    #[test]
    fn starts_alarmed_with_open_limits() {
        let (limits, _) = test_limits();
        assert!(!limits.ok());
        assert_eq!(*limits.state.lock().unwrap(), LimitState::Alarm);
    }

    #[test]
    fn all_closed_is_ok() {
        let (limits, _) = test_limits();
        limits.process_events(&closed_events());
        assert!(limits.ok());
    }

    #[test]
    fn limit_trip_raises_alarm() {
        let (limits, _fsm) = test_limits();
        limits.process_events(&closed_events());
        // The notification handler normally restores Safe once the
        // system state settles; emulate that here.
        *limits.state.lock().unwrap() = LimitState::Safe;

        limits.process_events(&[limit_event(LIMIT_Y1_NEG_BIT, 0)]);
        assert_eq!(*limits.state.lock().unwrap(), LimitState::Alarm);
    }
}
