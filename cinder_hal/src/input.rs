//! Input event decoding shared by the switch and limit watchers.
//!
//! The kernel delivers `struct input_event` records: a timeval followed
//! by type, code and value. Both watchers care only about switch-class
//! events (type 5) and keep one status record per input, combining a
//! present-state boolean with the event code it listens to and an invert
//! flag for active-low inputs.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::path::Path;

use tracing::warn;

use crate::HalError;

/// Switch-class event type.
pub const EV_SW: u16 = 5;

/// Size of one kernel input_event record on 64-bit.
pub const EVENT_SIZE: usize = 24;

/// One decoded input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

/// State record for one watched input.
#[derive(Debug, Clone, Copy)]
pub struct InputStatus {
    /// Present state after inversion.
    pub state: bool,
    /// Event code this input listens to.
    pub bit: u16,
    /// Input is active-low.
    pub invert: bool,
}

impl InputStatus {
    pub const fn new(bit: u16, invert: bool) -> Self {
        Self {
            state: false,
            bit,
            invert,
        }
    }

    /// Record a raw value, applying the invert flag.
    #[inline]
    pub fn apply(&mut self, value: i32) {
        self.state = value != 0;
        if self.state && self.invert {
            self.state = false;
        }
    }
}

/// Decode a buffer of raw input_event records.
pub fn decode_events(buf: &[u8], out: &mut Vec<InputEvent>) {
    out.clear();
    for chunk in buf.chunks_exact(EVENT_SIZE) {
        // Skip the 16-byte timeval; type/code/value follow.
        let kind = u16::from_ne_bytes([chunk[16], chunk[17]]);
        let code = u16::from_ne_bytes([chunk[18], chunk[19]]);
        let value = i32::from_ne_bytes([chunk[20], chunk[21], chunk[22], chunk[23]]);
        out.push(InputEvent { kind, code, value });
    }
}

/// Apply a batch of events to a status vector. Only switch-class events
/// are considered; each event updates the input listening on its code.
pub fn apply_events(events: &[InputEvent], inputs: &mut [InputStatus]) {
    for ev in events {
        if ev.kind != EV_SW {
            continue;
        }
        for input in inputs.iter_mut() {
            if ev.code == input.bit {
                input.apply(ev.value);
            }
        }
    }
}

// EVIOCGRAB: exclusive access; EVIOCGSW: current switch state bitmap.
nix::ioctl_write_int!(eviocgrab, b'E', 0x90);
nix::ioctl_read_buf!(eviocgsw, b'E', 0x1b, u8);

/// An opened, grabbed event device.
pub struct EventDevice {
    file: File,
    path: String,
}

impl EventDevice {
    /// Open and grab the device, and seed the inputs from the current
    /// switch state bitmap.
    pub fn open(path: &Path, inputs: &mut [InputStatus]) -> Result<Self, HalError> {
        let file = File::open(path).map_err(|source| HalError::EventDevice {
            path: path.display().to_string(),
            source,
        })?;

        let mut bitmap = [0u8; 8];
        // SAFETY: valid fd, correctly-sized buffer for the request.
        let seeded = unsafe { eviocgsw(file.as_raw_fd(), &mut bitmap) }.is_ok();
        if seeded {
            for input in inputs.iter_mut() {
                let byte = (input.bit / 8) as usize;
                let mask = 1u8 << (input.bit % 8);
                input.apply(i32::from(bitmap[byte] & mask != 0));
            }
        } else {
            warn!(path = %path.display(), "switch state query failed, assuming released");
        }

        // SAFETY: valid fd; 1 requests the exclusive grab.
        if unsafe { eviocgrab(file.as_raw_fd(), 1) }.is_err() {
            warn!(path = %path.display(), "exclusive grab failed");
        }

        Ok(Self {
            file,
            path: path.display().to_string(),
        })
    }

    /// Block for the next batch of events.
    pub fn read_events(&mut self, events: &mut Vec<InputEvent>) -> Result<(), HalError> {
        let mut buf = [0u8; EVENT_SIZE * 64];
        let n = self
            .file
            .read(&mut buf)
            .map_err(|source| HalError::EventDevice {
                path: self.path.clone(),
                source,
            })?;
        if n == 0 {
            return Err(HalError::EventDevice {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "device closed"),
            });
        }
        decode_events(&buf[..n], events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_event(kind: u16, code: u16, value: i32) -> [u8; EVENT_SIZE] {
        let mut raw = [0u8; EVENT_SIZE];
        raw[16..18].copy_from_slice(&kind.to_ne_bytes());
        raw[18..20].copy_from_slice(&code.to_ne_bytes());
        raw[20..24].copy_from_slice(&value.to_ne_bytes());
        raw
    }

    #[test]
    fn decode_extracts_type_code_value() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&raw_event(EV_SW, 2, 1));
        buf.extend_from_slice(&raw_event(1, 30, 0));
        let mut events = Vec::new();
        decode_events(&buf, &mut events);
        assert_eq!(
            events,
            vec![
                InputEvent {
                    kind: EV_SW,
                    code: 2,
                    value: 1
                },
                InputEvent {
                    kind: 1,
                    code: 30,
                    value: 0
                },
            ]
        );
    }

    #[test]
    fn apply_updates_matching_input_only() {
        let mut inputs = [InputStatus::new(2, false), InputStatus::new(3, false)];
        let events = [InputEvent {
            kind: EV_SW,
            code: 3,
            value: 1,
        }];
        apply_events(&events, &mut inputs);
        assert!(!inputs[0].state);
        assert!(inputs[1].state);
    }

    #[test]
    fn non_switch_events_are_ignored() {
        let mut inputs = [InputStatus::new(2, false)];
        let events = [InputEvent {
            kind: 1,
            code: 2,
            value: 1,
        }];
        apply_events(&events, &mut inputs);
        assert!(!inputs[0].state);
    }

    #[test]
    fn invert_masks_active_inputs() {
        // An inverted input reads false whenever the raw value is high.
        let mut input = InputStatus::new(7, true);
        input.apply(1);
        assert!(!input.state);
        input.apply(0);
        assert!(!input.state);
    }
}
