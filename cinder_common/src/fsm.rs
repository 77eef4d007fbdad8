//! Hierarchical system state machine.
//!
//! Five independent subsystems (CLI, control board, switches, motion,
//! limits) each run a small local state machine and report every local
//! transition here. The aggregator collapses those reports into a single
//! system state under two rules:
//!
//! - **Priority** states (`Init`, `Alarm`, `Fault`) are adopted as soon as
//!   any one subsystem accepts them; the highest wins.
//! - **Consensus** states require every registered subsystem to accept
//!   them. The requested state is tried first; otherwise a unique full
//!   consensus is adopted. Two simultaneous consensuses indicate a broken
//!   acceptance map and are reported without changing state.
//!
//! Each subsystem registers an acceptance map (which of its local states
//! are compatible with each system state) and an optional handler that is
//! invoked synchronously, in registration order, whenever the adopted or
//! requested state changes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Number of system states.
pub const N_SYS_STATES: usize = 8;

/// Number of registered subsystem state machines.
pub const N_SUB_FSM: usize = 5;

/// Sentinel local state meaning "subsystem has not registered yet".
pub const SUB_STATE_UNINIT: u8 = 255;

/// Sentinel for "no state change requested".
const NO_REQUEST: u8 = 254;

/// Top-level system state.
///
/// `Init` cannot be left until every subsystem has registered and reported
/// a non-initial state. `Alarm` and `Fault` are adopted on any single vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemState {
    /// Subsystems still coming up.
    Init = 0,
    /// Low-power state; requires re-homing on exit.
    Sleep = 1,
    /// Ready, motion buffers may be loading.
    Idle = 2,
    /// Homing cycle in progress.
    Homing = 3,
    /// Executing buffered motion.
    Run = 4,
    /// Feed hold; motion decelerated, resumable.
    Hold = 5,
    /// Unsafe condition; requires reset.
    Alarm = 6,
    /// Unrecoverable subsystem failure; requires restart.
    Fault = 7,
}

impl SystemState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Init),
            1 => Some(Self::Sleep),
            2 => Some(Self::Idle),
            3 => Some(Self::Homing),
            4 => Some(Self::Run),
            5 => Some(Self::Hold),
            6 => Some(Self::Alarm),
            7 => Some(Self::Fault),
            _ => None,
        }
    }

    /// Whether a single vote is enough to adopt this state.
    #[inline]
    pub const fn is_priority(self) -> bool {
        matches!(self, Self::Init | Self::Alarm | Self::Fault)
    }

    /// Label used in status reports.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Sleep => "Sleep",
            Self::Idle => "Idle",
            Self::Homing => "Home",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Alarm => "Alarm",
            Self::Fault => "Fault",
        }
    }
}

/// Identifies a subsystem state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubFsm {
    Cli = 0,
    Board = 1,
    Switches = 2,
    Motion = 3,
    Limits = 4,
}

impl SubFsm {
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Notification callback for system state changes.
///
/// Called synchronously from the aggregator, serially, in registration
/// order. Implementations may submit further [`Fsm::update`] calls but must
/// not register or request states from inside the callback.
pub trait StateHandler: Send + Sync {
    fn on_state_change(&self, fsm: &Fsm);
}

/// Acceptance map registered by one subsystem.
pub struct StateMap {
    /// (system state, acceptable local state) pairs.
    pub maps: Vec<(SystemState, u8)>,
    /// Optional notification handler.
    pub handler: Option<Box<dyn StateHandler>>,
}

/// Errors surfaced by FSM operations.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("state update from unregistered subsystem {0:?}")]
    Unregistered(SubFsm),
    #[error("state update queue overflow")]
    QueueOverflow,
    #[error("aggregator stopped")]
    Stopped,
}

enum Msg {
    Update(SubFsm, u8),
    Shutdown,
}

/// The system state aggregator.
///
/// Shared across threads behind an [`Arc`]; the aggregation itself runs on
/// a dedicated thread consuming the update queue.
pub struct Fsm {
    sys_state: AtomicU8,
    req_state: AtomicU8,
    sub_states: [AtomicU8; N_SUB_FSM],
    registry: Mutex<[Option<StateMap>; N_SUB_FSM]>,
    tx: SyncSender<Msg>,
}

impl Fsm {
    /// Create the aggregator and spawn its processing thread.
    pub fn start() -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::sync_channel(N_SUB_FSM * 4);
        let fsm = Arc::new(Self {
            sys_state: AtomicU8::new(SystemState::Init as u8),
            req_state: AtomicU8::new(SystemState::Idle as u8),
            sub_states: Default::default(),
            registry: Mutex::new(Default::default()),
            tx,
        });
        for s in &fsm.sub_states {
            s.store(SUB_STATE_UNINIT, Ordering::Relaxed);
        }
        let worker = fsm.clone();
        let handle = std::thread::Builder::new()
            .name("fsm".into())
            .spawn(move || worker.run(rx))
            .expect("spawn fsm thread");
        (fsm, handle)
    }

    fn run(&self, rx: Receiver<Msg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                Msg::Update(sub, state) => self.apply_update(sub, state),
                Msg::Shutdown => break,
            }
        }
        info!("fsm aggregator stopped");
    }

    /// Current system state.
    #[inline]
    pub fn state(&self) -> SystemState {
        SystemState::from_u8(self.sys_state.load(Ordering::Acquire)).unwrap_or(SystemState::Fault)
    }

    /// Currently requested state, if a request is pending.
    #[inline]
    pub fn requested(&self) -> Option<SystemState> {
        SystemState::from_u8(self.req_state.load(Ordering::Acquire))
    }

    /// Register a subsystem's acceptance map and optional handler.
    ///
    /// The subsystem's local state is reset to its initial value (0).
    pub fn register(&self, sub: SubFsm, map: StateMap) {
        let mut reg = self.registry.lock().expect("fsm registry poisoned");
        reg[sub.index()] = Some(map);
        self.sub_states[sub.index()].store(0, Ordering::Release);
    }

    /// Request the system to move to a new state once consensus allows.
    pub fn request(&self, state: SystemState) {
        if self.req_state.swap(state as u8, Ordering::AcqRel) != state as u8 {
            debug!(state = state.label(), "system state requested");
            let reg = self.registry.lock().expect("fsm registry poisoned");
            self.notify(&reg);
        }
    }

    /// Submit a local state update from a subsystem.
    ///
    /// Updates from subsystems that never registered are dropped. A full
    /// queue is an unrecoverable condition: the fault state is latched
    /// without notification, since a wedged aggregator cannot deliver one.
    pub fn update(&self, sub: SubFsm, state: u8) -> Result<(), FsmError> {
        if self.sub_states[sub.index()].load(Ordering::Acquire) == SUB_STATE_UNINIT {
            warn!(?sub, state, "dropping update from unregistered subsystem");
            return Err(FsmError::Unregistered(sub));
        }
        match self.tx.try_send(Msg::Update(sub, state)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!(?sub, state, "fsm update queue overflow");
                self.sys_state.store(SystemState::Fault as u8, Ordering::Release);
                Err(FsmError::QueueOverflow)
            }
            Err(TrySendError::Disconnected(_)) => Err(FsmError::Stopped),
        }
    }

    /// Stop the aggregator thread.
    pub fn shutdown(&self) {
        let _ = self.tx.try_send(Msg::Shutdown);
    }

    /// Record one subsystem state and re-run the aggregation rules.
    ///
    /// Normally driven by the aggregator thread; exposed so tests can drive
    /// updates deterministically.
    pub fn apply_update(&self, sub: SubFsm, state: u8) {
        self.sub_states[sub.index()].store(state, Ordering::Release);

        let all_initialized = self
            .sub_states
            .iter()
            .all(|s| s.load(Ordering::Acquire) != SUB_STATE_UNINIT);

        let reg = self.registry.lock().expect("fsm registry poisoned");
        if !all_initialized {
            // Any uninitialized subsystem pins the system in Init.
            self.adopt(SystemState::Init, &reg);
            return;
        }

        // Per system state, a bitmap of subsystems accepting it.
        let mut votes = [0u8; N_SYS_STATES];
        for f in 0..N_SUB_FSM {
            let local = self.sub_states[f].load(Ordering::Acquire);
            if let Some(map) = &reg[f] {
                for (sys, sub_state) in &map.maps {
                    if *sub_state == local {
                        votes[*sys as usize] |= 1 << f;
                    }
                }
            }
        }
        let full_mask = (1u8 << N_SUB_FSM) - 1;

        // Priority states need a single vote; the highest match wins.
        let mut priority = None;
        for s in 0..N_SYS_STATES {
            let state = SystemState::from_u8(s as u8).unwrap();
            if votes[s] != 0 && state.is_priority() {
                priority = Some(state);
            }
        }
        if let Some(state) = priority {
            debug!(state = state.label(), "priority state adopted");
            self.adopt(state, &reg);
            return;
        }

        // The requested state takes precedence among full consensuses.
        if let Some(req) = self.requested() {
            if votes[req as usize] == full_mask {
                debug!(state = req.label(), "requested state reached consensus");
                self.adopt(req, &reg);
                return;
            }
        }

        let mut consensus = None;
        let mut matches = 0;
        for s in 0..N_SYS_STATES {
            if votes[s] == full_mask {
                consensus = SystemState::from_u8(s as u8);
                matches += 1;
            }
        }
        match matches {
            0 => {} // No agreement; hold the current state.
            1 => self.adopt(consensus.unwrap(), &reg),
            _ => {
                // Two acceptance maps overlap in a way they should not.
                error!("conflicting state consensus");
                for s in 0..N_SYS_STATES {
                    if votes[s] == full_mask {
                        error!(state = SystemState::from_u8(s as u8).unwrap().label(),
                               "consensus candidate");
                    }
                }
            }
        }
    }

    fn adopt(&self, state: SystemState, reg: &[Option<StateMap>; N_SUB_FSM]) {
        let prev = self.sys_state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            info!(
                from = SystemState::from_u8(prev).map(|s| s.label()).unwrap_or("?"),
                to = state.label(),
                "system state changed"
            );
            if self.req_state.load(Ordering::Acquire) == state as u8 {
                self.req_state.store(NO_REQUEST, Ordering::Release);
            }
            self.notify(reg);
        }
    }

    fn notify(&self, reg: &[Option<StateMap>; N_SUB_FSM]) {
        for entry in reg.iter().flatten() {
            if let Some(handler) = &entry.handler {
                handler.on_state_change(self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // A minimal pair of local states shared by the test subsystems.
    const LOCAL_INIT: u8 = 0;
    const LOCAL_OK: u8 = 1;
    const LOCAL_RUN: u8 = 2;
    const LOCAL_ALARM: u8 = 3;

    fn everything_map() -> StateMap {
        StateMap {
            maps: vec![
                (SystemState::Init, LOCAL_INIT),
                (SystemState::Idle, LOCAL_OK),
                (SystemState::Run, LOCAL_RUN),
                (SystemState::Alarm, LOCAL_ALARM),
            ],
            handler: None,
        }
    }

    fn all_subs() -> [SubFsm; N_SUB_FSM] {
        [
            SubFsm::Cli,
            SubFsm::Board,
            SubFsm::Switches,
            SubFsm::Motion,
            SubFsm::Limits,
        ]
    }

    fn started() -> Arc<Fsm> {
        let (fsm, _handle) = Fsm::start();
        fsm
    }

    #[test]
    fn stays_in_init_until_all_registered() {
        let fsm = started();
        fsm.register(SubFsm::Cli, everything_map());
        fsm.apply_update(SubFsm::Cli, LOCAL_OK);
        assert_eq!(fsm.state(), SystemState::Init);
    }

    #[test]
    fn requested_consensus_is_adopted_and_request_cleared() {
        let fsm = started();
        for sub in all_subs() {
            fsm.register(sub, everything_map());
        }
        fsm.request(SystemState::Idle);
        for sub in all_subs() {
            fsm.apply_update(sub, LOCAL_OK);
        }
        assert_eq!(fsm.state(), SystemState::Idle);
        assert_eq!(fsm.requested(), None);
    }

    #[test]
    fn single_alarm_vote_wins() {
        let fsm = started();
        for sub in all_subs() {
            fsm.register(sub, everything_map());
        }
        for sub in all_subs() {
            fsm.apply_update(sub, LOCAL_OK);
        }
        assert_eq!(fsm.state(), SystemState::Idle);

        fsm.apply_update(SubFsm::Limits, LOCAL_ALARM);
        assert_eq!(fsm.state(), SystemState::Alarm);
    }

    #[test]
    fn run_requires_every_subsystem() {
        let fsm = started();
        for sub in all_subs() {
            fsm.register(sub, everything_map());
        }
        fsm.request(SystemState::Run);
        // Four of five accept Run; no transition.
        for sub in &all_subs()[..4] {
            fsm.apply_update(*sub, LOCAL_RUN);
        }
        assert_ne!(fsm.state(), SystemState::Run);
        // The fifth closes the consensus.
        fsm.apply_update(SubFsm::Limits, LOCAL_RUN);
        assert_eq!(fsm.state(), SystemState::Run);
    }

    #[test]
    fn ambiguous_consensus_holds_current_state() {
        let fsm = started();
        // A map where one local state accepts two system states builds a
        // double consensus.
        for sub in all_subs() {
            fsm.register(
                sub,
                StateMap {
                    maps: vec![
                        (SystemState::Idle, LOCAL_OK),
                        (SystemState::Sleep, LOCAL_OK),
                    ],
                    handler: None,
                },
            );
        }
        for sub in all_subs() {
            fsm.apply_update(sub, LOCAL_OK);
        }
        // Neither Idle nor Sleep may be picked silently.
        assert_eq!(fsm.state(), SystemState::Init);
    }

    #[test]
    fn unregistered_update_is_dropped() {
        let fsm = started();
        assert!(matches!(
            fsm.update(SubFsm::Motion, LOCAL_OK),
            Err(FsmError::Unregistered(SubFsm::Motion))
        ));
    }

    #[test]
    fn handlers_called_in_registration_order() {
        let fsm = started();
        static ORDER: AtomicUsize = AtomicUsize::new(0);

        struct Recorder {
            slot: usize,
            seen: Arc<Mutex<Vec<usize>>>,
        }
        impl StateHandler for Recorder {
            fn on_state_change(&self, _fsm: &Fsm) {
                ORDER.fetch_add(1, Ordering::SeqCst);
                self.seen.lock().unwrap().push(self.slot);
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        for (i, sub) in all_subs().into_iter().enumerate() {
            let mut map = everything_map();
            map.handler = Some(Box::new(Recorder {
                slot: i,
                seen: seen.clone(),
            }));
            fsm.register(sub, map);
        }
        for sub in all_subs() {
            fsm.apply_update(sub, LOCAL_OK);
        }
        let seen = seen.lock().unwrap();
        // The Idle adoption notified all five in order.
        let tail = &seen[seen.len() - N_SUB_FSM..];
        assert_eq!(tail, &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn state_labels_are_distinct() {
        let mut labels = std::collections::HashSet::new();
        for s in 0..N_SYS_STATES {
            labels.insert(SystemState::from_u8(s as u8).unwrap().label());
        }
        assert_eq!(labels.len(), N_SYS_STATES);
    }
}
