//! Real-time task scheduling abstraction.
//!
//! Long-lived tasks are spawned through a [`Scheduler`] so the choice of
//! real-time plumbing stays in one place. The native implementation spawns
//! OS threads and applies SCHED_FIFO priority and CPU affinity hints; the
//! test implementation captures task bodies so a test can run them on its
//! own thread and advance them explicitly.
//!
//! Priority and affinity are hints: on a machine where the process lacks
//! RT privileges the task still runs, degraded, with a warning.

use std::sync::Mutex;
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{info, warn};

/// Description of a long-lived task.
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec {
    /// Thread name.
    pub name: &'static str,
    /// SCHED_FIFO priority, if the task is real-time.
    pub priority: Option<i32>,
    /// CPU to pin the task to.
    pub affinity: Option<usize>,
}

impl TaskSpec {
    /// An ordinary preemptible task.
    pub const fn soft(name: &'static str) -> Self {
        Self {
            name,
            priority: None,
            affinity: None,
        }
    }

    /// A real-time task at the given priority.
    pub const fn rt(name: &'static str, priority: i32) -> Self {
        Self {
            name,
            priority: Some(priority),
            affinity: None,
        }
    }

    /// Pin the task to a CPU.
    pub const fn pinned(mut self, cpu: usize) -> Self {
        self.affinity = Some(cpu);
        self
    }
}

/// Scheduling error.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("failed to spawn task {name}: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

/// Handle to a spawned task. Supports parking-based suspend/resume and a
/// final join.
pub struct TaskHandle {
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    fn detached() -> Self {
        Self { join: None }
    }

    /// Resume a task parked inside its body.
    pub fn unpark(&self) {
        if let Some(join) = &self.join {
            join.thread().unpark();
        }
    }

    /// Wait for the task to finish.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawner for long-lived tasks.
pub trait Scheduler: Send + Sync {
    fn spawn(
        &self,
        spec: TaskSpec,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<TaskHandle, SchedError>;
}

// ─── Native threads ─────────────────────────────────────────────────

/// Scheduler backed by OS threads with RT hints.
#[derive(Debug, Default)]
pub struct NativeScheduler;

impl Scheduler for NativeScheduler {
    fn spawn(
        &self,
        spec: TaskSpec,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<TaskHandle, SchedError> {
        let join = std::thread::Builder::new()
            .name(spec.name.to_string())
            .spawn(move || {
                apply_rt_hints(&spec);
                body();
            })
            .map_err(|source| SchedError::Spawn {
                name: spec.name,
                source,
            })?;
        Ok(TaskHandle { join: Some(join) })
    }
}

fn apply_rt_hints(spec: &TaskSpec) {
    if let Some(priority) = spec.priority {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: plain syscall on the current thread with a valid param.
        let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if ret != 0 {
            warn!(
                task = spec.name,
                priority,
                error = %std::io::Error::last_os_error(),
                "SCHED_FIFO unavailable, continuing without real-time priority"
            );
        }
    }
    if let Some(cpu) = spec.affinity {
        if let Err(e) = set_affinity(cpu) {
            warn!(task = spec.name, cpu, error = %e, "CPU pinning failed");
        }
    }
}

fn set_affinity(cpu: usize) -> nix::Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Lock all current and future pages. Called once at startup so the step
/// generator never takes a page fault.
pub fn lock_memory() {
    use nix::sys::mman::{mlockall, MlockAllFlags};
    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => info!("memory locked"),
        Err(e) => warn!(error = %e, "mlockall failed, page faults possible in RT path"),
    }
}

// ─── Test scheduler ─────────────────────────────────────────────────

/// Captures task bodies instead of spawning threads.
///
/// A test takes a body by name and runs it on its own terms, which makes
/// time advancement explicit and the whole pipeline single-threaded.
#[derive(Default)]
pub struct TestScheduler {
    tasks: Mutex<Vec<(&'static str, Box<dyn FnOnce() + Send>)>>,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return a captured task body.
    pub fn take(&self, name: &str) -> Option<Box<dyn FnOnce() + Send>> {
        let mut tasks = self.tasks.lock().unwrap();
        let idx = tasks.iter().position(|(n, _)| *n == name)?;
        Some(tasks.remove(idx).1)
    }

    /// Names of tasks spawned so far.
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }
}

impl Scheduler for TestScheduler {
    fn spawn(
        &self,
        spec: TaskSpec,
        body: Box<dyn FnOnce() + Send>,
    ) -> Result<TaskHandle, SchedError> {
        self.tasks.lock().unwrap().push((spec.name, body));
        Ok(TaskHandle::detached())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn native_spawn_runs_body() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = NativeScheduler
            .spawn(
                TaskSpec::soft("probe"),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();
        handle.join();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_scheduler_captures_bodies() {
        let sched = TestScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        sched
            .spawn(
                TaskSpec::rt("stepgen", 50).pinned(3),
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            )
            .unwrap();
        assert_eq!(sched.task_names(), vec!["stepgen"]);
        assert!(!ran.load(Ordering::SeqCst));
        (sched.take("stepgen").unwrap())();
        assert!(ran.load(Ordering::SeqCst));
    }
}
