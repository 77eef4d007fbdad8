//! Cinder CNC controller.
//!
//! Startup order follows the dependency chain: state machine aggregator,
//! motion pipeline, CLI transport, then hardware. Once everything
//! reports in, the welcome banner goes out and the process idles until a
//! termination signal unwinds the subsystems in reverse.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cinder_common::fsm::{Fsm, SubFsm};
use cinder_common::sched::{self, NativeScheduler, Scheduler, TaskSpec};
use cinder_common::settings::{CommMode, Settings, SettingsError};
use cinder_hal::board::{pulse_device_present, register_board, state_poll_loop, Board, BoardState};
use cinder_hal::limits::{Limits, LIMIT_DEVICE};
use cinder_hal::step_drv::step_drv_init;
use cinder_hal::switches::{Switches, SWITCH_DEVICE};
use cinder_hal::HalError;
use cinder_motion::pipeline::MotionPipeline;
use cinder_motion::stepgen::PulseSink;

mod cli;
mod console;
mod messages;
mod socket;

use cli::{register_cli, CliContext};
use console::{console_init, ConsoleWriter};
use messages::{LineWriter, Messages};
use socket::{socket_init, SocketWriter};

/// Fatal startup error.
#[derive(Debug)]
pub enum StartupError {
    Settings(SettingsError),
    SocketBind(std::io::Error),
    Sched(cinder_common::sched::SchedError),
    Hal(HalError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Settings(e) => write!(f, "settings: {e}"),
            Self::SocketBind(e) => write!(f, "socket bind: {e}"),
            Self::Sched(e) => write!(f, "scheduler: {e}"),
            Self::Hal(e) => write!(f, "hardware: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<SettingsError> for StartupError {
    fn from(e: SettingsError) -> Self {
        Self::Settings(e)
    }
}
impl From<cinder_common::sched::SchedError> for StartupError {
    fn from(e: cinder_common::sched::SchedError) -> Self {
        Self::Sched(e)
    }
}
impl From<HalError> for StartupError {
    fn from(e: HalError) -> Self {
        Self::Hal(e)
    }
}

pub type HalResult<T> = Result<T, StartupError>;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "cinder", about = "Cinder CNC controller")]
struct Args {
    /// Produce verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Listen on a TCP socket instead of the console.
    #[arg(short, long)]
    socket: bool,

    /// IP address to listen on.
    #[arg(short = 'i', long, default_value = "127.0.0.1")]
    listen_ip: Ipv4Addr,

    /// IP port to listen on.
    #[arg(short = 'p', long, default_value_t = 51401)]
    listen_port: u16,

    /// Optional settings overlay file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

/// Discards pulse bytes when no pulse hardware exists.
#[derive(Default)]
struct DiscardSink;

impl PulseSink for DiscardSink {
    fn open(&mut self) -> std::io::Result<()> {
        Ok(())
    }
    fn close(&mut self) {}
    fn write(&mut self, _byte: u8) -> std::io::Result<()> {
        Ok(())
    }
    fn flush(&mut self) {}
    fn start_stream(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(args) {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> HalResult<()> {
    // Keep the step generator free of page faults.
    sched::lock_memory();

    let mut settings = Settings::load(args.config.as_deref())?;
    settings.cli.comm_mode = if args.socket {
        CommMode::Socket
    } else {
        CommMode::Console
    };
    settings.cli.listen_ip = args.listen_ip;
    settings.cli.listen_port = args.listen_port;
    let settings = Arc::new(settings);

    let (fsm, fsm_task) = Fsm::start();
    let scheduler = NativeScheduler;

    // A missing pulse device means a development machine: motion still
    // runs, pulses are discarded, no event devices are opened.
    let board = Board::system_default();
    let hardware = pulse_device_present(&board);
    if !hardware {
        warn!("pulse device not found, running without hardware");
    }

    // CLI transport and message formatting.
    let socket_writer = SocketWriter::new();
    let writer: Arc<dyn LineWriter> = match settings.cli.comm_mode {
        CommMode::Socket => socket_writer.clone(),
        CommMode::Console => Arc::new(ConsoleWriter),
    };
    let messages = Messages::new(writer, settings.cli.report_inches, settings.steps_per_mm);

    // Motion pipeline with per-line status reporting over the CLI.
    let sink: Box<dyn PulseSink> = if hardware {
        Box::new(board.pulse_sink())
    } else {
        Box::new(DiscardSink)
    };
    let report_messages = messages.clone();
    let feedback_messages = messages.clone();
    let pipeline = MotionPipeline::start(
        settings.clone(),
        fsm.clone(),
        &scheduler,
        sink,
        Box::new(move |result| report_messages.status(result)),
        Box::new(move |text| feedback_messages.feedback(text)),
    )?;

    // CLI reader.
    let ctx = Arc::new(CliContext {
        fsm: fsm.clone(),
        pipeline: pipeline.clone(),
        messages: messages.clone(),
    });
    register_cli(&fsm);
    let _reader_task = match settings.cli.comm_mode {
        CommMode::Console => console_init(&scheduler, ctx)?,
        CommMode::Socket => socket_init(
            &scheduler,
            ctx,
            socket_writer,
            settings.cli.listen_ip,
            settings.cli.listen_port,
        )?,
    };

    // Hardware: board, stepper drivers, input watchers.
    register_board(&fsm, &board);
    let watcher_shutdown = Arc::new(AtomicBool::new(false));
    let switches = Switches::new(fsm.clone(), SWITCH_DEVICE);
    let limits = Limits::new(fsm.clone(), LIMIT_DEVICE);
    if hardware {
        board.bring_up()?;
        step_drv_init(&board)?;

        let poll_board = board.clone();
        let poll_fsm = fsm.clone();
        let poll_shutdown = watcher_shutdown.clone();
        scheduler.spawn(
            TaskSpec::rt("board-state", 50),
            Box::new(move || state_poll_loop(poll_board, poll_fsm, poll_shutdown)),
        )?;

        switches.init(true)?;
        let sw = switches.clone();
        let sw_shutdown = watcher_shutdown.clone();
        scheduler.spawn(
            TaskSpec::rt("switches", cinder_common::consts::EVENT_WATCH_PRIORITY),
            Box::new(move || sw.event_loop(sw_shutdown)),
        )?;

        limits.init(true)?;
        let lim = limits.clone();
        let lim_shutdown = watcher_shutdown.clone();
        scheduler.spawn(
            TaskSpec::rt("limits", cinder_common::consts::EVENT_WATCH_PRIORITY),
            Box::new(move || lim.event_loop(lim_shutdown)),
        )?;
    } else {
        let _ = fsm.update(SubFsm::Board, BoardState::Idle as u8);
        switches.init(false)?;
        limits.init(false)?;
    }

    // Everything is up.
    messages.banner();
    info!("system initialized");

    unsafe {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let action = SigAction::new(
            SigHandler::Handler(handle_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }

    while !SHUTDOWN.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    graceful_shutdown(&fsm, &pipeline, &board, hardware, &watcher_shutdown);
    let _ = fsm_task.join();
    Ok(())
}

/// Unwind in reverse dependency order: readers die with the process,
/// then hardware, motion, and finally the state machine.
fn graceful_shutdown(
    fsm: &Arc<Fsm>,
    pipeline: &Arc<MotionPipeline>,
    board: &Board,
    hardware: bool,
    watcher_shutdown: &Arc<AtomicBool>,
) {
    watcher_shutdown.store(true, Ordering::Release);
    pipeline.shutdown();
    if hardware {
        board.shut_down();
    }
    fsm.shutdown();
}
