//! Console transport: stdin lines in, stdout lines out.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tracing::info;

use cinder_common::sched::{Scheduler, TaskHandle, TaskSpec};

use crate::cli::CliContext;
use crate::messages::LineWriter;
use crate::HalResult;

/// Writes responses to stdout.
pub struct ConsoleWriter;

impl LineWriter for ConsoleWriter {
    fn write_line(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

/// Spawn the stdin reader task.
pub fn console_init(scheduler: &dyn Scheduler, ctx: Arc<CliContext>) -> HalResult<TaskHandle> {
    let handle = scheduler.spawn(
        TaskSpec::soft("console"),
        Box::new(move || {
            let stdin = std::io::stdin().lock();
            for line in stdin.lines() {
                match line {
                    Ok(line) => ctx.process_line(&line),
                    Err(_) => break,
                }
            }
            info!("console reader stopped");
        }),
    )?;
    Ok(handle)
}
