//! TCP socket transport: one client at a time, line-oriented both ways.
//!
//! Output produced while no client is connected is buffered and flushed
//! to the next client, so the welcome banner and late status reports are
//! not lost between connections.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use cinder_common::sched::{Scheduler, TaskHandle, TaskSpec};

use crate::cli::CliContext;
use crate::messages::LineWriter;
use crate::HalResult;

/// Lines buffered while no client is connected.
const TX_BUFFER_LINES: usize = 128;

struct SocketInner {
    stream: Option<TcpStream>,
    pending: VecDeque<String>,
}

/// Writes responses to the connected client, buffering when there is
/// none.
pub struct SocketWriter {
    inner: Mutex<SocketInner>,
}

impl SocketWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SocketInner {
                stream: None,
                pending: VecDeque::new(),
            }),
        })
    }

    fn attach(&self, stream: TcpStream) {
        let mut inner = self.inner.lock().expect("socket writer poisoned");
        // Dump anything that queued up while disconnected.
        while let Some(line) = inner.pending.pop_front() {
            let _ = write_framed(&stream, &line);
        }
        inner.stream = Some(stream);
    }

    fn detach(&self) {
        self.inner.lock().expect("socket writer poisoned").stream = None;
    }
}

fn write_framed(mut stream: &TcpStream, line: &str) -> std::io::Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n\r")
}

impl LineWriter for SocketWriter {
    fn write_line(&self, line: &str) {
        let mut inner = self.inner.lock().expect("socket writer poisoned");
        match &inner.stream {
            Some(stream) => {
                if write_framed(stream, line).is_err() {
                    inner.stream = None;
                }
            }
            None => {
                if inner.pending.len() == TX_BUFFER_LINES {
                    inner.pending.pop_front();
                }
                inner.pending.push_back(line.to_string());
            }
        }
    }
}

/// Bind the listener and spawn the accept/read task.
pub fn socket_init(
    scheduler: &dyn Scheduler,
    ctx: Arc<CliContext>,
    writer: Arc<SocketWriter>,
    ip: Ipv4Addr,
    port: u16,
) -> HalResult<TaskHandle> {
    let listener = TcpListener::bind(SocketAddrV4::new(ip, port))
        .map_err(crate::StartupError::SocketBind)?;
    info!(%ip, port, "listening");

    let handle = scheduler.spawn(
        TaskSpec::soft("socket"),
        Box::new(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let peer = stream.peer_addr().ok();
                info!(?peer, "client connected");

                let reader = match stream.try_clone() {
                    Ok(r) => BufReader::new(r),
                    Err(e) => {
                        warn!(error = %e, "stream clone failed");
                        continue;
                    }
                };
                writer.attach(stream);

                for line in reader.lines() {
                    match line {
                        Ok(line) => ctx.process_line(&line),
                        Err(_) => break,
                    }
                }
                writer.detach();
                info!(?peer, "client disconnected");
            }
        }),
    )?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_lines_until_a_client_attaches() {
        let writer = SocketWriter::new();
        writer.write_line("banner");
        writer.write_line("ok");
        let inner = writer.inner.lock().unwrap();
        assert_eq!(inner.pending.len(), 2);
        assert_eq!(inner.pending[0], "banner");
    }

    #[test]
    fn buffer_is_bounded() {
        let writer = SocketWriter::new();
        for i in 0..(TX_BUFFER_LINES + 10) {
            writer.write_line(&format!("line{i}"));
        }
        let inner = writer.inner.lock().unwrap();
        assert_eq!(inner.pending.len(), TX_BUFFER_LINES);
        // The oldest lines were dropped.
        assert_eq!(inner.pending[0], "line10");
    }
}
