// ABOUTME: Streaming remote command execution with a hard timeout.
// ABOUTME: Pump, two line readers and a supervisor task; all channels close exactly once.

use super::client::{Connection, Session};
use super::error::{Error, Result};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

const PIPE_CAPACITY: usize = 64 * 1024;
const LINE_BUFFER: usize = 256;

/// Live output of a running command.
///
/// Keep receiving from `stdout` and `stderr` until both are closed before trusting `done`
/// and `error`; the terminal signals may arrive ahead of the last lines.
#[derive(Debug)]
pub struct ExecStream {
    pub stdout: mpsc::Receiver<String>,
    pub stderr: mpsc::Receiver<String>,
    /// `true` if the command finished, `false` if the timeout fired first.
    pub done: oneshot::Receiver<bool>,
    /// The command's own result, or `Error::CommandTimeout`.
    pub error: oneshot::Receiver<Result<()>>,
}

/// How a command ended.
#[derive(Debug)]
pub enum Outcome {
    Success,
    Failed(Error),
    TimedOut,
}

/// Collected output of a finished command. Every line ends with `\n`.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub outcome: Outcome,
}

impl RunOutput {
    /// The command ran to completion, successfully or not.
    pub fn completed(&self) -> bool {
        !matches!(self.outcome, Outcome::TimedOut)
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    /// The command's own failure. `None` on success and on timeout.
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<u32> {
        match &self.outcome {
            Outcome::Success => Some(0),
            Outcome::Failed(Error::ExitStatus(code)) => Some(*code),
            _ => None,
        }
    }
}

impl ExecStream {
    /// Drain every channel and assemble the output.
    pub async fn collect(mut self) -> RunOutput {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut result = None;
        let mut completed = None;

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut error_open = true;
        let mut done_open = true;

        loop {
            tokio::select! {
                line = self.stdout.recv(), if stdout_open => match line {
                    Some(line) => push_line(&mut stdout, &line),
                    None => stdout_open = false,
                },
                line = self.stderr.recv(), if stderr_open => match line {
                    Some(line) => push_line(&mut stderr, &line),
                    None => stderr_open = false,
                },
                res = &mut self.error, if error_open => {
                    error_open = false;
                    result = res.ok();
                }
                res = &mut self.done, if done_open => {
                    done_open = false;
                    completed = res.ok();
                }
                else => break,
            }
        }

        let outcome = match (completed, result) {
            (Some(false), Some(Err(e))) => {
                push_line(&mut stderr, &e.to_string());
                Outcome::TimedOut
            }
            (Some(false), _) => Outcome::TimedOut,
            (_, Some(Ok(()))) => Outcome::Success,
            (_, Some(Err(e))) => Outcome::Failed(e),
            (_, None) => Outcome::Failed(Error::ChannelClosed),
        };

        RunOutput {
            stdout,
            stderr,
            outcome,
        }
    }
}

fn push_line(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
}

pub(crate) async fn start(session: Session, command: &str, timeout: Duration) -> Result<ExecStream> {
    let (channel, connection) = session.into_parts();

    if let Err(e) = channel.exec(true, command).await {
        let _ = channel.close().await;
        connection.close().await;
        return Err(Error::SessionSetup(format!("failed to exec command: {}", e)));
    }
    tracing::debug!("started remote command: {}", command);

    let (stdout_tx, stdout_rx) = mpsc::channel(LINE_BUFFER);
    let (stderr_tx, stderr_rx) = mpsc::channel(LINE_BUFFER);
    let (done_tx, done_rx) = oneshot::channel();
    let (error_tx, error_rx) = oneshot::channel();

    let (stdout_pipe, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_pipe, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);

    let pump = tokio::spawn(pump(channel, stdout_pipe, stderr_pipe));
    let stdout_lines = tokio::spawn(read_lines(stdout_reader, stdout_tx));
    let stderr_lines = tokio::spawn(read_lines(stderr_reader, stderr_tx));

    tokio::spawn(supervise(
        Tasks {
            pump,
            stdout_lines,
            stderr_lines,
        },
        connection,
        timeout,
        done_tx,
        error_tx,
    ));

    Ok(ExecStream {
        stdout: stdout_rx,
        stderr: stderr_rx,
        done: done_rx,
        error: error_rx,
    })
}

struct Tasks {
    pump: tokio::task::JoinHandle<Result<()>>,
    stdout_lines: tokio::task::JoinHandle<()>,
    stderr_lines: tokio::task::JoinHandle<()>,
}

/// Join the readers and the pump, or give up when the timer fires. Sole owner of the
/// terminal senders and of the connection.
async fn supervise(
    tasks: Tasks,
    connection: Connection,
    timeout: Duration,
    done_tx: oneshot::Sender<bool>,
    error_tx: oneshot::Sender<Result<()>>,
) {
    let aborts = [
        tasks.pump.abort_handle(),
        tasks.stdout_lines.abort_handle(),
        tasks.stderr_lines.abort_handle(),
    ];

    let finished = async move {
        let _ = tokio::join!(tasks.stdout_lines, tasks.stderr_lines);
        match tasks.pump.await {
            Ok(result) => result,
            Err(e) => Err(Error::SessionSetup(format!("output pump failed: {}", e))),
        }
    };

    tokio::select! {
        result = finished => {
            let _ = error_tx.send(result);
            let _ = done_tx.send(true);
        }
        _ = tokio::time::sleep(timeout) => {
            tracing::debug!("remote command timed out after {:?}", timeout);
            for task in &aborts {
                task.abort();
            }
            let _ = error_tx.send(Err(Error::CommandTimeout(timeout)));
            let _ = done_tx.send(false);
        }
    }

    connection.close().await;
}

/// Ordered stream of messages arriving on a command channel.
pub(crate) trait ChannelEvents: Send {
    fn next_event(&mut self) -> impl Future<Output = Option<ChannelMsg>> + Send;
}

impl ChannelEvents for Channel<Msg> {
    fn next_event(&mut self) -> impl Future<Output = Option<ChannelMsg>> + Send {
        self.wait()
    }
}

pub(crate) fn exec_refused() -> Error {
    Error::SessionSetup("exec request refused".to_string())
}

/// Forward channel output into the two pipes and report how the command ended.
///
/// A `Failure` reply before the command produced anything means the server refused the
/// exec request; sshd keeps the channel open in that case, so it is reported right away.
async fn pump<C: ChannelEvents>(
    mut channel: C,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
) -> Result<()> {
    let mut exit = None;
    let mut got_eof = false;
    let mut accepted = false;

    loop {
        match channel.next_event().await {
            Some(ChannelMsg::Success) => accepted = true,
            Some(ChannelMsg::Failure) if !accepted => return Err(exec_refused()),
            Some(ChannelMsg::Data { data }) => {
                accepted = true;
                // A reader that went away must not stall the channel.
                let _ = stdout.write_all(&data).await;
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                accepted = true;
                if ext == 1 {
                    let _ = stderr.write_all(&data).await;
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                accepted = true;
                exit = Some(if exit_status == 0 {
                    Ok(())
                } else {
                    Err(Error::ExitStatus(exit_status))
                });
                if got_eof {
                    break;
                }
            }
            Some(ChannelMsg::ExitSignal {
                signal_name,
                error_message,
                ..
            }) => {
                accepted = true;
                exit = Some(Err(Error::ExitSignal {
                    signal: format!("{:?}", signal_name),
                    message: error_message,
                }));
                if got_eof {
                    break;
                }
            }
            Some(ChannelMsg::Eof) => {
                got_eof = true;
                if exit.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) => break,
            Some(_) => {}
            None => break,
        }
    }

    exit.unwrap_or(Err(Error::ChannelClosed))
}

/// Split a pipe into lines. Trailing `\n` and `\r\n` are stripped; invalid UTF-8 is replaced.
async fn read_lines(pipe: DuplexStream, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                    if buf.ends_with(b"\r") {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("output pipe read error: {}", e);
                break;
            }
        }
    }
}
