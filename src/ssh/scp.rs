// ABOUTME: SCP upload (sender side of `scp -t`).
// ABOUTME: Writes control line, payload and NUL from a separate task while the remote scp runs.

use super::client::Session;
use super::error::{Error, Result};
use super::exec::exec_refused;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// File mode used when the caller has no preference.
pub const DEFAULT_MODE: u32 = 0o644;

/// `C<mode> <size> <name>\n`
pub(crate) fn control_line(mode: u32, size: u64, name: &str) -> String {
    format!("C{:04o} {} {}\n", mode & 0o7777, size, name)
}

/// Remote invocation for receiving into `target`.
pub(crate) fn remote_command(target: &str) -> String {
    format!("scp -tr {}", shell_quote(target))
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-+:@%,~".contains(&b));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

fn base_name(target: &str) -> Result<String> {
    Path::new(target)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Transfer(format!("target has no file name: {:?}", target)))
}

/// Aborts the writer if the transfer is abandoned.
struct WriterTask(JoinHandle<Result<()>>);

impl Drop for WriterTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) async fn upload<R>(
    session: Session,
    source: R,
    size: u64,
    target: &str,
    mode: u32,
    timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (mut channel, connection) = session.into_parts();
    let result = match base_name(target) {
        Ok(name) => {
            let transfer = transfer(&mut channel, source, size, target, name, mode);
            match tokio::time::timeout(timeout, transfer).await {
                Ok(result) => result,
                Err(_) => Err(Error::CommandTimeout(timeout)),
            }
        }
        Err(e) => Err(e),
    };
    let _ = channel.close().await;
    connection.close().await;
    result
}

async fn transfer<R>(
    channel: &mut Channel<Msg>,
    source: R,
    size: u64,
    target: &str,
    name: String,
    mode: u32,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let writer = channel.make_writer();
    channel
        .exec(true, remote_command(target))
        .await
        .map_err(|e| Error::SessionSetup(format!("failed to start scp: {}", e)))?;
    tracing::debug!("uploading {} bytes to {}", size, target);

    let mut writer_task = WriterTask(tokio::spawn(send_file(writer, source, size, name, mode)));
    let mut written: Option<Result<()>> = None;
    let mut remote = RemoteScp::default();

    loop {
        let mut writer_finished = false;
        let mut remote_finished = false;

        tokio::select! {
            res = &mut writer_task.0, if written.is_none() => {
                written = Some(res.unwrap_or_else(|e| {
                    Err(Error::Transfer(format!("writer task failed: {}", e)))
                }));
                writer_finished = true;
            }
            // A refused exec returns here; dropping the guard stops the writer.
            msg = channel.wait() => remote_finished = remote.observe(msg)?,
        }

        if writer_finished {
            let _ = channel.eof().await;
        }
        if remote_finished {
            break;
        }
    }

    let remote = remote.finish();

    let written = match written {
        Some(result) => result,
        // A successful remote scp has consumed the whole payload.
        None if remote.is_ok() => (&mut writer_task.0).await.unwrap_or_else(|e| {
            Err(Error::Transfer(format!("writer task failed: {}", e)))
        }),
        // The remote side already failed; dropping the guard stops the writer.
        None => Ok(()),
    };

    written.and(remote)
}

/// What the remote `scp -t` has reported so far.
#[derive(Debug, Default)]
struct RemoteScp {
    accepted: bool,
    exit: Option<u32>,
    got_eof: bool,
    diagnostics: Vec<u8>,
}

impl RemoteScp {
    /// Record one channel message. Returns `Ok(true)` once the remote side is done.
    fn observe(&mut self, msg: Option<ChannelMsg>) -> Result<bool> {
        match msg {
            Some(ChannelMsg::Success) => self.accepted = true,
            Some(ChannelMsg::Failure) if !self.accepted => return Err(exec_refused()),
            Some(ChannelMsg::Data { data }) => {
                self.accepted = true;
                // scp acks are 0, 1 or 2; anything else is message text.
                self.diagnostics.extend(data.iter().filter(|b| **b > 2));
            }
            Some(ChannelMsg::ExtendedData { data, .. }) => {
                self.accepted = true;
                self.diagnostics.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.accepted = true;
                self.exit = Some(exit_status);
                return Ok(self.got_eof);
            }
            Some(ChannelMsg::Eof) => {
                self.got_eof = true;
                return Ok(self.exit.is_some());
            }
            Some(ChannelMsg::Close) | None => return Ok(true),
            Some(_) => {}
        }
        Ok(false)
    }

    fn finish(self) -> Result<()> {
        match self.exit {
            Some(0) => Ok(()),
            Some(code) => Err(Error::Transfer(format!(
                "remote scp exited with status {}: {}",
                code,
                String::from_utf8_lossy(&self.diagnostics).trim()
            ))),
            None => Err(Error::ChannelClosed),
        }
    }
}

async fn send_file<W, R>(writer: W, source: R, size: u64, name: String, mode: u32) -> Result<()>
where
    W: AsyncWrite + Send,
    R: AsyncRead + Unpin,
{
    let mut writer = Box::pin(writer);
    let write_err = |e: std::io::Error| Error::Transfer(format!("write to remote failed: {}", e));

    writer
        .write_all(control_line(mode, size, &name).as_bytes())
        .await
        .map_err(write_err)?;

    if size > 0 {
        let copied = tokio::io::copy(&mut source.take(size), &mut writer)
            .await
            .map_err(|e| Error::Transfer(format!("copy failed: {}", e)))?;
        if copied < size {
            return Err(Error::Transfer(format!(
                "source ended after {} of {} bytes",
                copied, size
            )));
        }
    }

    writer.write_all(b"\0").await.map_err(write_err)?;
    writer.flush().await.map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_line_format() {
        assert_eq!(control_line(0o644, 15, "a.txt"), "C0644 15 a.txt\n");
        assert_eq!(control_line(0o100755, 0, "run.sh"), "C0755 0 run.sh\n");
    }

    #[test]
    fn remote_command_uses_full_target_path() {
        assert_eq!(remote_command("/tmp/target.csv"), "scp -tr /tmp/target.csv");
        assert_eq!(remote_command("my file.txt"), "scp -tr 'my file.txt'");
        assert_eq!(remote_command("it's"), r"scp -tr 'it'\''s'");
    }

    #[test]
    fn base_name_of_target() {
        assert_eq!(base_name("/home/user/foo.txt").unwrap(), "foo.txt");
        assert_eq!(base_name("foo.txt").unwrap(), "foo.txt");
        assert_eq!(base_name("dir/").unwrap(), "dir");
        assert!(base_name("/").is_err());
        assert!(base_name("").is_err());
    }

    async fn sent(payload: &'static [u8], size: u64) -> (Result<()>, Vec<u8>) {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let result = send_file(writer, payload, size, "a.txt".to_string(), DEFAULT_MODE).await;
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        (result, received)
    }

    #[tokio::test]
    async fn sends_header_payload_and_terminator() {
        let (result, received) = sent(b"Example Text...", 15).await;
        assert!(result.is_ok());
        assert_eq!(received, b"C0644 15 a.txt\nExample Text...\0");
    }

    #[tokio::test]
    async fn empty_payload_sends_only_header_and_terminator() {
        let (result, received) = sent(b"", 0).await;
        assert!(result.is_ok());
        assert_eq!(received, b"C0644 0 a.txt\n\0");
    }

    #[tokio::test]
    async fn stops_at_declared_size() {
        let (result, received) = sent(b"abcdef", 3).await;
        assert!(result.is_ok());
        assert_eq!(received, b"C0644 3 a.txt\nabc\0");
    }

    #[tokio::test]
    async fn short_source_is_a_transfer_error() {
        let (result, _) = sent(b"abc", 10).await;
        assert!(matches!(result, Err(Error::Transfer(_))));
    }

    fn replay(script: Vec<ChannelMsg>) -> Result<()> {
        let mut remote = RemoteScp::default();
        for msg in script.into_iter().map(Some).chain(std::iter::once(None)) {
            if remote.observe(msg)? {
                break;
            }
        }
        remote.finish()
    }

    #[test]
    fn refused_scp_exec_is_a_setup_failure() {
        let result = replay(vec![ChannelMsg::Failure, ChannelMsg::Eof]);
        assert!(matches!(result, Err(Error::SessionSetup(_))), "got {:?}", result);
    }

    #[test]
    fn remote_exit_zero_after_eof_succeeds() {
        let result = replay(vec![
            ChannelMsg::Success,
            ChannelMsg::Eof,
            ChannelMsg::ExitStatus { exit_status: 0 },
        ]);
        assert!(result.is_ok(), "got {:?}", result);
    }

    #[test]
    fn remote_exit_failure_is_a_transfer_error() {
        let result = replay(vec![
            ChannelMsg::Success,
            ChannelMsg::ExitStatus { exit_status: 1 },
            ChannelMsg::Eof,
        ]);
        assert!(matches!(result, Err(Error::Transfer(_))), "got {:?}", result);
    }

    #[test]
    fn close_without_status_is_channel_closed() {
        let result = replay(vec![ChannelMsg::Success, ChannelMsg::Close]);
        assert!(matches!(result, Err(Error::ChannelClosed)), "got {:?}", result);
    }
}
