//! SSH transport — the production [`DeviceConnector`] / [`DeviceSession`].
//!
//! One [`RemoteSession`] owns exactly one authenticated connection. Every
//! command gets its own exec channel with an explicit deadline; deadline
//! expiry always sends a kill signal to the remote process before the error
//! is returned.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect, Sig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::discovery::probe;
use crate::error::Error;
use crate::install::{
    DeviceConnector, DeviceSession, DialError, Reporter, SSH_USER, transfer,
};

const SSH_PORT: u16 = 22;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to keep draining in-flight output after a streaming command is
/// killed at its deadline.
const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(5);

struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Factory-fresh devices regenerate host keys on every reimage, so
        // pinning would reject every legitimate unit.
        Ok(true)
    }
}

/// Production connector: SSH password authentication plus the local ARP
/// probe for the pre-connect identity gate.
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConnector for SshConnector {
    type Session = RemoteSession;

    async fn dial(&self, ip: &str, password: &str) -> Result<RemoteSession, DialError> {
        let config = Arc::new(client::Config::default());
        let connect = client::connect(config, (ip, SSH_PORT), ClientHandler);
        let mut handle = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| DialError::Network(format!("connection to {ip} timed out")))?
            .map_err(|e| DialError::Network(e.to_string()))?;

        let authenticated = handle
            .authenticate_password(SSH_USER, password)
            .await
            .map_err(|e| DialError::Network(e.to_string()))?;
        if !authenticated {
            return Err(DialError::Auth);
        }
        Ok(RemoteSession::new(handle))
    }

    async fn resolve_mac(&self, ip: &str, reporter: &dyn Reporter) -> Result<String, Error> {
        probe::resolve_mac(ip, reporter).await
    }
}

/// One authenticated SSH connection to a device.
pub struct RemoteSession {
    handle: Handle<ClientHandler>,
    closed: AtomicBool,
}

impl RemoteSession {
    fn new(handle: Handle<ClientHandler>) -> Self {
        Self {
            handle,
            closed: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Network("session is closed".into()))
        } else {
            Ok(())
        }
    }

    pub(crate) async fn open_exec(
        &self,
        command: &str,
    ) -> Result<russh::Channel<client::Msg>, Error> {
        self.guard()?;
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(channel)
    }
}

impl DeviceSession for RemoteSession {
    async fn run_command(&self, command: &str, timeout: Duration) -> Result<String, Error> {
        let mut channel = self.open_exec(command).await?;
        let deadline = Instant::now() + timeout;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = None;
        loop {
            // The select produces a marker instead of acting on the channel
            // inside an arm, so the wait future's borrow ends first.
            let step = tokio::select! {
                msg = channel.wait() => Some(msg),
                () = tokio::time::sleep_until(deadline) => None,
            };
            let Some(msg) = step else {
                let _ = channel.signal(Sig::KILL).await;
                let _ = channel.eof().await;
                return Err(Error::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            };
            match msg {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    stderr.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                Some(_) => {}
                None => break,
            }
        }

        let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        match status {
            Some(0) => Ok(stdout),
            Some(code) => Err(Error::Command {
                command: command.to_string(),
                status: code,
                stderr,
            }),
            None => Err(Error::Network(format!(
                "session closed before '{command}' reported an exit status"
            ))),
        }
    }

    async fn run_command_streaming(
        &self,
        command: &str,
        timeout: Duration,
        reporter: &dyn Reporter,
    ) -> Result<(), Error> {
        let mut channel = self.open_exec(command).await?;
        let deadline = Instant::now() + timeout;

        let mut out_lines = LineSplitter::new();
        let mut err_lines = LineSplitter::new();
        let mut stderr_acc = String::new();
        let mut status = None;
        let mut timed_out = false;

        loop {
            let step = tokio::select! {
                msg = channel.wait() => Some(msg),
                () = tokio::time::sleep_until(deadline) => None,
            };
            let Some(msg) = step else {
                let _ = channel.signal(Sig::KILL).await;
                let _ = channel.eof().await;
                timed_out = true;
                drain_after_kill(&mut channel, &mut out_lines, &mut err_lines, reporter).await;
                break;
            };
            match msg {
                Some(ChannelMsg::Data { data }) => {
                    out_lines.push(&data, &mut |line| reporter.log(line, ""));
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    err_lines.push(&data, &mut |line| {
                        append_line(&mut stderr_acc, line);
                        reporter.log(line, "");
                    });
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                Some(_) => {}
                None => break,
            }
        }

        out_lines.finish(&mut |line| reporter.log(line, ""));
        err_lines.finish(&mut |line| {
            append_line(&mut stderr_acc, line);
            reporter.log(line, "");
        });

        if timed_out {
            return Err(Error::Timeout {
                command: command.to_string(),
                timeout,
            });
        }
        match status {
            Some(0) => Ok(()),
            Some(code) => Err(Error::Command {
                command: command.to_string(),
                status: code,
                stderr: stderr_acc,
            }),
            None => Err(Error::Network(format!(
                "session closed before '{command}' reported an exit status"
            ))),
        }
    }

    async fn copy_to(
        &self,
        cancel: &CancellationToken,
        local: &Path,
        remote: &str,
        reporter: &dyn Reporter,
    ) -> Result<(), Error> {
        transfer::copy_path_to_device(self, cancel, local, remote, reporter).await
    }

    async fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self
                .handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

async fn drain_after_kill(
    channel: &mut russh::Channel<client::Msg>,
    out_lines: &mut LineSplitter,
    err_lines: &mut LineSplitter,
    reporter: &dyn Reporter,
) {
    let grace = Instant::now() + STREAM_DRAIN_GRACE;
    loop {
        let msg = tokio::select! {
            msg = channel.wait() => msg,
            () = tokio::time::sleep_until(grace) => break,
        };
        match msg {
            Some(ChannelMsg::Data { data }) => {
                out_lines.push(&data, &mut |line| reporter.log(line, ""));
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                err_lines.push(&data, &mut |line| reporter.log(line, ""));
            }
            Some(_) => {}
            None => break,
        }
    }
}

fn append_line(acc: &mut String, line: &str) {
    if !acc.is_empty() {
        acc.push('\n');
    }
    acc.push_str(line);
}

/// Splits a byte stream into lines on both `\n` and `\r`, so that
/// carriage-return-updated progress output is surfaced line by line.
pub(crate) struct LineSplitter {
    buf: String,
}

impl LineSplitter {
    pub(crate) fn new() -> Self {
        Self { buf: String::new() }
    }

    pub(crate) fn push(&mut self, bytes: &[u8], emit: &mut dyn FnMut(&str)) {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        while let Some(idx) = self.buf.find(['\n', '\r']) {
            let line: String = self.buf[..idx].to_string();
            self.buf.drain(..=idx);
            let line = line.trim();
            if !line.is_empty() {
                emit(line);
            }
        }
    }

    /// Flushes any trailing partial line.
    pub(crate) fn finish(&mut self, emit: &mut dyn FnMut(&str)) {
        let line = std::mem::take(&mut self.buf);
        let line = line.trim();
        if !line.is_empty() {
            emit(line);
        }
    }
}

/// Single-quotes `arg` for the remote POSIX shell.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", arg.replace('\'', "'\"'\"'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&str]) -> Vec<String> {
        let mut splitter = LineSplitter::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            splitter.push(chunk.as_bytes(), &mut |line| lines.push(line.to_string()));
        }
        splitter.finish(&mut |line| lines.push(line.to_string()));
        lines
    }

    // -----------------------------------------------------------------------
    // LineSplitter
    // -----------------------------------------------------------------------

    #[test]
    fn test_line_splitter_splits_on_newline_and_carriage_return() {
        let lines = collect(&["progress 10%\rprogress 50%\rdone\n"]);
        assert_eq!(lines, vec!["progress 10%", "progress 50%", "done"]);
    }

    #[test]
    fn test_line_splitter_joins_partial_chunks() {
        let lines = collect(&["hel", "lo\nwor", "ld"]);
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn test_line_splitter_drops_empty_segments() {
        let lines = collect(&["\r\n\r\n  \na\n"]);
        assert_eq!(lines, vec!["a"]);
    }

    #[test]
    fn test_line_splitter_flushes_trailing_line_on_finish() {
        let lines = collect(&["no trailing newline"]);
        assert_eq!(lines, vec!["no trailing newline"]);
    }

    // -----------------------------------------------------------------------
    // shell_quote
    // -----------------------------------------------------------------------

    #[test]
    fn test_shell_quote_wraps_in_single_quotes() {
        assert_eq!(shell_quote("/home/update"), "'/home/update'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }
}
