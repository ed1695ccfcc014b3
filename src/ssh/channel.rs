use super::session::map_ssh_error;
use crate::errors::StepError;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelExit {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// One remote command invocation on a transport session.
///
/// After `exec`, reads and writes are non-blocking: no data available is
/// reported as `io::ErrorKind::WouldBlock`, and `Ok(0)` means the stream is done.
pub trait ExecChannel: Send {
    fn exec(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        pty: bool,
    ) -> Result<(), StepError>;
    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize>;
    fn send_eof(&mut self) -> io::Result<()>;
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn eof(&self) -> bool;
    /// Waits for the remote side to close and collects the exit status.
    fn finish(&mut self) -> ChannelExit;
    /// Forcibly closes the channel. Idempotent.
    fn close(&mut self);
    /// Closes the channel and waits up to `grace` for the remote side to
    /// confirm. Returns false when it never did.
    fn close_within(&mut self, grace: Duration) -> bool;
    fn is_closed(&self) -> bool;
}

pub struct Ssh2Channel {
    session: ssh2::Session,
    channel: ssh2::Channel,
    closed: bool,
}

impl Ssh2Channel {
    pub(crate) fn new(session: ssh2::Session, channel: ssh2::Channel) -> Self {
        Self {
            session,
            channel,
            closed: false,
        }
    }
}

impl ExecChannel for Ssh2Channel {
    fn exec(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        pty: bool,
    ) -> Result<(), StepError> {
        if pty {
            let _ = self.channel.request_pty("xterm", None, None);
        }
        // sshd drops variables outside AcceptEnv; the command still runs.
        for (key, value) in env {
            let _ = self.channel.setenv(key, value);
        }
        self.channel.exec(command).map_err(map_ssh_error)?;
        self.session.set_blocking(false);
        Ok(())
    }

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize> {
        self.channel.write(data)
    }

    fn send_eof(&mut self) -> io::Result<()> {
        self.channel.send_eof().map_err(io::Error::from)
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.stderr().read(buf)
    }

    fn eof(&self) -> bool {
        self.channel.eof()
    }

    fn finish(&mut self) -> ChannelExit {
        self.session.set_blocking(true);
        let _ = self.channel.wait_close();
        self.closed = true;
        ChannelExit {
            exit_code: self.channel.exit_status().ok(),
            signal: self
                .channel
                .exit_signal()
                .ok()
                .and_then(|sig| sig.exit_signal),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.session.set_blocking(true);
        let _ = self.channel.close();
        self.closed = true;
    }

    fn close_within(&mut self, grace: Duration) -> bool {
        self.close();
        let previous = self.session.timeout();
        self.session
            .set_timeout(grace.as_millis().clamp(1, u32::MAX as u128) as u32);
        let acknowledged = self.channel.wait_close().is_ok();
        self.session.set_timeout(previous);
        acknowledged
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
