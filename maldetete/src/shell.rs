//! Interactive shells spawned for authenticated peers.
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use russh::{Channel, ChannelId, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::relay::{self, EndpointRead, RelayEndpoint, SessionChannel, CHUNK_SIZE};

/// The program run for each shell request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for ShellCommand {
    fn default() -> Self {
        ShellCommand {
            program: PathBuf::from("/bin/bash"),
            args: vec!["-i".into()],
        }
    }
}

impl ShellCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        ShellCommand {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Start the program with piped standard streams. The child is killed
    /// if the returned handle is dropped.
    pub fn spawn(&self) -> io::Result<ShellProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TERM", "dumb")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!("spawned {} as pid {:?}", self.program.display(), child.id());
        Ok(ShellProcess {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            scratch: vec![0; CHUNK_SIZE],
            child,
        })
    }
}

/// A running shell, usable as the local end of a relay.
///
/// Standard output and standard error are both forwarded. The process
/// counts as finished once both are closed.
pub struct ShellProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    scratch: Vec<u8>,
}

enum Stream {
    Out,
    Err,
}

async fn read_stream<R: AsyncRead + Unpin>(stream: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => std::future::pending().await,
    }
}

impl ShellProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl RelayEndpoint for ShellProcess {
    async fn read_nonblocking(&mut self, buf: &mut [u8], wait: Duration) -> io::Result<EndpointRead> {
        if self.stdout.is_none() && self.stderr.is_none() {
            return Ok(EndpointRead::Eof);
        }
        let len = buf.len().min(self.scratch.len());
        let read = tokio::time::timeout(wait, async {
            let scratch = self.scratch.get_mut(..len).unwrap_or_default();
            tokio::select! {
                r = read_stream(&mut self.stdout, buf) => (Stream::Out, r),
                r = read_stream(&mut self.stderr, scratch) => (Stream::Err, r),
            }
        })
        .await;
        let (stream, n) = match read {
            Err(_) => return Ok(EndpointRead::Pending),
            Ok((stream, n)) => (stream, n?),
        };
        match (stream, n) {
            (Stream::Out, 0) => {
                debug!("shell closed its standard output");
                self.stdout = None;
            }
            (Stream::Err, 0) => {
                debug!("shell closed its standard error");
                self.stderr = None;
            }
            (Stream::Out, n) => return Ok(EndpointRead::Data(n)),
            (Stream::Err, n) => {
                for (dst, src) in buf.iter_mut().zip(self.scratch.iter().take(n)) {
                    *dst = *src;
                }
                return Ok(EndpointRead::Data(n));
            }
        }
        if self.stdout.is_none() && self.stderr.is_none() {
            Ok(EndpointRead::Eof)
        } else {
            Ok(EndpointRead::Pending)
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        stdin.write_all(data).await?;
        stdin.flush().await
    }

    async fn close_input(&mut self) -> io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.start_kill() {
            debug!("shell already gone: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => debug!("shell exited with {}", status),
            Err(e) => warn!("could not reap shell: {}", e),
        }
    }
}

/// Relay `channel` to `process` until either ends.
pub async fn bridge<S>(channel: Channel<S>, mut process: ShellProcess)
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let mut channel = SessionChannel::new(channel);
    let id = channel.id();
    match relay::run(&mut channel, &mut process).await {
        Ok(outcome) => info!("{}: shell session ended ({:?})", id, outcome),
        Err(e) => warn!("{}: shell session failed: {}", id, e),
    }
}
