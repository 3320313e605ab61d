//! The client's local terminal as the end of a relay.
//!
//! Output from the server is written to standard output by the relay
//! loop. Keyboard input is forwarded by a separate task, since reading
//! standard input cannot be bounded by a deadline without losing bytes.
use std::io;
use std::time::Duration;

use log::debug;
use russh::{Channel, ChannelId, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::relay::{self, EndpointRead, RelayChannel, RelayEndpoint, RelayOutcome, SessionChannel, CHUNK_SIZE};
use crate::Error;

/// Writes everything the server sends to `W`.
pub struct ConsoleOutput<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin + Send> ConsoleOutput<W> {
    pub fn new(output: W) -> Self {
        ConsoleOutput { output }
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

impl<W: AsyncWrite + Unpin + Send> RelayEndpoint for ConsoleOutput<W> {
    /// The console produces nothing here; input goes through
    /// [`forward_input`]. Waiting paces the relay loop.
    async fn read_nonblocking(&mut self, _buf: &mut [u8], wait: Duration) -> io::Result<EndpointRead> {
        tokio::time::sleep(wait).await;
        Ok(EndpointRead::Pending)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.output.write_all(data).await?;
        self.output.flush().await
    }

    async fn close_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.output.flush().await {
            debug!("could not flush the console: {}", e);
        }
    }
}

/// Copy `input` to `channel` until `input` ends or `stop` is signalled.
/// At the end of input the channel writer is shut down, which sends EOF.
pub async fn forward_input<R, W>(mut input: R, mut channel: W, mut stop: watch::Receiver<bool>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            read = input.read(&mut buf) => match read? {
                0 => {
                    debug!("end of local input");
                    channel.shutdown().await?;
                    return Ok(());
                }
                n => {
                    let data = buf.get(..n).unwrap_or(buf.as_slice());
                    channel.write_all(data).await?;
                    channel.flush().await?;
                }
            },
        }
    }
}

/// Relay `channel` to `output` while a second task forwards `input`
/// through `channel_writer`. The input task is stopped and joined before
/// this returns.
pub async fn bridge<C, R, W, O>(
    channel: &mut C,
    channel_writer: W,
    input: R,
    output: &mut ConsoleOutput<O>,
) -> Result<RelayOutcome, Error>
where
    C: RelayChannel,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let forwarder = tokio::spawn(forward_input(input, channel_writer, stop_rx));
    let outcome = relay::run(channel, output).await;
    let _ = stop_tx.send(true);
    match forwarder.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("input forwarding stopped: {}", e),
        Err(e) => debug!("input task failed: {}", e),
    }
    outcome
}

/// Relay a shell channel to this process's standard input and output.
pub async fn run<S>(channel: Channel<S>) -> Result<RelayOutcome, Error>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let writer = Box::pin(channel.make_writer());
    let stdin = tokio_fd::AsyncFd::try_from(0)?;
    let mut stdout = ConsoleOutput::new(tokio_fd::AsyncFd::try_from(1)?);
    let mut channel = SessionChannel::new(channel);
    bridge(&mut channel, writer, stdin, &mut stdout).await
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use crate::relay::test::{FakeChannel, Journal};
    use crate::relay::Inbound;

    use super::*;

    #[tokio::test]
    async fn prints_server_output() {
        let journal = Journal::default();
        let mut channel = FakeChannel::new(
            vec![
                Inbound::Data(b"$ ".to_vec()),
                Inbound::Data(b"hello\n".to_vec()),
                Inbound::Closed,
            ],
            &journal,
        );
        let (_keyboard, input) = tokio::io::duplex(64);
        let (writer, _sent) = tokio::io::duplex(64);
        let mut output = ConsoleOutput::new(Vec::new());

        let outcome = bridge(&mut channel, writer, input, &mut output)
            .await
            .unwrap();

        assert_eq!(outcome, RelayOutcome::ChannelClosed);
        assert_eq!(output.into_inner(), b"$ hello\n");
    }

    #[tokio::test]
    async fn forwards_keys_then_eof() {
        let (writer, mut sent) = tokio::io::duplex(64);
        let (_stop_tx, stop_rx) = watch::channel(false);

        forward_input(&b"echo hello\n"[..], writer, stop_rx)
            .await
            .unwrap();

        let mut forwarded = Vec::new();
        sent.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"echo hello\n");
    }

    #[tokio::test]
    async fn input_stops_when_signalled() {
        let (_keyboard, input) = tokio::io::duplex(64);
        let (writer, _sent) = tokio::io::duplex(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(forward_input(input, writer, stop_rx));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn console_read_only_paces() {
        let mut output = ConsoleOutput::new(Vec::new());
        let mut buf = [0u8; 16];
        let read = output
            .read_nonblocking(&mut buf, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(read, EndpointRead::Pending);
    }
}
