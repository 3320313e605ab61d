//! The byte pump between a session channel and a local endpoint.
//!
//! One loop serves both sides of the connection: on the server the
//! endpoint is a spawned shell ([`crate::shell::ShellProcess`]), on the
//! client it is the local terminal ([`crate::console::ConsoleOutput`]).
//!
//! Each cycle first checks whether the channel closed, then waits for
//! whichever comes first: data from the peer, written to the endpoint,
//! or output from the endpoint, sent to the peer. Endpoint reads are
//! bounded by [`POLL_INTERVAL`]; an empty poll is not an error.
use std::future::Future;
use std::io;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::Error;

mod channel;
pub use channel::SessionChannel;

/// Largest chunk moved in one cycle, in either direction.
pub const CHUNK_SIZE: usize = 2048;

/// How long one cycle waits for the endpoint before looking at the
/// channel again.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle of a channel as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// We sent EOF and are about to close.
    ShuttingDown,
    Closed,
}

/// What the peer sent.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Data(Vec<u8>),
    /// The peer will send no more data, but may still read.
    Eof,
    Closed,
}

/// Result of one bounded endpoint read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRead {
    /// This many bytes were read into the buffer.
    Data(usize),
    /// Nothing arrived before the deadline.
    Pending,
    /// The endpoint finished, e.g. the process exited.
    Eof,
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    ChannelClosed,
    EndpointFinished,
}

/// The network side of a relay.
///
/// `recv` must be cancel safe: the relay drops it whenever the endpoint
/// is ready first.
pub trait RelayChannel: Send {
    fn state(&self) -> ChannelState;

    fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    fn is_active(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Wait for at most `max_len` bytes from the peer.
    fn recv(&mut self, max_len: usize) -> impl Future<Output = Inbound> + Send;

    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Half-close: tell the peer no more data follows.
    fn shutdown(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// The local side of a relay.
///
/// `read_nonblocking` must be cancel safe, for the same reason as
/// [`RelayChannel::recv`].
pub trait RelayEndpoint: Send {
    /// Read into `buf`, waiting at most `wait`.
    fn read_nonblocking(
        &mut self,
        buf: &mut [u8],
        wait: Duration,
    ) -> impl Future<Output = io::Result<EndpointRead>> + Send;

    fn write(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// The peer sent EOF; close whatever feeds the endpoint.
    fn close_input(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Stop the endpoint for good. Called once, after the channel is
    /// closed.
    fn terminate(&mut self) -> impl Future<Output = ()> + Send;
}

/// Pump bytes between `channel` and `endpoint` until one of them ends,
/// then close the channel and terminate the endpoint, in that order.
pub async fn run<C, E>(channel: &mut C, endpoint: &mut E) -> Result<RelayOutcome, Error>
where
    C: RelayChannel,
    E: RelayEndpoint,
{
    let outcome = pump(channel, endpoint).await;
    if let Err(ref e) = outcome {
        debug!("relay stopped: {}", e);
    }
    if channel.is_active() {
        if let Err(e) = channel.shutdown().await {
            debug!("could not send EOF: {}", e);
        }
        if let Err(e) = channel.close().await {
            debug!("could not close channel: {}", e);
        }
    }
    endpoint.terminate().await;
    outcome
}

async fn pump<C, E>(channel: &mut C, endpoint: &mut E) -> Result<RelayOutcome, Error>
where
    C: RelayChannel,
    E: RelayEndpoint,
{
    let mut buf = vec![0; CHUNK_SIZE];
    let mut input_open = true;
    loop {
        if channel.is_closed() {
            return Ok(RelayOutcome::ChannelClosed);
        }
        tokio::select! {
            biased;
            inbound = channel.recv(CHUNK_SIZE) => match inbound {
                Inbound::Data(data) => {
                    if input_open {
                        endpoint.write(&data).await?;
                    } else {
                        warn!("dropping {} bytes received after EOF", data.len());
                    }
                }
                Inbound::Eof => {
                    if input_open {
                        input_open = false;
                        endpoint.close_input().await?;
                    }
                }
                Inbound::Closed => return Ok(RelayOutcome::ChannelClosed),
            },
            read = endpoint.read_nonblocking(&mut buf, POLL_INTERVAL) => match read? {
                EndpointRead::Data(n) => {
                    let data = buf.get(..n).unwrap_or(buf.as_slice());
                    channel.send(data).await?;
                }
                EndpointRead::Pending => trace!("nothing ready"),
                EndpointRead::Eof => return Ok(RelayOutcome::EndpointFinished),
            },
        }
    }
}
