use log::{debug, trace};
use russh::{Channel, ChannelId, ChannelMsg};

use super::{ChannelState, Inbound, RelayChannel};
use crate::Error;

/// A russh session channel seen through [`RelayChannel`].
///
/// Data messages larger than the relay asks for are kept and handed out
/// on the next calls. Standard error data from the peer is merged with
/// regular data.
pub struct SessionChannel<S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static> {
    channel: Channel<S>,
    pending: Vec<u8>,
    state: ChannelState,
}

impl<S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static> SessionChannel<S> {
    pub fn new(channel: Channel<S>) -> Self {
        SessionChannel {
            channel,
            pending: Vec::new(),
            state: ChannelState::Open,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    fn take_pending(&mut self, max_len: usize) -> Vec<u8> {
        if self.pending.len() <= max_len {
            return std::mem::take(&mut self.pending);
        }
        let rest = self.pending.split_off(max_len);
        std::mem::replace(&mut self.pending, rest)
    }
}

impl<S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static> RelayChannel for SessionChannel<S> {
    fn state(&self) -> ChannelState {
        self.state
    }

    async fn recv(&mut self, max_len: usize) -> Inbound {
        if !self.pending.is_empty() {
            return Inbound::Data(self.take_pending(max_len));
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if data.is_empty() {
                        continue;
                    }
                    self.pending.extend_from_slice(&data);
                    return Inbound::Data(self.take_pending(max_len));
                }
                Some(ChannelMsg::Eof) => {
                    debug!("{:?}: peer sent EOF", self.channel.id());
                    return Inbound::Eof;
                }
                Some(ChannelMsg::Close) | None => {
                    debug!("{:?}: peer closed the channel", self.channel.id());
                    self.state = ChannelState::Closed;
                    return Inbound::Closed;
                }
                Some(msg) => trace!("{:?}: ignoring {:?}", self.channel.id(), msg),
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == ChannelState::Closed {
            return Err(Error::ChannelClosed);
        }
        self.channel.data(data).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Error> {
        if self.state == ChannelState::Open {
            self.state = ChannelState::ShuttingDown;
            self.channel.eof().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Closed;
            self.channel.close().await?;
        }
        Ok(())
    }
}
