//! Object-channel collaborator: a transport that already exchanges
//! structured messages, so no framing is involved.
use crate::jsonrpc::types::Message;
use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Send half of an object channel.
#[async_trait]
pub trait ChannelSender: Send + 'static {
    async fn send(&mut self, message: Message) -> anyhow::Result<()>;
}

/// Receive half of an object channel. `None` means the peer went away.
#[async_trait]
pub trait ChannelReceiver: Send + 'static {
    async fn recv(&mut self) -> Option<anyhow::Result<Message>>;
}

#[async_trait]
impl ChannelSender for mpsc::UnboundedSender<Message> {
    async fn send(&mut self, message: Message) -> anyhow::Result<()> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| anyhow!("channel closed"))
    }
}

#[async_trait]
impl ChannelSender for mpsc::Sender<Message> {
    async fn send(&mut self, message: Message) -> anyhow::Result<()> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| anyhow!("channel closed"))
    }
}

#[async_trait]
impl ChannelReceiver for mpsc::UnboundedReceiver<Message> {
    async fn recv(&mut self) -> Option<anyhow::Result<Message>> {
        mpsc::UnboundedReceiver::recv(self).await.map(Ok)
    }
}

#[async_trait]
impl ChannelReceiver for mpsc::Receiver<Message> {
    async fn recv(&mut self) -> Option<anyhow::Result<Message>> {
        mpsc::Receiver::recv(self).await.map(Ok)
    }
}

/// One side of an in-process object channel.
pub struct ChannelEnd {
    pub sender: mpsc::UnboundedSender<Message>,
    pub receiver: mpsc::UnboundedReceiver<Message>,
}

/// Two cross-connected channel ends: what one side sends the other receives.
pub fn channel_pair() -> (ChannelEnd, ChannelEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        ChannelEnd {
            sender: a_tx,
            receiver: a_rx,
        },
        ChannelEnd {
            sender: b_tx,
            receiver: b_rx,
        },
    )
}
